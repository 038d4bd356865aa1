//! Canonical state and the mutation/diff engine.
//!
//! One instance lives inside the state task. Mutating operations compute the
//! per-key deltas, bump the revision counter, and hand back the change
//! record to publish. Mutations whose post-state structurally equals the
//! pre-state commit no revision and publish nothing, so every revision maps
//! to exactly one non-empty change record.

use crate::atomic::{AtomicRegistry, StateView};
use crate::codec::{ChangeRecord, KeyChange, Op, ReplyBody};
use crate::error::{panic_message, Result, ZprocError};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};

pub(crate) struct ServerState {
    entries: HashMap<String, Value>,
    revision: u64,
    server_id: String,
    atomics: AtomicRegistry,
}

impl ServerState {
    pub(crate) fn new(atomics: AtomicRegistry) -> Self {
        Self {
            entries: HashMap::new(),
            revision: 0,
            server_id: format!("zproc-{}-{:08x}", std::process::id(), rand::random::<u32>()),
            atomics,
        }
    }

    pub(crate) fn revision(&self) -> u64 {
        self.revision
    }

    /// Apply one operation. Returns the reply body and, for a committed
    /// mutation, the change record to publish before replying.
    pub(crate) fn apply(&mut self, op: Op) -> (Result<ReplyBody>, Option<ChangeRecord>) {
        match op {
            Op::Get { key } => (
                Ok(ReplyBody::Value {
                    value: self.entries.get(&key).cloned(),
                }),
                None,
            ),
            Op::GetAll => (
                Ok(ReplyBody::Snapshot {
                    revision: self.revision,
                    entries: self.entries.clone().into_iter().collect(),
                }),
                None,
            ),
            Op::Set { key, value } => {
                let before = self.entries.get(&key).cloned();
                if before.as_ref() == Some(&value) {
                    return (
                        Ok(ReplyBody::Revision {
                            revision: self.revision,
                        }),
                        None,
                    );
                }
                self.entries.insert(key.clone(), value.clone());
                let record = self.commit_one(key, before, Some(value));
                (
                    Ok(ReplyBody::Revision {
                        revision: record.revision,
                    }),
                    Some(record),
                )
            }
            Op::Delete { key } => match self.entries.remove(&key) {
                Some(before) => {
                    let record = self.commit_one(key, Some(before), None);
                    (
                        Ok(ReplyBody::Revision {
                            revision: record.revision,
                        }),
                        Some(record),
                    )
                }
                None => (Err(ZprocError::KeyMissing { key }), None),
            },
            Op::UpdateMany { delta } => {
                let mut changes = BTreeMap::new();
                for (key, value) in delta {
                    let before = self.entries.get(&key).cloned();
                    if before.as_ref() == Some(&value) {
                        continue;
                    }
                    self.entries.insert(key.clone(), value.clone());
                    changes.insert(key, key_change(before, Some(value)));
                }
                if changes.is_empty() {
                    return (
                        Ok(ReplyBody::Revision {
                            revision: self.revision,
                        }),
                        None,
                    );
                }
                let record = self.commit(changes);
                (
                    Ok(ReplyBody::Revision {
                        revision: record.revision,
                    }),
                    Some(record),
                )
            }
            Op::Atomic {
                handler,
                args,
                kwargs,
            } => self.apply_atomic(&handler, &args, &kwargs),
            Op::Ping => (
                Ok(ReplyBody::Pong {
                    server_id: self.server_id.clone(),
                    revision: self.revision,
                }),
                None,
            ),
            Op::Contains { key } => (
                Ok(ReplyBody::Bool {
                    value: self.entries.contains_key(&key),
                }),
                None,
            ),
            Op::Keys => {
                let mut keys: Vec<String> = self.entries.keys().cloned().collect();
                keys.sort();
                (Ok(ReplyBody::Keys { keys }), None)
            }
            Op::Len => (
                Ok(ReplyBody::Len {
                    len: self.entries.len() as u64,
                }),
                None,
            ),
            Op::Pop { key } => match self.entries.remove(&key) {
                Some(before) => {
                    let record = self.commit_one(key, Some(before.clone()), None);
                    (
                        Ok(ReplyBody::Popped {
                            value: Some(before),
                            revision: record.revision,
                        }),
                        Some(record),
                    )
                }
                None => (
                    Ok(ReplyBody::Popped {
                        value: None,
                        revision: self.revision,
                    }),
                    None,
                ),
            },
            Op::SetDefault { key, value } => {
                if let Some(existing) = self.entries.get(&key) {
                    return (
                        Ok(ReplyBody::Defaulted {
                            value: existing.clone(),
                            revision: self.revision,
                        }),
                        None,
                    );
                }
                self.entries.insert(key.clone(), value.clone());
                let record = self.commit_one(key, None, Some(value.clone()));
                (
                    Ok(ReplyBody::Defaulted {
                        value,
                        revision: record.revision,
                    }),
                    Some(record),
                )
            }
            Op::Clear => {
                if self.entries.is_empty() {
                    return (
                        Ok(ReplyBody::Revision {
                            revision: self.revision,
                        }),
                        None,
                    );
                }
                let mut changes = BTreeMap::new();
                for (key, before) in self.entries.drain() {
                    changes.insert(key, key_change(Some(before), None));
                }
                let record = self.commit(changes);
                (
                    Ok(ReplyBody::Revision {
                        revision: record.revision,
                    }),
                    Some(record),
                )
            }
        }
    }

    /// Run a named handler against a working copy, diff, commit once.
    ///
    /// The handler executes inside the state task with no other request
    /// running, so atomicity holds by construction. Handler errors and
    /// panics are captured and returned as user failures; the working copy
    /// is discarded on failure, so a failed handler commits nothing.
    fn apply_atomic(
        &mut self,
        name: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> (Result<ReplyBody>, Option<ChangeRecord>) {
        let handler = match self.atomics.get(name) {
            Ok(h) => h,
            Err(e) => return (Err(e), None),
        };

        let mut working = self.entries.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut view = StateView::new(&mut working);
            handler(&mut view, args, kwargs)
        }));

        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => return (Err(into_user_error(err)), None),
            Err(panic) => {
                return (
                    Err(ZprocError::User {
                        message: format!("handler '{}' panicked", name),
                        detail: panic_message(panic),
                    }),
                    None,
                )
            }
        };

        let changes = diff(&self.entries, &working);
        if changes.is_empty() {
            return (
                Ok(ReplyBody::Atomic {
                    value,
                    revision: self.revision,
                }),
                None,
            );
        }

        self.entries = working;
        let record = self.commit(changes);
        (
            Ok(ReplyBody::Atomic {
                value,
                revision: record.revision,
            }),
            Some(record),
        )
    }

    fn commit_one(
        &mut self,
        key: String,
        before: Option<Value>,
        after: Option<Value>,
    ) -> ChangeRecord {
        let mut changes = BTreeMap::new();
        changes.insert(key, key_change(before, after));
        self.commit(changes)
    }

    fn commit(&mut self, changes: BTreeMap<String, KeyChange>) -> ChangeRecord {
        debug_assert!(!changes.is_empty());
        self.revision += 1;
        ChangeRecord {
            revision: self.revision,
            changes,
        }
    }
}

/// Per-key structural diff between pre- and post-state.
fn diff(pre: &HashMap<String, Value>, post: &HashMap<String, Value>) -> BTreeMap<String, KeyChange> {
    let mut changes = BTreeMap::new();
    for (key, after) in post {
        match pre.get(key) {
            Some(before) if before == after => {}
            before => {
                changes.insert(key.clone(), key_change(before.cloned(), Some(after.clone())));
            }
        }
    }
    for (key, before) in pre {
        if !post.contains_key(key) {
            changes.insert(key.clone(), key_change(Some(before.clone()), None));
        }
    }
    changes
}

fn key_change(before: Option<Value>, after: Option<Value>) -> KeyChange {
    KeyChange {
        existed_before: before.is_some(),
        exists_after: after.is_some(),
        before,
        after,
    }
}

fn into_user_error(err: ZprocError) -> ZprocError {
    match err {
        user @ ZprocError::User { .. } => user,
        other => ZprocError::User {
            message: other.to_string(),
            detail: None,
        },
    }
}
