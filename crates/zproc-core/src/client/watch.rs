//! Reactive reads.
//!
//! Every watcher follows the same skeleton: open a subscription (capturing
//! the registration revision R0), optionally test the current state when a
//! pre-registration satisfaction is acceptable, then consume change records
//! in revision order and return on the first match. A timeout tears the
//! subscription down and fails with [`ZprocError::WatchTimeout`].
//!
//! Equality and presence watchers match directly against the delivered
//! records. Arbitrary predicates are evaluated client-side against a
//! snapshot kept current by applying each record; they are never shipped to
//! the server.

use super::{StateClient, StateSnapshot};
use crate::codec::ChangeRecord;
use crate::error::{Result, ZprocError};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Options shared by every watcher.
///
/// `only_live` defaults per watcher: equality and predicate watchers refuse
/// pre-registration satisfactions (`true`), presence watchers accept them
/// (`false`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    timeout: Option<Duration>,
    only_live: Option<bool>,
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with a timeout error when no match arrives within `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Require (`true`) or allow (`false`) a match by the state as it
    /// already is, overriding the watcher's default.
    pub fn live_only(mut self, only_live: bool) -> Self {
        self.only_live = Some(only_live);
        self
    }

    fn resolve_live(self, default: bool) -> bool {
        self.only_live.unwrap_or(default)
    }
}

async fn with_deadline<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(waited) => tokio::time::timeout(waited, fut)
            .await
            .map_err(|_| ZprocError::WatchTimeout { waited })?,
        None => fut.await,
    }
}

/// Apply one change record to a locally maintained snapshot.
fn apply_record(snapshot: &mut StateSnapshot, record: &ChangeRecord) {
    for (key, change) in &record.changes {
        if change.exists_after {
            snapshot.entries.insert(
                key.clone(),
                change.after.clone().unwrap_or(Value::Null),
            );
        } else {
            snapshot.entries.remove(key);
        }
    }
    snapshot.revision = record.revision;
}

impl StateClient {
    /// Wait for the next revision that touches `key`; returns the key's new
    /// value (`None` when the change removed it).
    pub async fn get_when_change(&self, key: &str, opts: WatchOptions) -> Result<Option<Value>> {
        with_deadline(opts.timeout, async {
            let mut sub = self.subscribe(Some(vec![key.to_string()])).await?;
            let record = sub.next().await?;
            let change = record.changes.get(key).ok_or_else(|| {
                ZprocError::protocol(format!("filtered record does not touch '{}'", key))
            })?;
            Ok(change.after.clone())
        })
        .await
    }

    /// Wait for the next revision touching any key; returns a fresh full
    /// snapshot taken after it.
    pub async fn get_when_any_change(&self, opts: WatchOptions) -> Result<StateSnapshot> {
        with_deadline(opts.timeout, async {
            let mut sub = self.subscribe(None).await?;
            sub.next().await?;
            self.snapshot().await
        })
        .await
    }

    /// Wait until `state[key] == value`; returns the matched value.
    ///
    /// By default only a live change satisfies the watch; pass
    /// `WatchOptions::new().live_only(false)` to accept the current state.
    pub async fn get_when_equal(
        &self,
        key: &str,
        value: Value,
        opts: WatchOptions,
    ) -> Result<Value> {
        let only_live = opts.resolve_live(true);
        with_deadline(opts.timeout, async {
            let mut sub = self.subscribe(Some(vec![key.to_string()])).await?;
            if !only_live {
                if let Some(current) = self.get(key).await? {
                    if current == value {
                        return Ok(current);
                    }
                }
            }
            loop {
                let record = sub.next().await?;
                if let Some(change) = record.changes.get(key) {
                    if change.after.as_ref() == Some(&value) {
                        return Ok(value);
                    }
                }
            }
        })
        .await
    }

    /// Wait until `key` exists with a value other than `value`; returns
    /// that value.
    pub async fn get_when_not_equal(
        &self,
        key: &str,
        value: Value,
        opts: WatchOptions,
    ) -> Result<Value> {
        let only_live = opts.resolve_live(true);
        with_deadline(opts.timeout, async {
            let mut sub = self.subscribe(Some(vec![key.to_string()])).await?;
            if !only_live {
                if let Some(current) = self.get(key).await? {
                    if current != value {
                        return Ok(current);
                    }
                }
            }
            loop {
                let record = sub.next().await?;
                if let Some(change) = record.changes.get(key) {
                    if change.exists_after && change.after.as_ref() != Some(&value) {
                        return Ok(change.after.clone().unwrap_or(Value::Null));
                    }
                }
            }
        })
        .await
    }

    /// Wait until `key` is present; returns its value. Presence is never a
    /// stale satisfaction, so by default the current state may match
    /// immediately.
    pub async fn get_when_available(&self, key: &str, opts: WatchOptions) -> Result<Value> {
        let only_live = opts.resolve_live(false);
        with_deadline(opts.timeout, async {
            let mut sub = self.subscribe(Some(vec![key.to_string()])).await?;
            if !only_live {
                if let Some(current) = self.get(key).await? {
                    return Ok(current);
                }
            }
            loop {
                let record = sub.next().await?;
                if let Some(change) = record.changes.get(key) {
                    if change.exists_after {
                        return Ok(change.after.clone().unwrap_or(Value::Null));
                    }
                }
            }
        })
        .await
    }

    /// Wait until `predicate` holds over a full snapshot; returns the
    /// satisfying snapshot. The predicate runs client-side after each
    /// change, against a snapshot maintained from the change records.
    pub async fn get_when<F>(&self, predicate: F, opts: WatchOptions) -> Result<StateSnapshot>
    where
        F: Fn(&StateSnapshot) -> bool,
    {
        let only_live = opts.resolve_live(true);
        with_deadline(opts.timeout, async {
            let mut sub = self.subscribe(None).await?;
            let mut snapshot = self.snapshot().await?;

            // The fetched snapshot may already include revisions committed
            // after registration; testing it then respects live-only.
            let testable = !only_live || snapshot.revision > sub.registration_revision();
            if testable && predicate(&snapshot) {
                return Ok(snapshot);
            }

            loop {
                let record = sub.next().await?;
                if record.revision <= snapshot.revision {
                    // Already folded into the fetched snapshot.
                    continue;
                }
                apply_record(&mut snapshot, &record);
                if predicate(&snapshot) {
                    return Ok(snapshot);
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::KeyChange;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_watch_options_defaults() {
        let opts = WatchOptions::new();
        assert!(opts.resolve_live(true));
        assert!(!opts.resolve_live(false));

        let opts = WatchOptions::new().live_only(false);
        assert!(!opts.resolve_live(true));
    }

    #[test]
    fn test_apply_record_inserts_and_removes() {
        let mut snapshot = StateSnapshot {
            revision: 3,
            entries: serde_json::Map::new(),
        };
        snapshot.entries.insert("gone".to_string(), json!(1));

        let mut changes = BTreeMap::new();
        changes.insert(
            "gone".to_string(),
            KeyChange {
                before: Some(json!(1)),
                after: None,
                existed_before: true,
                exists_after: false,
            },
        );
        changes.insert(
            "fresh".to_string(),
            KeyChange {
                before: None,
                after: Some(json!(null)),
                existed_before: false,
                exists_after: true,
            },
        );
        let record = ChangeRecord {
            revision: 4,
            changes,
        };

        apply_record(&mut snapshot, &record);

        assert_eq!(snapshot.revision, 4);
        assert!(!snapshot.contains("gone"));
        // Null is a stored value, not absence.
        assert_eq!(snapshot.get("fresh"), Some(&Value::Null));
    }
}
