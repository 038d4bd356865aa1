//! Client-side state proxy.
//!
//! A [`StateClient`] is the handle a worker uses to talk to the state
//! server: mapping-style operations translate to one request/reply
//! round-trip each, and the reactive operations in [`crate::client::watch`]
//! ride the change-event channel. Clients are cheap to construct; each
//! process (and each concurrent task that issues overlapping watch calls)
//! creates its own.

mod subscriber;
mod watch;

pub use subscriber::Subscription;
pub use watch::WatchOptions;

use crate::codec::{self, Op, Reply, ReplyBody, Request};
use crate::config::ProtocolConfig;
use crate::discovery::Endpoints;
use crate::error::{Result, ZprocError};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// A full state snapshot together with the revision it reflects.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub revision: u64,
    pub entries: Map<String, Value>,
}

impl StateSnapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Server identity returned by [`StateClient::ping`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub server_id: String,
    pub revision: u64,
}

/// Proxy to a running state server.
///
/// Requests on the shared connection are serialized by an internal mutex,
/// so the proxy is safe to share across tasks of one process; watchers open
/// their own event connections and never block the request channel.
#[derive(Debug)]
pub struct StateClient {
    stream: Mutex<TcpStream>,
    endpoints: Endpoints,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl StateClient {
    /// Connect using the endpoints inherited from the environment.
    pub async fn connect() -> Result<Self> {
        Self::connect_to(Endpoints::from_env()?).await
    }

    /// Connect to explicit endpoints.
    pub async fn connect_to(endpoints: Endpoints) -> Result<Self> {
        let stream = tokio::time::timeout(
            ProtocolConfig::CONNECT_TIMEOUT,
            TcpStream::connect(endpoints.server_addr),
        )
        .await
        .map_err(|_| {
            ZprocError::transport(format!("timed out connecting to {}", endpoints.server_addr))
        })??;

        debug!("state client connected to {}", endpoints.server_addr);

        Ok(Self {
            stream: Mutex::new(stream),
            endpoints,
            next_id: AtomicU64::new(1),
            request_timeout: ProtocolConfig::REQUEST_TIMEOUT,
        })
    }

    /// Override the per-request server-liveness timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    /// One correlated round-trip.
    pub(crate) async fn call(&self, op: Op) -> Result<ReplyBody> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request { id, op };

        let mut stream = self.stream.lock().await;
        let (mut reader, mut writer) = stream.split();

        codec::write_message(&mut writer, &request).await?;

        let reply: Reply = tokio::time::timeout(self.request_timeout, codec::read_message(&mut reader))
            .await
            .map_err(|_| ZprocError::RequestTimeout {
                waited: self.request_timeout,
            })??
            .ok_or_else(|| ZprocError::transport("server closed the connection"))?;

        if reply.id != id {
            return Err(ZprocError::protocol(format!(
                "correlation mismatch: sent id {}, reply carries {}",
                id, reply.id
            )));
        }
        reply.into_result()
    }

    /// Read a key. `None` when absent.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.call(Op::Get { key: key.to_string() }).await? {
            ReplyBody::Value { value } => Ok(value),
            other => Err(unexpected("get", &other)),
        }
    }

    /// Full snapshot with its revision.
    pub async fn snapshot(&self) -> Result<StateSnapshot> {
        match self.call(Op::GetAll).await? {
            ReplyBody::Snapshot { revision, entries } => Ok(StateSnapshot { revision, entries }),
            other => Err(unexpected("snapshot", &other)),
        }
    }

    /// Write a key, returning the server revision after the write.
    pub async fn set(&self, key: &str, value: Value) -> Result<u64> {
        match self
            .call(Op::Set {
                key: key.to_string(),
                value,
            })
            .await?
        {
            ReplyBody::Revision { revision } => Ok(revision),
            other => Err(unexpected("set", &other)),
        }
    }

    /// Delete a key. Strict: fails with [`ZprocError::KeyMissing`] when the
    /// key is absent.
    pub async fn delete(&self, key: &str) -> Result<u64> {
        match self.call(Op::Delete { key: key.to_string() }).await? {
            ReplyBody::Revision { revision } => Ok(revision),
            other => Err(unexpected("delete", &other)),
        }
    }

    /// Apply a bulk delta as one revision.
    pub async fn update(&self, delta: Map<String, Value>) -> Result<u64> {
        match self.call(Op::UpdateMany { delta }).await? {
            ReplyBody::Revision { revision } => Ok(revision),
            other => Err(unexpected("update", &other)),
        }
    }

    /// Invoke a named atomic handler on the server. Returns the handler's
    /// value and the revision after its deltas committed.
    pub async fn atomic(
        &self,
        handler: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<(Value, u64)> {
        match self
            .call(Op::Atomic {
                handler: handler.to_string(),
                args,
                kwargs,
            })
            .await?
        {
            ReplyBody::Atomic { value, revision } => Ok((value, revision)),
            other => Err(unexpected("atomic", &other)),
        }
    }

    /// Server identity and current revision.
    pub async fn ping(&self) -> Result<ServerInfo> {
        match self.call(Op::Ping).await? {
            ReplyBody::Pong {
                server_id,
                revision,
            } => Ok(ServerInfo {
                server_id,
                revision,
            }),
            other => Err(unexpected("ping", &other)),
        }
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        match self.call(Op::Contains { key: key.to_string() }).await? {
            ReplyBody::Bool { value } => Ok(value),
            other => Err(unexpected("contains", &other)),
        }
    }

    /// Sorted key list.
    pub async fn keys(&self) -> Result<Vec<String>> {
        match self.call(Op::Keys).await? {
            ReplyBody::Keys { keys } => Ok(keys),
            other => Err(unexpected("keys", &other)),
        }
    }

    pub async fn len(&self) -> Result<u64> {
        match self.call(Op::Len).await? {
            ReplyBody::Len { len } => Ok(len),
            other => Err(unexpected("len", &other)),
        }
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Remove and return a key's value; `None` when it was absent.
    pub async fn pop(&self, key: &str) -> Result<Option<Value>> {
        match self.call(Op::Pop { key: key.to_string() }).await? {
            ReplyBody::Popped { value, .. } => Ok(value),
            other => Err(unexpected("pop", &other)),
        }
    }

    /// Insert `value` only when the key is absent; returns the value now
    /// stored at the key.
    pub async fn set_default(&self, key: &str, value: Value) -> Result<Value> {
        match self
            .call(Op::SetDefault {
                key: key.to_string(),
                value,
            })
            .await?
        {
            ReplyBody::Defaulted { value, .. } => Ok(value),
            other => Err(unexpected("set_default", &other)),
        }
    }

    /// Remove every key as one revision.
    pub async fn clear(&self) -> Result<u64> {
        match self.call(Op::Clear).await? {
            ReplyBody::Revision { revision } => Ok(revision),
            other => Err(unexpected("clear", &other)),
        }
    }

    /// Open a change-event subscription, optionally narrowed to a key set.
    /// The subscription's registration revision is captured atomically with
    /// its establishment on the server.
    pub async fn subscribe(&self, keys: Option<Vec<String>>) -> Result<Subscription> {
        Subscription::open(self.endpoints.events_addr, keys).await
    }
}

fn unexpected(op: &str, body: &ReplyBody) -> ZprocError {
    ZprocError::protocol(format!("unexpected reply to {}: {:?}", op, body))
}
