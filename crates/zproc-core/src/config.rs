//! Centralized configuration for ZProc.
//!
//! Protocol limits, default timeouts, discovery variable names, and the
//! reserved key prefixes used by the work dispatcher.

use std::time::Duration;

/// Wire protocol configuration.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Maximum size of a single wire frame (requests, replies, change records).
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

    /// Timeout for establishing a connection to the server.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default server-liveness timeout for a single request/reply round-trip.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Environment variable advertising the request/reply endpoint.
    pub const SERVER_ADDR_ENV: &'static str = "ZPROC_SERVER_ADDR";

    /// Environment variable advertising the change-event endpoint.
    pub const EVENTS_ADDR_ENV: &'static str = "ZPROC_EVENTS_ADDR";
}

/// State server configuration.
pub struct ServerConfig;

impl ServerConfig {
    /// Queue depth between connection handlers and the state task.
    pub const REQUEST_QUEUE_DEPTH: usize = 256;

    /// Buffered change records per subscriber before it is considered
    /// lagging and disconnected.
    pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
}

/// Work dispatcher configuration.
pub struct DispatchConfig;

impl DispatchConfig {
    /// Prefix for the dispatcher's bookkeeping keys in the shared state.
    pub const TASK_KEY_PREFIX: &'static str = "__zproc_task";

    /// How long a dispatch teardown waits for an outstanding worker's
    /// write-back before removing the bookkeeping keys anyway.
    pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Reserved state key for a task's chunk spec.
pub(crate) fn chunk_key(task_id: &str, worker_id: usize) -> String {
    format!("{}:{}:chunk:{}", DispatchConfig::TASK_KEY_PREFIX, task_id, worker_id)
}

/// Reserved state key for a worker's completed chunk results.
pub(crate) fn done_key(task_id: &str, worker_id: usize) -> String {
    format!("{}:{}:done:{}", DispatchConfig::TASK_KEY_PREFIX, task_id, worker_id)
}

/// Reserved state key for a task's cancellation flag.
pub(crate) fn cancel_key(task_id: &str) -> String {
    format!("{}:{}:cancel", DispatchConfig::TASK_KEY_PREFIX, task_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_keys_share_prefix() {
        assert!(chunk_key("t1", 0).starts_with(DispatchConfig::TASK_KEY_PREFIX));
        assert!(done_key("t1", 3).starts_with(DispatchConfig::TASK_KEY_PREFIX));
        assert!(cancel_key("t1").starts_with(DispatchConfig::TASK_KEY_PREFIX));
    }

    #[test]
    fn test_task_keys_are_distinct() {
        assert_ne!(chunk_key("t1", 0), done_key("t1", 0));
        assert_ne!(chunk_key("t1", 0), chunk_key("t1", 1));
        assert_ne!(chunk_key("t1", 0), chunk_key("t2", 0));
    }

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(ProtocolConfig::CONNECT_TIMEOUT > Duration::ZERO);
        assert!(ProtocolConfig::REQUEST_TIMEOUT > ProtocolConfig::CONNECT_TIMEOUT);
    }
}
