//! Error types for ZProc.
//!
//! One enum covers every failure a caller can observe: transport faults,
//! typed timeouts, discovery problems, protocol violations, and failures
//! raised by user code inside an atomic handler or a dispatched task.

use std::time::Duration;
use thiserror::Error;

/// Main error type for ZProc operations.
#[derive(Debug, Error)]
pub enum ZprocError {
    // Transport errors
    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("request timed out after {waited:?}")]
    RequestTimeout { waited: Duration },

    #[error("watch timed out after {waited:?}")]
    WatchTimeout { waited: Duration },

    // Discovery errors
    #[error("no server endpoint configured: {variable} is not set")]
    NotConfigured { variable: String },

    // Strict key operations
    #[error("key not found: {key}")]
    KeyMissing { key: String },

    // Failures raised by user code (atomic handlers, dispatched tasks).
    // `detail` carries an opaque rendering of the original failure.
    #[error("user handler failed: {message}")]
    User {
        message: String,
        detail: Option<String>,
    },

    #[error("unknown atomic handler: {name}")]
    UnknownHandler { name: String },

    #[error("unknown task function: {name}")]
    UnknownTask { name: String },

    #[error("task cancelled")]
    Cancelled,

    // Protocol violations: revision regression, correlation mismatch,
    // unexpected reply shape, unknown op.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for ZProc operations.
pub type Result<T> = std::result::Result<T, ZprocError>;

impl From<std::io::Error> for ZprocError {
    fn from(err: std::io::Error) -> Self {
        ZprocError::Transport {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ZprocError {
    fn from(err: serde_json::Error) -> Self {
        ZprocError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ZprocError {
    /// Shorthand for a transport error with no underlying io source.
    pub(crate) fn transport(message: impl Into<String>) -> Self {
        ZprocError::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Shorthand for a protocol violation.
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        ZprocError::Protocol {
            message: message.into(),
        }
    }
}

/// Extract the message from a caught panic payload, if it carries one.
pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> Option<String> {
    if let Some(s) = panic.downcast_ref::<&str>() {
        Some((*s).to_string())
    } else {
        panic.downcast_ref::<String>().cloned()
    }
}
