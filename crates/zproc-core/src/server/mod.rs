//! The state server: sole owner and mutator of the shared mapping.

mod service;
mod state;

pub use service::{Server, ServerHandle, ServerOptions};
