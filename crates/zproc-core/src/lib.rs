//! ZProc Core - shared, observable key-value state across cooperating
//! processes on a single host.
//!
//! One long-lived server process owns the canonical state mapping and is
//! its sole mutator. Clients mutate the state over a request/reply channel
//! and react to it over a change-event channel; every mutation commits at a
//! monotonically increasing revision and publishes exactly one change
//! record. On top of the state sit named atomic handlers (serialized
//! read-modify-write on the server) and a work dispatcher that fans an
//! input sequence across worker processes and gathers results in input
//! order.
//!
//! # Example
//!
//! ```rust,ignore
//! use zproc_core::{Server, ServerOptions, StateClient};
//!
//! #[tokio::main]
//! async fn main() -> zproc_core::Result<()> {
//!     let handle = Server::start(ServerOptions::new()).await?;
//!     let client = StateClient::connect_to(handle.endpoints()).await?;
//!
//!     client.set("apples", serde_json::json!(5)).await?;
//!     assert_eq!(client.get("apples").await?, Some(serde_json::json!(5)));
//!
//!     Ok(())
//! }
//! ```

pub mod atomic;
pub mod client;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod server;

// Re-export commonly used types
pub use atomic::{AtomicRegistry, StateView};
pub use client::{ServerInfo, StateClient, StateSnapshot, Subscription, WatchOptions};
pub use codec::{ChangeRecord, KeyChange};
pub use discovery::Endpoints;
pub use dispatch::{process_map, run_worker, MapOptions, OrderedResults, TaskRegistry};
pub use error::{Result, ZprocError};
pub use server::{Server, ServerHandle, ServerOptions};
