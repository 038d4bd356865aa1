//! Worker side of a dispatch.
//!
//! A worker process (spawned externally, with the server endpoints in its
//! environment) calls [`run_worker`] with its task id and worker id. The
//! chunk spec is pulled from the shared state, each item is computed in
//! chunk order, and the outcomes are written back under the worker's done
//! key in a single revision. The driver's change subscription picks that
//! write up.

use crate::client::{StateClient, WatchOptions};
use crate::config::{cancel_key, chunk_key, done_key};
use crate::dispatch::task::{ChunkResult, ChunkSpec, ItemOutcome, Outcome, TaskRegistry};
use crate::error::{panic_message, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

/// Pull this worker's chunk, compute it, and write the results back.
///
/// A missing task function or a panicking item never aborts the write-back:
/// every assigned item reports an outcome, so the driver always unblocks.
/// The cancellation flag is polled before each item; remaining items report
/// [`Outcome::Cancelled`] once it is seen.
pub async fn run_worker(
    client: &StateClient,
    registry: &TaskRegistry,
    task_id: &str,
    worker_id: usize,
) -> Result<()> {
    let spec_value = client
        .get_when_available(&chunk_key(task_id, worker_id), WatchOptions::new())
        .await?;
    let spec: ChunkSpec = serde_json::from_value(spec_value)?;

    debug!(
        task_id,
        worker_id,
        items = spec.items.len(),
        "worker picked up chunk"
    );

    let mut results = Vec::with_capacity(spec.items.len());
    match registry.get(&spec.fn_name) {
        Ok(task_fn) => {
            let flag = cancel_key(task_id);
            let mut cancelled = false;
            for (offset, item) in spec.items.iter().enumerate() {
                let index = spec.start_index + offset;
                if !cancelled && client.contains(&flag).await? {
                    warn!(task_id, worker_id, "cancellation flag seen, abandoning chunk");
                    cancelled = true;
                }
                if cancelled {
                    results.push(ItemOutcome {
                        index,
                        outcome: Outcome::Cancelled,
                    });
                    continue;
                }

                let outcome = match catch_unwind(AssertUnwindSafe(|| {
                    task_fn(item, &spec.common_args)
                })) {
                    Ok(result) => Outcome::from_result(result),
                    Err(panic) => Outcome::Err {
                        message: format!("task function '{}' panicked", spec.fn_name),
                        detail: panic_message(panic),
                    },
                };
                results.push(ItemOutcome { index, outcome });
            }
        }
        Err(err) => {
            // Report the failure at every assigned position instead of
            // leaving the driver waiting.
            let message = err.to_string();
            for offset in 0..spec.items.len() {
                results.push(ItemOutcome {
                    index: spec.start_index + offset,
                    outcome: Outcome::Err {
                        message: message.clone(),
                        detail: None,
                    },
                });
            }
        }
    }

    let chunk_result = ChunkResult {
        task_id: task_id.to_string(),
        worker_id,
        results,
    };
    client
        .set(
            &done_key(task_id, worker_id),
            serde_json::to_value(&chunk_result)?,
        )
        .await?;
    Ok(())
}
