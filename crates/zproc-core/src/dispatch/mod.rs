//! Work dispatch: fan a value sequence across N workers through the shared
//! state, and gather per-item results back in input order.
//!
//! The driver partitions the input into contiguous chunks (one per worker),
//! writes every chunk spec in a single revision, and returns an
//! [`OrderedResults`] sequence. Workers (separate processes that inherited
//! the server endpoints) pick their chunk up via a presence watcher, run
//! the named task function over their items, and write the outcomes back
//! under a per-worker done key. The driver's change subscription collects
//! those writes, buffers out-of-order chunks, and yields results strictly
//! in input position order; an item failure surfaces at exactly that item's
//! position.

mod task;
mod worker;

pub use task::{ChunkResult, ChunkSpec, ItemOutcome, Outcome, TaskFn, TaskRegistry};
pub use worker::run_worker;

use crate::client::{StateClient, Subscription, WatchOptions};
use crate::codec::ChangeRecord;
use crate::config::{cancel_key, chunk_key, done_key, DispatchConfig};
use crate::error::Result;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Options for one `process_map` dispatch.
#[derive(Debug, Clone, Default)]
pub struct MapOptions {
    workers: Option<usize>,
    common_args: Vec<Value>,
}

impl MapOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Worker count. Defaults to the host's available parallelism.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Extra positional arguments passed to every task invocation.
    pub fn common_args(mut self, args: Vec<Value>) -> Self {
        self.common_args = args;
        self
    }
}

/// Globally unique task id: pid plus a process-wide counter.
fn next_task_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Contiguous partition of `total` indices into at most `workers` chunks of
/// size ⌈total / workers⌉. Empty input partitions into no chunks.
fn partition(total: usize, workers: usize) -> Vec<(usize, usize)> {
    let workers = workers.max(1);
    let chunk_size = total.div_ceil(workers).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < total {
        let end = (start + chunk_size).min(total);
        chunks.push((start, end));
        start = end;
    }
    chunks
}

/// Fan `items` across workers running the named task function; returns the
/// lazy, input-ordered result sequence.
///
/// The result subscription is opened before any chunk spec is written, so
/// no completion can be missed. Workers are external: whatever processes
/// call [`run_worker`] with this dispatch's task id serve it.
pub async fn process_map(
    client: &StateClient,
    fn_name: &str,
    items: Vec<Value>,
    opts: MapOptions,
) -> Result<OrderedResults> {
    let total = items.len();
    let task_id = next_task_id();
    let chunks = partition(total, opts.workers.unwrap_or_else(default_workers));
    let workers = chunks.len();

    let gather = StateClient::connect_to(client.endpoints()).await?;
    let done_keys: Vec<String> = (0..workers).map(|w| done_key(&task_id, w)).collect();
    let sub = gather.subscribe(Some(done_keys)).await?;

    let mut delta = Map::new();
    for (worker_id, &(start, end)) in chunks.iter().enumerate() {
        let spec = ChunkSpec {
            task_id: task_id.clone(),
            fn_name: fn_name.to_string(),
            worker_id,
            start_index: start,
            items: items[start..end].to_vec(),
            common_args: opts.common_args.clone(),
        };
        delta.insert(
            chunk_key(&task_id, worker_id),
            serde_json::to_value(&spec)?,
        );
    }
    if !delta.is_empty() {
        client.update(delta).await?;
    }

    debug!(task_id = %task_id, total, workers, "dispatched");

    Ok(OrderedResults {
        client: gather,
        sub,
        task_id,
        workers,
        total,
        next_index: 0,
        buffered: BTreeMap::new(),
        done_workers: 0,
        failed: false,
        cleaned: false,
    })
}

/// Lazy, input-ordered results of one dispatch.
///
/// Each [`next`](Self::next) yields the next input position's result,
/// waiting on the change feed until that position's chunk has been written
/// back. Item failures are yielded at the failing position and the sequence
/// remains consumable past them; a broken event stream is terminal and is
/// surfaced exactly once, after which the sequence is exhausted.
///
/// Stopping early: [`close`](Self::close) cancels outstanding workers and
/// removes the dispatch's bookkeeping keys. Dropping an unfinished sequence
/// spawns the same teardown best-effort on the current runtime.
#[derive(Debug)]
pub struct OrderedResults {
    client: StateClient,
    sub: Subscription,
    task_id: String,
    workers: usize,
    total: usize,
    next_index: usize,
    buffered: BTreeMap<usize, Outcome>,
    done_workers: usize,
    failed: bool,
    cleaned: bool,
}

impl OrderedResults {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Total number of input items.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of chunks (and therefore worker slots) in this dispatch. May
    /// be lower than the requested worker count when the input is short.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Next result in input order, or `None` when the sequence is
    /// exhausted.
    pub async fn next(&mut self) -> Option<Result<Value>> {
        if self.failed || self.next_index >= self.total {
            self.cleanup().await;
            return None;
        }
        while !self.buffered.contains_key(&self.next_index) {
            match self.sub.next().await {
                Ok(record) => self.absorb(&record),
                Err(err) => {
                    // A broken event stream cannot recover ordering;
                    // surface the fault once, then the sequence ends.
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
        let outcome = self.buffered.remove(&self.next_index)?;
        self.next_index += 1;
        Some(outcome.into_result())
    }

    /// Drain the remaining results into a vector.
    pub async fn collect(mut self) -> Vec<Result<Value>> {
        let mut out = Vec::with_capacity(self.total - self.next_index);
        while let Some(result) = self.next().await {
            out.push(result);
        }
        out
    }

    /// Set this dispatch's cancellation flag. Workers poll it per item and
    /// report remaining items as cancelled.
    pub async fn cancel(&self) -> Result<()> {
        self.client
            .set(&cancel_key(&self.task_id), json!(true))
            .await?;
        Ok(())
    }

    /// Stop consuming early: cancel outstanding workers, wait (bounded) for
    /// their write-backs, and remove the dispatch's bookkeeping keys.
    pub async fn close(mut self) {
        self.cleanup().await;
    }

    fn absorb(&mut self, record: &ChangeRecord) {
        for change in record.changes.values() {
            let Some(after) = &change.after else { continue };
            let Ok(chunk) = serde_json::from_value::<ChunkResult>(after.clone()) else {
                continue;
            };
            if chunk.task_id != self.task_id {
                continue;
            }
            debug!(
                task_id = %self.task_id,
                worker_id = chunk.worker_id,
                items = chunk.results.len(),
                "chunk completed"
            );
            self.done_workers += 1;
            for item in chunk.results {
                self.buffered.insert(item.index, item.outcome);
            }
        }
    }

    async fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        teardown(
            &self.client,
            &self.task_id,
            self.workers,
            self.done_workers < self.workers,
        )
        .await;
    }
}

impl Drop for OrderedResults {
    fn drop(&mut self) {
        if self.cleaned || self.workers == 0 {
            return;
        }
        self.cleaned = true;
        let endpoints = self.client.endpoints();
        let task_id = std::mem::take(&mut self.task_id);
        let workers = self.workers;
        let pending = self.done_workers < workers;
        // Teardown needs the runtime; without one the keys stay behind for
        // the operator to sweep.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    match StateClient::connect_to(endpoints).await {
                        Ok(client) => teardown(&client, &task_id, workers, pending).await,
                        Err(e) => {
                            warn!("dispatch {} teardown connect failed: {}", task_id, e);
                        }
                    }
                });
            }
            Err(_) => {
                warn!(
                    "dispatch {} dropped outside a runtime; bookkeeping keys remain",
                    task_id
                );
            }
        }
    }
}

/// Best-effort removal of a dispatch's bookkeeping keys.
///
/// With workers still outstanding the cancellation flag is set first and
/// each missing write-back is awaited with a bounded timeout, so the flag
/// is not removed before workers poll it and a late write-back does not
/// leak a done key.
async fn teardown(client: &StateClient, task_id: &str, workers: usize, pending: bool) {
    if pending {
        if let Err(e) = client.set(&cancel_key(task_id), json!(true)).await {
            warn!("dispatch {} cancel flag write failed: {}", task_id, e);
        }
        for worker_id in 0..workers {
            let key = done_key(task_id, worker_id);
            let opts = WatchOptions::new().timeout(DispatchConfig::TEARDOWN_TIMEOUT);
            if let Err(e) = client.get_when_available(&key, opts).await {
                warn!(
                    "dispatch {} teardown: worker {} never wrote back: {}",
                    task_id, worker_id, e
                );
            }
        }
    }
    for worker_id in 0..workers {
        for key in [chunk_key(task_id, worker_id), done_key(task_id, worker_id)] {
            if let Err(e) = client.pop(&key).await {
                warn!("dispatch cleanup failed for {}: {}", key, e);
            }
        }
    }
    if let Err(e) = client.pop(&cancel_key(task_id)).await {
        warn!("dispatch cleanup failed for cancel flag: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_even_split() {
        assert_eq!(partition(4, 2), vec![(0, 2), (2, 4)]);
        assert_eq!(partition(6, 3), vec![(0, 2), (2, 4), (4, 6)]);
    }

    #[test]
    fn test_partition_uneven_split_stays_contiguous() {
        // ⌈5/2⌉ = 3, so the last chunk is short.
        assert_eq!(partition(5, 2), vec![(0, 3), (3, 5)]);
        // ⌈4/3⌉ = 2 fills in two chunks; no empty third chunk.
        assert_eq!(partition(4, 3), vec![(0, 2), (2, 4)]);
    }

    #[test]
    fn test_partition_more_workers_than_items() {
        assert_eq!(partition(2, 8), vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn test_partition_empty_input_has_no_chunks() {
        assert!(partition(0, 4).is_empty());
    }

    #[test]
    fn test_partition_covers_every_index_once() {
        for total in 0..20 {
            for workers in 1..6 {
                let chunks = partition(total, workers);
                let covered: usize = chunks.iter().map(|(s, e)| e - s).sum();
                assert_eq!(covered, total, "total={} workers={}", total, workers);
                for pair in chunks.windows(2) {
                    assert_eq!(pair[0].1, pair[1].0);
                }
            }
        }
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = next_task_id();
        let b = next_task_id();
        assert_ne!(a, b);
        assert!(a.starts_with(&std::process::id().to_string()));
    }
}
