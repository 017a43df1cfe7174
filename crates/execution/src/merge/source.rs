//! Producers feeding one merge: in-process queues and remote exchanges.
//!
//! Both shapes share a bounded queue with promise-based wakeups on each side:
//! the consumer blocks when the queue runs dry, producers block when queued
//! bytes exceed the source's budget.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use arbor_common::ids::RemoteTaskId;
use arbor_common::{ArborError, Result};
use arbor_memory::{MemoryAllocation, MemoryPool};
use arrow::record_batch::RecordBatch;
use tracing::debug;

use crate::exchange::{decode_page, ExchangeClient};
use crate::future::{continue_pair, ContinueFuture, ContinuePromise};

/// Floor of the per-source queued-bytes budget for merge exchange.
pub const MAX_QUEUED_BYTES_LOWER_LIMIT: u64 = 1 << 20;
/// Ceiling of the per-source queued-bytes budget for merge exchange.
pub const MAX_QUEUED_BYTES_UPPER_LIMIT: u64 = 32 << 20;

/// Split the exchange buffer across sources, clamped to sane bounds.
pub fn max_queued_bytes_per_source(buffer_size: u64, num_sources: usize) -> u64 {
    (buffer_size / num_sources.max(1) as u64)
        .clamp(MAX_QUEUED_BYTES_LOWER_LIMIT, MAX_QUEUED_BYTES_UPPER_LIMIT)
}

/// Outcome of pulling on a merge source.
#[derive(Debug)]
pub enum SourceNext {
    /// The next ordered batch.
    Batch(RecordBatch),
    /// The source is permanently drained.
    AtEnd,
    /// Nothing available yet; wait on the future and pull again.
    Blocked(ContinueFuture),
}

/// Pull interface of one ordered batch producer.
///
/// `close` must be safe to call before `start`.
pub trait MergeSource: Send + Sync {
    /// Signal the source it may begin producing. Idempotent.
    fn start(&self);
    /// Pull the next batch.
    fn next(&self) -> Result<SourceNext>;
    /// Release producer resources.
    fn close(&self);
    /// Poison the source so the consumer observes `message` on its next pull.
    fn fail(&self, message: String);
}

struct QueueState<T> {
    entries: VecDeque<(T, u64)>,
    queued_bytes: u64,
    at_end: bool,
    closed: bool,
    started: bool,
    failed: Option<String>,
    consumer: Option<ContinuePromise>,
    producers: Vec<ContinuePromise>,
}

impl<T> QueueState<T> {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            queued_bytes: 0,
            at_end: false,
            closed: false,
            started: false,
            failed: None,
            consumer: None,
            producers: Vec::new(),
        }
    }

    fn wake_consumer(&mut self) {
        if let Some(promise) = self.consumer.take() {
            promise.fulfill();
        }
    }

    fn wake_producers(&mut self) {
        for promise in self.producers.drain(..) {
            promise.fulfill();
        }
    }
}

enum Popped<T> {
    Entry(T),
    AtEnd,
    Blocked(ContinueFuture),
}

struct SourceQueue<T> {
    max_queued_bytes: u64,
    state: Mutex<QueueState<T>>,
}

impl<T> SourceQueue<T> {
    fn new(max_queued_bytes: u64) -> Self {
        Self {
            max_queued_bytes,
            state: Mutex::new(QueueState::new()),
        }
    }

    fn start(&self) {
        let mut state = self.state.lock().expect("source queue");
        state.started = true;
    }

    /// Enqueue one entry. Returns a future the producer must wait on when the
    /// queue is over budget. Entries pushed after close/fail are dropped.
    fn push(&self, entry: T, bytes: u64) -> Option<ContinueFuture> {
        let mut state = self.state.lock().expect("source queue");
        if state.closed || state.failed.is_some() {
            return None;
        }
        state.entries.push_back((entry, bytes));
        state.queued_bytes += bytes;
        state.wake_consumer();
        if state.queued_bytes >= self.max_queued_bytes {
            let (promise, future) = continue_pair();
            state.producers.push(promise);
            Some(future)
        } else {
            None
        }
    }

    fn push_end(&self) {
        let mut state = self.state.lock().expect("source queue");
        state.at_end = true;
        state.wake_consumer();
    }

    fn pop(&self) -> Result<Popped<T>> {
        let mut state = self.state.lock().expect("source queue");
        if let Some(message) = &state.failed {
            return Err(ArborError::Execution(message.clone()));
        }
        if let Some((entry, bytes)) = state.entries.pop_front() {
            state.queued_bytes -= bytes;
            state.wake_producers();
            return Ok(Popped::Entry(entry));
        }
        if state.at_end {
            return Ok(Popped::AtEnd);
        }
        let (promise, future) = continue_pair();
        state.consumer = Some(promise);
        Ok(Popped::Blocked(future))
    }

    fn fail(&self, message: String) {
        let mut state = self.state.lock().expect("source queue");
        if state.failed.is_none() {
            state.failed = Some(message);
        }
        state.wake_consumer();
        state.wake_producers();
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("source queue");
        state.closed = true;
        state.entries.clear();
        state.queued_bytes = 0;
        state.wake_consumer();
        state.wake_producers();
    }

    fn is_open(&self) -> bool {
        let state = self.state.lock().expect("source queue");
        !state.closed && state.failed.is_none()
    }
}

/// Bounded in-process queue fed by sibling pipelines of the same task.
pub struct LocalMergeSource {
    queue: SourceQueue<RecordBatch>,
}

impl LocalMergeSource {
    pub(crate) fn new(max_queued_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            queue: SourceQueue::new(max_queued_bytes),
        })
    }

    /// Producer side: enqueue a batch, or `None` to mark end of stream.
    /// Returns a backpressure future when the queue is over budget.
    pub fn enqueue(&self, batch: Option<RecordBatch>) -> Result<Option<ContinueFuture>> {
        match batch {
            None => {
                self.queue.push_end();
                Ok(None)
            }
            Some(batch) => {
                let bytes = batch.get_array_memory_size() as u64;
                Ok(self.queue.push(batch, bytes))
            }
        }
    }
}

impl MergeSource for LocalMergeSource {
    fn start(&self) {
        self.queue.start();
    }

    fn next(&self) -> Result<SourceNext> {
        Ok(match self.queue.pop()? {
            Popped::Entry(batch) => SourceNext::Batch(batch),
            Popped::AtEnd => SourceNext::AtEnd,
            Popped::Blocked(future) => SourceNext::Blocked(future),
        })
    }

    fn close(&self) {
        self.queue.close();
    }

    fn fail(&self, message: String) {
        self.queue.fail(message);
    }
}

/// Remote producer: a background thread pulls IPC pages from one remote task
/// and queues decoded batches, accounted against a per-source leaf pool.
pub struct MergeExchangeSource {
    remote_task_id: RemoteTaskId,
    client: Arc<dyn ExchangeClient>,
    queue: Arc<SourceQueue<(RecordBatch, MemoryAllocation)>>,
    pool: Arc<MemoryPool>,
    max_queued_bytes: u64,
    fetcher: Mutex<Option<JoinHandle<()>>>,
}

impl MergeExchangeSource {
    pub(crate) fn new(
        remote_task_id: RemoteTaskId,
        client: Arc<dyn ExchangeClient>,
        max_queued_bytes: u64,
        pool: Arc<MemoryPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote_task_id,
            client,
            queue: Arc::new(SourceQueue::new(max_queued_bytes)),
            pool,
            max_queued_bytes,
            fetcher: Mutex::new(None),
        })
    }

    /// The remote task this source pulls from.
    pub fn remote_task_id(&self) -> &RemoteTaskId {
        &self.remote_task_id
    }

    /// Queued-bytes budget assigned to this source.
    pub fn max_queued_bytes(&self) -> u64 {
        self.max_queued_bytes
    }
}

impl MergeSource for MergeExchangeSource {
    fn start(&self) {
        let mut fetcher = self.fetcher.lock().expect("fetcher slot");
        if fetcher.is_some() {
            return;
        }
        self.queue.start();
        let remote = self.remote_task_id.clone();
        let client = Arc::clone(&self.client);
        let queue = Arc::clone(&self.queue);
        let pool = Arc::clone(&self.pool);
        debug!(remote = %remote, budget = self.max_queued_bytes, "starting exchange fetch");
        *fetcher = Some(std::thread::spawn(move || {
            run_fetch(&remote, client.as_ref(), &queue, &pool)
        }));
    }

    fn next(&self) -> Result<SourceNext> {
        Ok(match self.queue.pop()? {
            Popped::Entry((batch, allocation)) => {
                // Queued-bytes accounting ends when the batch leaves the
                // queue; the merge's output accounting takes over from here.
                drop(allocation);
                SourceNext::Batch(batch)
            }
            Popped::AtEnd => SourceNext::AtEnd,
            Popped::Blocked(future) => SourceNext::Blocked(future),
        })
    }

    fn close(&self) {
        self.queue.close();
        let handle = self.fetcher.lock().expect("fetcher slot").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn fail(&self, message: String) {
        self.queue.fail(message);
    }
}

fn run_fetch(
    remote: &RemoteTaskId,
    client: &dyn ExchangeClient,
    queue: &SourceQueue<(RecordBatch, MemoryAllocation)>,
    pool: &Arc<MemoryPool>,
) {
    while queue.is_open() {
        let page = match client.next_page(remote) {
            Ok(page) => page,
            Err(e) => {
                queue.fail(format!("exchange fetch from {remote} failed: {e}"));
                return;
            }
        };
        let Some(bytes) = page else {
            queue.push_end();
            return;
        };
        let batches = match decode_page(&bytes) {
            Ok(batches) => batches,
            Err(e) => {
                queue.fail(format!("exchange page from {remote} undecodable: {e}"));
                return;
            }
        };
        for batch in batches {
            let size = batch.get_array_memory_size() as u64;
            let allocation = match pool.allocate(size) {
                Ok(allocation) => allocation,
                Err(e) => {
                    queue.fail(format!("exchange source {remote} out of memory: {e}"));
                    return;
                }
            };
            if let Some(backpressure) = queue.push((batch, allocation), size) {
                backpressure.wait();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};

    use super::*;

    fn batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).expect("batch")
    }

    #[test]
    fn budget_clamp() {
        const MB: u64 = 1 << 20;
        assert_eq!(max_queued_bytes_per_source(128 * MB, 1), 32 * MB);
        assert_eq!(max_queued_bytes_per_source(128 * MB, 8), 16 * MB);
        assert_eq!(max_queued_bytes_per_source(128 * MB, 512), MB);
        assert_eq!(max_queued_bytes_per_source(0, 4), MB);
    }

    #[test]
    fn local_source_delivers_in_order_then_ends() {
        let source = LocalMergeSource::new(1 << 20);
        source.start();
        source.enqueue(Some(batch(vec![1, 2]))).expect("enqueue");
        source.enqueue(Some(batch(vec![3]))).expect("enqueue");
        source.enqueue(None).expect("end");

        match source.next().expect("next") {
            SourceNext::Batch(b) => assert_eq!(b.num_rows(), 2),
            other => panic!("expected batch, got {other:?}"),
        }
        match source.next().expect("next") {
            SourceNext::Batch(b) => assert_eq!(b.num_rows(), 1),
            other => panic!("expected batch, got {other:?}"),
        }
        assert!(matches!(source.next().expect("next"), SourceNext::AtEnd));
    }

    #[test]
    fn empty_local_source_blocks_until_producer_arrives() {
        let source = LocalMergeSource::new(1 << 20);
        source.start();
        let blocked = match source.next().expect("next") {
            SourceNext::Blocked(future) => future,
            other => panic!("expected blocked, got {other:?}"),
        };
        source.enqueue(Some(batch(vec![7]))).expect("enqueue");
        blocked.wait();
        assert!(matches!(
            source.next().expect("next"),
            SourceNext::Batch(_)
        ));
    }

    #[test]
    fn producer_backpressure_releases_on_pop() {
        // Budget of one byte: every push is over budget.
        let source = LocalMergeSource::new(1);
        source.start();
        let pressure = source
            .enqueue(Some(batch(vec![1])))
            .expect("enqueue")
            .expect("backpressure future");
        let popped = source.next().expect("next");
        assert!(matches!(popped, SourceNext::Batch(_)));
        // Fulfilled by the pop; must not hang.
        pressure.wait();
    }

    #[test]
    fn close_before_start_is_safe() {
        let source = LocalMergeSource::new(1 << 20);
        source.close();
        source.start();
        assert!(source.enqueue(Some(batch(vec![1]))).expect("enqueue").is_none());
    }
}
