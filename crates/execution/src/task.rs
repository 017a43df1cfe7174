//! Task-side host surface the core operators depend on: split queues, local
//! merge source registry, the cooperative pause barrier, and termination.
//!
//! Pause is not preemption. The arbitrator requests it, each driver observes
//! it at its next safe point, and `request_pause` returns once every
//! on-thread driver sits inside a suspended section.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use arbor_common::ids::{PlanNodeId, TaskId};
use arbor_common::{ArborError, Result};
use arbor_memory::{MemoryPool, ReclaimStats};
use tracing::debug;

use crate::future::{continue_pair, ContinuePromise};
use crate::merge::source::{LocalMergeSource, MergeSource};
use crate::operator::Operator;
use crate::query::QueryCtx;
use crate::split::{Split, SplitFetch};

#[derive(Debug, Clone)]
enum TerminalReason {
    ExternalAbort(String),
    MemoryAborted(String),
}

impl TerminalReason {
    fn to_error(&self) -> ArborError {
        match self {
            TerminalReason::ExternalAbort(msg) => ArborError::ExternalAbort(msg.clone()),
            TerminalReason::MemoryAborted(msg) => ArborError::MemoryAborted(msg.clone()),
        }
    }
}

#[derive(Default)]
struct TaskControl {
    terminal: Option<TerminalReason>,
    pause_requested: bool,
    drivers_on_thread: u32,
    drivers_suspended: u32,
}

struct SplitQueue {
    queue: std::collections::VecDeque<Split>,
    no_more: bool,
    waiters: Vec<ContinuePromise>,
}

struct OperatorEntry {
    operator: Arc<Mutex<dyn Operator>>,
    // Captured at registration so victim selection never takes operator
    // locks; the locks are only safe to take while the task is paused.
    can_reclaim: bool,
}

impl SplitQueue {
    fn new() -> Self {
        Self {
            queue: std::collections::VecDeque::new(),
            no_more: false,
            waiters: Vec::new(),
        }
    }

    fn wake(&mut self) {
        for waiter in self.waiters.drain(..) {
            waiter.fulfill();
        }
    }
}

/// One task of a query: the unit the arbitrator pauses and the host aborts.
pub struct Task {
    id: TaskId,
    query: Arc<QueryCtx>,
    pool: Arc<MemoryPool>,
    control: Mutex<TaskControl>,
    control_cv: Condvar,
    splits: Mutex<HashMap<PlanNodeId, SplitQueue>>,
    local_merge: Mutex<HashMap<PlanNodeId, Vec<Arc<LocalMergeSource>>>>,
    sources: Mutex<Vec<Weak<dyn MergeSource>>>,
    operators: Mutex<Vec<OperatorEntry>>,
    pause_requests: AtomicU64,
    consumed_splits: AtomicU64,
}

impl Task {
    /// Create a task under `query`, with its own aggregate memory pool.
    pub fn new(id: TaskId, query: &Arc<QueryCtx>) -> Result<Arc<Self>> {
        let pool = query.root_pool().add_aggregate_child(format!("task.{id}"))?;
        let task = Arc::new(Self {
            id,
            query: Arc::clone(query),
            pool,
            control: Mutex::new(TaskControl::default()),
            control_cv: Condvar::new(),
            splits: Mutex::new(HashMap::new()),
            local_merge: Mutex::new(HashMap::new()),
            sources: Mutex::new(Vec::new()),
            operators: Mutex::new(Vec::new()),
            pause_requests: AtomicU64::new(0),
            consumed_splits: AtomicU64::new(0),
        });
        query.reclaimer().add_task(&task);
        Ok(task)
    }

    /// This task's id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The owning query context.
    pub fn query(&self) -> &Arc<QueryCtx> {
        &self.query
    }

    /// The task-level aggregate memory pool.
    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    // --- splits ---------------------------------------------------------

    /// Deliver one split for `node`.
    pub fn add_split(&self, node: PlanNodeId, split: Split) {
        let mut splits = self.splits.lock().expect("split queues");
        let queue = splits.entry(node).or_insert_with(SplitQueue::new);
        queue.queue.push_back(split);
        queue.wake();
    }

    /// Deliver the end marker for `node`.
    pub fn no_more_splits(&self, node: PlanNodeId) {
        let mut splits = self.splits.lock().expect("split queues");
        let queue = splits.entry(node).or_insert_with(SplitQueue::new);
        queue.no_more = true;
        queue.wake();
    }

    /// Next split for `node`, the end marker, or a future to wait on.
    pub fn split_or_future(&self, node: PlanNodeId) -> Result<SplitFetch> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }
        let mut splits = self.splits.lock().expect("split queues");
        let queue = splits.entry(node).or_insert_with(SplitQueue::new);
        if let Some(split) = queue.queue.pop_front() {
            return Ok(SplitFetch::Split(split));
        }
        if queue.no_more {
            return Ok(SplitFetch::Finished);
        }
        let (promise, future) = continue_pair();
        queue.waiters.push(promise);
        Ok(SplitFetch::Blocked(future))
    }

    /// Record `count` splits as consumed by an operator.
    pub fn splits_consumed(&self, count: u64) {
        self.consumed_splits.fetch_add(count, Ordering::Relaxed);
    }

    /// Total splits consumed by this task's operators.
    pub fn num_consumed_splits(&self) -> u64 {
        self.consumed_splits.load(Ordering::Relaxed)
    }

    // --- merge sources --------------------------------------------------

    /// Create the local merge sources for `node`. Called by the host before
    /// producers start; repeated creation for one node is a contract error.
    pub fn create_local_merge_sources(
        &self,
        node: PlanNodeId,
        count: usize,
        max_queued_bytes: u64,
    ) -> Result<Vec<Arc<LocalMergeSource>>> {
        let mut registry = self.local_merge.lock().expect("local merge registry");
        if registry.contains_key(&node) {
            return Err(ArborError::InvariantViolation(format!(
                "local merge sources for node {node} already created"
            )));
        }
        let sources = (0..count)
            .map(|_| LocalMergeSource::new(max_queued_bytes))
            .collect::<Vec<_>>();
        for source in &sources {
            self.register_merge_source(Arc::clone(source) as Arc<dyn MergeSource>);
        }
        registry.insert(node, sources.clone());
        Ok(sources)
    }

    /// The local merge sources registered for `node`; empty when the task
    /// terminated before any were created.
    pub fn local_merge_sources(&self, node: PlanNodeId) -> Vec<Arc<LocalMergeSource>> {
        self.local_merge
            .lock()
            .expect("local merge registry")
            .get(&node)
            .cloned()
            .unwrap_or_default()
    }

    /// Track a merge source so termination can poison it.
    pub fn register_merge_source(&self, source: Arc<dyn MergeSource>) {
        self.sources
            .lock()
            .expect("source registry")
            .push(Arc::downgrade(&source));
    }

    /// Create the leaf pool accounting one exchange source's queue.
    pub fn add_merge_source_pool(
        &self,
        node: PlanNodeId,
        source_index: usize,
    ) -> Result<Arc<MemoryPool>> {
        self.pool
            .add_leaf_child(format!("merge-source.{node}.{source_index}"))
    }

    // --- reclaim --------------------------------------------------------

    /// Register an operator as a reclaim participant.
    pub fn register_operator(&self, operator: Arc<Mutex<dyn Operator>>) {
        let can_reclaim = operator.lock().expect("operator").can_reclaim();
        self.operators
            .lock()
            .expect("operator registry")
            .push(OperatorEntry {
                operator,
                can_reclaim,
            });
    }

    /// Bytes this task could release if paused and asked. Zero when no
    /// registered operator is reclaim-capable; the pool-level figure
    /// otherwise, so no operator lock is needed outside a pause.
    pub fn reclaimable_bytes(&self) -> u64 {
        let registry = self.operators.lock().expect("operator registry");
        if registry.iter().any(|entry| entry.can_reclaim) {
            self.pool.used()
        } else {
            0
        }
    }

    /// Pause the task, run operator reclaim, resume. Returns freed bytes.
    pub fn reclaim(&self, target_bytes: u64, stats: &mut ReclaimStats) -> Result<u64> {
        if self.is_terminated() {
            return Ok(0);
        }
        self.request_pause();
        let result = self.reclaim_paused(target_bytes, stats);
        self.resume();
        let freed = result?;
        stats.reclaimed_bytes += freed;
        Ok(freed)
    }

    fn reclaim_paused(&self, target_bytes: u64, stats: &mut ReclaimStats) -> Result<u64> {
        let operators = self
            .operators
            .lock()
            .expect("operator registry")
            .iter()
            .filter(|entry| entry.can_reclaim)
            .map(|entry| Arc::clone(&entry.operator))
            .collect::<Vec<_>>();
        let mut freed = 0;
        for operator in operators {
            if freed >= target_bytes || self.is_terminated() {
                // An abort racing with reclaim short-circuits remaining work.
                break;
            }
            let mut op = operator.lock().expect("operator");
            if op.can_reclaim() {
                freed += op.reclaim(target_bytes - freed, stats)?;
            }
        }
        Ok(freed)
    }

    // --- pause barrier --------------------------------------------------

    /// Ask all drivers of this task to stop at their next safe point and
    /// wait until they have.
    pub fn request_pause(&self) {
        self.pause_requests.fetch_add(1, Ordering::Relaxed);
        debug!(task = %self.id, "pause requested");
        let mut control = self.control.lock().expect("task control");
        control.pause_requested = true;
        while control.drivers_on_thread > control.drivers_suspended {
            control = self.control_cv.wait(control).expect("task control");
        }
    }

    /// Let paused drivers continue.
    pub fn resume(&self) {
        let mut control = self.control.lock().expect("task control");
        control.pause_requested = false;
        drop(control);
        self.control_cv.notify_all();
        debug!(task = %self.id, "resumed");
    }

    /// Times a pause was requested on this task.
    pub fn pause_count(&self) -> u64 {
        self.pause_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn driver_entered(&self) {
        let mut control = self.control.lock().expect("task control");
        control.drivers_on_thread += 1;
    }

    pub(crate) fn driver_exited(&self) {
        let mut control = self.control.lock().expect("task control");
        control.drivers_on_thread -= 1;
        drop(control);
        self.control_cv.notify_all();
    }

    pub(crate) fn suspend_enter(&self) {
        let mut control = self.control.lock().expect("task control");
        control.drivers_suspended += 1;
        drop(control);
        self.control_cv.notify_all();
    }

    /// Leaving a suspended section blocks while a pause is in flight, so the
    /// arbitrator never observes a half-resumed driver. An abort racing with
    /// this wait releases it; the driver then observes the terminal error.
    pub(crate) fn suspend_leave(&self) {
        let mut control = self.control.lock().expect("task control");
        while control.pause_requested && control.terminal.is_none() {
            control = self.control_cv.wait(control).expect("task control");
        }
        control.drivers_suspended -= 1;
    }

    /// Driver safe point: while a pause is requested, count this driver as
    /// suspended and wait for resume.
    pub(crate) fn yield_if_paused(&self) {
        let mut control = self.control.lock().expect("task control");
        if !control.pause_requested || control.terminal.is_some() {
            return;
        }
        control.drivers_suspended += 1;
        self.control_cv.notify_all();
        while control.pause_requested && control.terminal.is_none() {
            control = self.control_cv.wait(control).expect("task control");
        }
        control.drivers_suspended -= 1;
    }

    // --- termination ----------------------------------------------------

    /// Host-initiated abort of this task.
    pub fn abort(&self, message: impl Into<String>) {
        self.terminate(TerminalReason::ExternalAbort(message.into()));
    }

    pub(crate) fn terminate_memory_aborted(&self, message: String) {
        self.terminate(TerminalReason::MemoryAborted(message));
    }

    fn terminate(&self, reason: TerminalReason) {
        {
            let mut control = self.control.lock().expect("task control");
            if control.terminal.is_some() {
                return;
            }
            control.terminal = Some(reason.clone());
        }
        self.control_cv.notify_all();
        debug!(task = %self.id, "terminated");

        let message = reason.to_error().to_string();
        // Wake every blocked edge so drivers observe the terminal state.
        {
            let mut splits = self.splits.lock().expect("split queues");
            for queue in splits.values_mut() {
                queue.wake();
            }
        }
        let sources = self.sources.lock().expect("source registry").clone();
        for source in sources.iter().filter_map(Weak::upgrade) {
            source.fail(message.clone());
        }
    }

    /// Whether this task has reached a terminal state.
    pub fn is_terminated(&self) -> bool {
        self.control.lock().expect("task control").terminal.is_some()
    }

    /// The terminal error, if the task was aborted.
    pub fn terminal_error(&self) -> Option<ArborError> {
        self.control
            .lock()
            .expect("task control")
            .terminal
            .as_ref()
            .map(TerminalReason::to_error)
    }

    /// Block until no driver of this task is on a thread.
    pub fn wait_until_idle(&self) {
        let mut control = self.control.lock().expect("task control");
        while control.drivers_on_thread > 0 {
            control = self.control_cv.wait(control).expect("task control");
        }
    }
}
