//! Query-level execution context and its arbitration participation.

use std::sync::{Arc, Mutex, Weak};

use arbor_common::ids::QueryId;
use arbor_common::{ArborError, QueryConfig, Result};
use arbor_memory::{MemoryManager, MemoryPool, MemoryReclaimer, ReclaimStats};
use tracing::debug;

use crate::task::Task;

/// Shared state of one running query: config and the root memory pool.
pub struct QueryCtx {
    query_id: QueryId,
    config: QueryConfig,
    root_pool: Arc<MemoryPool>,
    reclaimer: Arc<QueryReclaimer>,
}

impl QueryCtx {
    /// Create a query context with a registered root pool capped at
    /// `config.memory_capacity`.
    pub fn new(
        query_id: QueryId,
        config: QueryConfig,
        manager: &MemoryManager,
    ) -> Result<Arc<Self>> {
        let reclaimer = Arc::new(QueryReclaimer::new());
        let root_pool = manager.add_root_pool(
            format!("query.{query_id}"),
            config.memory_capacity,
            Some(Arc::clone(&reclaimer) as Arc<dyn MemoryReclaimer>),
        )?;
        Ok(Arc::new(Self {
            query_id,
            config,
            root_pool,
            reclaimer,
        }))
    }

    /// This query's id.
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// This query's configuration.
    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// The root memory pool owned by this query.
    pub fn root_pool(&self) -> &Arc<MemoryPool> {
        &self.root_pool
    }

    /// Whether the query is currently part of an arbitration round. Must be
    /// false once a successfully completed query tears down.
    pub fn under_arbitration(&self) -> bool {
        self.root_pool.under_arbitration()
    }

    pub(crate) fn reclaimer(&self) -> &Arc<QueryReclaimer> {
        &self.reclaimer
    }
}

/// Root-pool reclaimer: fans reclaim out to the query's tasks.
///
/// Tasks without a reclaim-capable operator are counted and skipped without
/// ever being paused.
pub struct QueryReclaimer {
    tasks: Mutex<Vec<Weak<Task>>>,
}

impl QueryReclaimer {
    fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add_task(&self, task: &Arc<Task>) {
        self.tasks.lock().expect("task registry").push(Arc::downgrade(task));
    }

    fn live_tasks(&self) -> Vec<Arc<Task>> {
        self.tasks
            .lock()
            .expect("task registry")
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl MemoryReclaimer for QueryReclaimer {
    fn reclaimable_bytes(&self, _pool: &MemoryPool) -> u64 {
        self.live_tasks()
            .iter()
            .map(|task| task.reclaimable_bytes())
            .sum()
    }

    fn reclaim(
        &self,
        pool: &Arc<MemoryPool>,
        target_bytes: u64,
        stats: &mut ReclaimStats,
    ) -> Result<u64> {
        let mut tasks = self.live_tasks();
        tasks.sort_by_key(|task| std::cmp::Reverse(task.reclaimable_bytes()));

        let mut freed = 0;
        for task in tasks {
            if freed >= target_bytes {
                break;
            }
            if task.is_terminated() {
                continue;
            }
            if task.reclaimable_bytes() == 0 {
                stats.num_non_reclaimable_tasks += 1;
                continue;
            }
            freed += task.reclaim(target_bytes - freed, stats)?;
        }
        debug!(pool = pool.name(), freed, target_bytes, "query reclaim finished");
        Ok(freed)
    }

    fn abort(&self, pool: &Arc<MemoryPool>, reason: &ArborError) {
        debug!(pool = pool.name(), reason = %reason, "aborting query tasks");
        for task in self.live_tasks() {
            task.terminate_memory_aborted(reason.to_string());
            task.wait_until_idle();
        }
    }
}
