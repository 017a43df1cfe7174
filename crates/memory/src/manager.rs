//! Process-level memory manager.
//!
//! Owns the shared arbitrator and the root-pool registry. Built explicitly at
//! startup and injected wherever pools are created; nothing here is a lazy
//! global, so tests can run several managers side by side.

use std::sync::Arc;

use arbor_common::Result;

use crate::arbitrator::{SharedArbitrator, SharedArbitratorOptions};
use crate::pool::MemoryPool;
use crate::reclaimer::MemoryReclaimer;

/// Construction options for [`MemoryManager`].
pub type MemoryManagerOptions = SharedArbitratorOptions;

/// Entry point for creating root pools against the shared budget.
pub struct MemoryManager {
    arbitrator: Arc<SharedArbitrator>,
}

impl MemoryManager {
    /// Create a manager with a fresh arbitrator owning `options.total_capacity`.
    pub fn new(options: MemoryManagerOptions) -> Self {
        Self {
            arbitrator: SharedArbitrator::new(options),
        }
    }

    /// The arbitrator mediating capacity between this manager's root pools.
    pub fn arbitrator(&self) -> &Arc<SharedArbitrator> {
        &self.arbitrator
    }

    /// Create and register a query root pool.
    ///
    /// `max_capacity` is the per-query hard ceiling; the arbitrator grants
    /// `pool_init_capacity` (clamped to the ceiling and to free capacity) up
    /// front. The reclaimer, when present, makes the pool a candidate victim
    /// for global arbitration.
    pub fn add_root_pool(
        &self,
        name: impl Into<String>,
        max_capacity: u64,
        reclaimer: Option<Arc<dyn MemoryReclaimer>>,
    ) -> Result<Arc<MemoryPool>> {
        let pool = MemoryPool::new_root(
            name,
            max_capacity,
            Arc::downgrade(&self.arbitrator),
            reclaimer,
        );
        self.arbitrator.register_root(&pool)?;
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryManager, MemoryManagerOptions};

    const MB: u64 = 1 << 20;

    #[test]
    fn arbitrator_kind_is_shared() {
        let manager = MemoryManager::new(MemoryManagerOptions::default());
        assert_eq!(manager.arbitrator().kind(), "SHARED");
    }

    #[test]
    fn init_capacity_is_clamped() {
        let manager = MemoryManager::new(MemoryManagerOptions {
            total_capacity: 64 * MB,
            pool_init_capacity: 16 * MB,
            allow_abort: false,
        });
        let small = manager
            .add_root_pool("query.small", 4 * MB, None)
            .expect("pool");
        assert_eq!(small.capacity(), 4 * MB);
        let big = manager
            .add_root_pool("query.big", 256 * MB, None)
            .expect("pool");
        assert_eq!(big.capacity(), 16 * MB);
        assert_eq!(manager.arbitrator().free_capacity(), 44 * MB);
    }

    #[test]
    fn duplicate_root_name_is_rejected() {
        let manager = MemoryManager::new(MemoryManagerOptions::default());
        let _a = manager.add_root_pool("query.1", MB, None).expect("pool");
        assert!(manager.add_root_pool("query.1", MB, None).is_err());
    }
}
