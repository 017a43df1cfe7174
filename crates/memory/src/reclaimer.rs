//! Reclaim capability records.
//!
//! Instead of an operator class hierarchy, reclaim support is a capability
//! attached to a pool: the arbitrator only ever talks to a `MemoryReclaimer`.
//! The execution layer provides implementations that pause tasks and drive
//! operator spill; tests provide stubs.

use std::sync::Arc;

use arbor_common::{ArborError, Result};

use crate::pool::MemoryPool;

/// Accumulated outcome of one reclaim invocation or arbitration round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    /// Bytes actually released by reclaim work.
    pub reclaimed_bytes: u64,
    /// Tasks visited that had no reclaim-capable operator. Such tasks are
    /// skipped without being paused.
    pub num_non_reclaimable_tasks: u64,
}

impl ReclaimStats {
    /// Merge another stats record into this one.
    pub fn merge(&mut self, other: &ReclaimStats) {
        self.reclaimed_bytes += other.reclaimed_bytes;
        self.num_non_reclaimable_tasks += other.num_non_reclaimable_tasks;
    }
}

/// Capability record the arbitrator uses to shed memory from a pool.
///
/// `reclaim` runs with no arbitrator lock held; implementations are free to
/// pause tasks, run spill, and block. `abort` must leave the pool's owner in
/// a state where all outstanding reservations will be released promptly.
pub trait MemoryReclaimer: Send + Sync {
    /// Bytes this pool's owner could plausibly release if asked. Zero means
    /// the owner cannot reclaim and must not be paused for reclaim.
    fn reclaimable_bytes(&self, pool: &MemoryPool) -> u64;

    /// Release up to `target_bytes` from the pool's owner. Returns the bytes
    /// actually reclaimed.
    fn reclaim(
        &self,
        pool: &Arc<MemoryPool>,
        target_bytes: u64,
        stats: &mut ReclaimStats,
    ) -> Result<u64>;

    /// Tear down the pool's owner after the arbitrator aborted the pool.
    /// Must not return before outstanding work has observed the abort.
    fn abort(&self, pool: &Arc<MemoryPool>, reason: &ArborError);
}
