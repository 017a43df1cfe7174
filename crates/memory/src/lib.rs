//! Memory accounting and cross-query capacity arbitration.
//!
//! Architecture role:
//! - hierarchical [`pool::MemoryPool`] accounting (root per query, leaves per
//!   allocation site)
//! - the process-wide [`arbitrator::SharedArbitrator`] that redistributes a
//!   fixed budget between queries, forcing reclaim (spill) or abort under
//!   pressure
//! - the [`reclaimer::MemoryReclaimer`] capability record the execution layer
//!   implements to participate in reclaim
//!
//! Key modules:
//! - [`pool`]
//! - [`reclaimer`]
//! - [`arbitrator`]
//! - [`manager`]

pub mod arbitrator;
pub mod manager;
pub mod pool;
pub mod reclaimer;

pub use arbitrator::{ArbitratorStats, SharedArbitrator, SharedArbitratorOptions};
pub use manager::{MemoryManager, MemoryManagerOptions};
pub use pool::{MemoryAllocation, MemoryPool, MemoryPoolStats, PoolKind};
pub use reclaimer::{MemoryReclaimer, ReclaimStats};
