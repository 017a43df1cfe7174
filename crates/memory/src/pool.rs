//! Hierarchical memory accounting pools.
//!
//! A query owns one root pool; tasks and operators hang aggregate and leaf
//! pools under it. Allocations happen on leaves, capacity lives on the root.
//! When a reservation does not fit the root's granted capacity, the root asks
//! the shared arbitrator for more.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use arbor_common::{ArborError, Result};
use tracing::debug;

use crate::arbitrator::SharedArbitrator;
use crate::reclaimer::MemoryReclaimer;

const MB: u64 = 1 << 20;

/// Reservation rounding: small reservations grow in 1MB steps, medium in 4MB,
/// large in 8MB. Keeps the root's grant bookkeeping coarse enough that every
/// row appended to a batch does not turn into arbitrator traffic.
pub(crate) fn quantized_size(bytes: u64) -> u64 {
    if bytes == 0 {
        return 0;
    }
    if bytes < 16 * MB {
        bytes.div_ceil(MB) * MB
    } else if bytes < 64 * MB {
        bytes.div_ceil(4 * MB) * 4 * MB
    } else {
        bytes.div_ceil(8 * MB) * 8 * MB
    }
}

/// Position of a pool in the accounting tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Query-level pool; owns granted capacity and talks to the arbitrator.
    Root,
    /// Intermediate pool (task or operator scope); pure aggregation.
    Aggregate,
    /// Allocation-level pool; all allocations enter here.
    Leaf,
}

#[derive(Debug, Default)]
struct PoolState {
    used: u64,
    reserved: u64,
    capacity: u64,
    aborted: Option<String>,
}

/// Snapshot of one pool's accounting attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPoolStats {
    /// Live allocation bytes in this pool's subtree.
    pub used: u64,
    /// Rounded-up reservation bytes (root and leaves; zero on aggregates).
    pub reserved: u64,
    /// Capacity granted by the arbitrator (root only).
    pub capacity: u64,
    /// Hard ceiling for this query (root only).
    pub max_capacity: u64,
}

/// One node of the memory accounting tree.
pub struct MemoryPool {
    name: String,
    kind: PoolKind,
    max_capacity: u64,
    parent: Option<Arc<MemoryPool>>,
    arbitrator: Option<Weak<SharedArbitrator>>,
    reclaimer: Mutex<Option<Arc<dyn MemoryReclaimer>>>,
    under_arbitration: AtomicBool,
    state: Mutex<PoolState>,
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("MemoryPool")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("stats", &stats)
            .finish()
    }
}

impl MemoryPool {
    pub(crate) fn new_root(
        name: impl Into<String>,
        max_capacity: u64,
        arbitrator: Weak<SharedArbitrator>,
        reclaimer: Option<Arc<dyn MemoryReclaimer>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind: PoolKind::Root,
            max_capacity,
            parent: None,
            arbitrator: Some(arbitrator),
            reclaimer: Mutex::new(reclaimer),
            under_arbitration: AtomicBool::new(false),
            state: Mutex::new(PoolState::default()),
        })
    }

    fn child(self: &Arc<Self>, name: impl Into<String>, kind: PoolKind) -> Arc<MemoryPool> {
        Arc::new(MemoryPool {
            name: format!("{}/{}", self.name, name.into()),
            kind,
            max_capacity: u64::MAX,
            parent: Some(Arc::clone(self)),
            arbitrator: None,
            reclaimer: Mutex::new(None),
            under_arbitration: AtomicBool::new(false),
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Create an intermediate pool under this root or aggregate pool.
    pub fn add_aggregate_child(self: &Arc<Self>, name: impl Into<String>) -> Result<Arc<MemoryPool>> {
        if self.kind == PoolKind::Leaf {
            return Err(ArborError::InvariantViolation(format!(
                "cannot add child pool under leaf pool {}",
                self.name
            )));
        }
        Ok(self.child(name, PoolKind::Aggregate))
    }

    /// Create an allocation-level pool under this root or aggregate pool.
    pub fn add_leaf_child(self: &Arc<Self>, name: impl Into<String>) -> Result<Arc<MemoryPool>> {
        if self.kind == PoolKind::Leaf {
            return Err(ArborError::InvariantViolation(format!(
                "cannot add child pool under leaf pool {}",
                self.name
            )));
        }
        Ok(self.child(name, PoolKind::Leaf))
    }

    /// Unique slash-separated name path of this pool.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position of this pool in the accounting tree.
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// The root pool of this pool's tree.
    pub fn root(self: &Arc<Self>) -> Arc<MemoryPool> {
        let mut current = Arc::clone(self);
        while let Some(parent) = current.parent.as_ref() {
            current = Arc::clone(parent);
        }
        current
    }

    /// Live allocation bytes in this pool's subtree.
    pub fn used(&self) -> u64 {
        self.state.lock().expect("pool lock").used
    }

    /// Rounded-up reservation bytes.
    pub fn reserved(&self) -> u64 {
        self.state.lock().expect("pool lock").reserved
    }

    /// Capacity granted by the arbitrator. Meaningful on roots only.
    pub fn capacity(&self) -> u64 {
        self.state.lock().expect("pool lock").capacity
    }

    /// Hard per-query ceiling. Meaningful on roots only.
    pub fn max_capacity(&self) -> u64 {
        self.max_capacity
    }

    /// Snapshot of the accounting attributes.
    pub fn stats(&self) -> MemoryPoolStats {
        let state = self.state.lock().expect("pool lock");
        MemoryPoolStats {
            used: state.used,
            reserved: state.reserved,
            capacity: state.capacity,
            max_capacity: self.max_capacity,
        }
    }

    /// Whether this pool's root has been aborted by the arbitrator.
    pub fn is_aborted(self: &Arc<Self>) -> bool {
        let root = self.root();
        let state = root.state.lock().expect("pool lock");
        state.aborted.is_some()
    }

    /// Whether this pool's root is currently part of an arbitration round,
    /// either as requester or as reclaim victim.
    pub fn under_arbitration(self: &Arc<Self>) -> bool {
        self.root().under_arbitration.load(Ordering::Acquire)
    }

    pub(crate) fn set_under_arbitration(&self, value: bool) {
        self.under_arbitration.store(value, Ordering::Release);
    }

    pub(crate) fn set_aborted(&self, reason: String) {
        let mut state = self.state.lock().expect("pool lock");
        if state.aborted.is_none() {
            state.aborted = Some(reason);
        }
    }

    /// The reclaimer attached to this pool, if any.
    pub fn reclaimer(&self) -> Option<Arc<dyn MemoryReclaimer>> {
        self.reclaimer.lock().expect("reclaimer lock").clone()
    }

    /// Attach or replace this pool's reclaimer.
    pub fn set_reclaimer(&self, reclaimer: Arc<dyn MemoryReclaimer>) {
        *self.reclaimer.lock().expect("reclaimer lock") = Some(reclaimer);
    }

    /// Account `bytes` of allocation against this leaf pool.
    ///
    /// May trigger a capacity grow on the root, which in turn may enter
    /// arbitration. The returned guard releases the bytes on drop.
    pub fn allocate(self: &Arc<Self>, bytes: u64) -> Result<MemoryAllocation> {
        if self.kind != PoolKind::Leaf {
            return Err(ArborError::InvariantViolation(format!(
                "allocate on non-leaf pool {}",
                self.name
            )));
        }
        if bytes == 0 {
            return Ok(MemoryAllocation {
                pool: Arc::clone(self),
                bytes: 0,
            });
        }

        let root = self.root();
        {
            // The leaf lock is held across the root reservation so concurrent
            // allocations on one leaf serialize, keeping quantization exact.
            let mut leaf = self.state.lock().expect("pool lock");
            let new_used = leaf.used + bytes;
            let target_reservation = quantized_size(new_used);
            let delta = target_reservation.saturating_sub(leaf.reserved);
            if delta > 0 {
                root.reserve_capacity(delta)?;
                leaf.reserved += delta;
            }
            leaf.used = new_used;
        }
        self.propagate_used(bytes as i64);
        Ok(MemoryAllocation {
            pool: Arc::clone(self),
            bytes,
        })
    }

    fn free(self: &Arc<Self>, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let root = self.root();
        {
            let mut leaf = self.state.lock().expect("pool lock");
            leaf.used = leaf.used.saturating_sub(bytes);
            let target_reservation = quantized_size(leaf.used);
            let delta = leaf.reserved.saturating_sub(target_reservation);
            if delta > 0 {
                leaf.reserved = target_reservation;
                root.release_reservation(delta);
            }
        }
        self.propagate_used(-(bytes as i64));
    }

    /// Add `delta` to `used` on every ancestor including the root. The leaf
    /// itself is updated under its own lock by the caller.
    fn propagate_used(self: &Arc<Self>, delta: i64) {
        let mut current = self.parent.clone();
        while let Some(pool) = current {
            {
                let mut state = pool.state.lock().expect("pool lock");
                if delta >= 0 {
                    state.used += delta as u64;
                } else {
                    state.used = state.used.saturating_sub((-delta) as u64);
                }
            }
            current = pool.parent.clone();
        }
    }

    /// Reserve `delta` bytes of the root's granted capacity, growing the
    /// grant through the arbitrator when it does not fit.
    fn reserve_capacity(self: &Arc<Self>, delta: u64) -> Result<()> {
        debug_assert_eq!(self.kind, PoolKind::Root);
        // A concurrent reservation can consume a fresh grant before this one
        // retries; a couple of attempts is enough in practice and bounds the
        // loop against pathological interleavings.
        for _ in 0..8 {
            let need = {
                let mut state = self.state.lock().expect("pool lock");
                if let Some(reason) = &state.aborted {
                    return Err(ArborError::MemoryAborted(reason.clone()));
                }
                if state.reserved + delta <= state.capacity {
                    state.reserved += delta;
                    return Ok(());
                }
                state.reserved + delta - state.capacity
            };
            let arbitrator = self
                .arbitrator
                .as_ref()
                .and_then(Weak::upgrade)
                .ok_or_else(|| {
                    ArborError::InvariantViolation(format!(
                        "root pool {} has no arbitrator",
                        self.name
                    ))
                })?;
            let granted = arbitrator.grow_capacity(self, need)?;
            if granted == 0 {
                let stats = self.stats();
                return Err(ArborError::CapacityExceeded(format!(
                    "pool {} cannot grow by {} bytes: capacity {} reserved {} max {}",
                    self.name, need, stats.capacity, stats.reserved, self.max_capacity
                )));
            }
            debug!(
                pool = %self.name,
                granted,
                "capacity grant applied"
            );
        }
        Err(ArborError::CapacityExceeded(format!(
            "pool {} reservation kept losing its grant to concurrent requests",
            self.name
        )))
    }

    fn release_reservation(&self, delta: u64) {
        let mut state = self.state.lock().expect("pool lock");
        state.reserved = state.reserved.saturating_sub(delta);
    }

    pub(crate) fn grow_granted_capacity(&self, bytes: u64) {
        let mut state = self.state.lock().expect("pool lock");
        state.capacity += bytes;
    }

    /// Give back capacity not covered by reservations. Returns released bytes.
    pub(crate) fn shrink(&self, target: Option<u64>) -> u64 {
        let mut state = self.state.lock().expect("pool lock");
        let releasable = state.capacity.saturating_sub(state.reserved);
        let released = match target {
            Some(limit) => releasable.min(limit),
            None => releasable,
        };
        state.capacity -= released;
        released
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        if self.kind != PoolKind::Root {
            return;
        }
        let capacity = {
            let state = self.state.lock().expect("pool lock");
            state.capacity
        };
        if let Some(arbitrator) = self.arbitrator.as_ref().and_then(Weak::upgrade) {
            arbitrator.root_pool_dropped(&self.name, capacity);
        }
    }
}

/// RAII accounting guard returned by [`MemoryPool::allocate`].
pub struct MemoryAllocation {
    pool: Arc<MemoryPool>,
    bytes: u64,
}

impl MemoryAllocation {
    /// Accounted size of this allocation.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// The leaf pool this allocation is accounted against.
    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }
}

impl std::fmt::Debug for MemoryAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAllocation")
            .field("pool", &self.pool.name)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Drop for MemoryAllocation {
    fn drop(&mut self) {
        self.pool.free(self.bytes);
    }
}
