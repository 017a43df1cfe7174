//! Process-wide shared capacity arbitrator.
//!
//! All root pools draw their capacity from one fixed budget. A grow request
//! is first served from free capacity (local arbitration); when free runs
//! out, the requester queues for a global round that reclaims from victim
//! pools, pausing their tasks through the attached reclaimers. As a last
//! resort the round aborts the largest victim.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use arbor_common::{global_metrics, ArborError, Result};
use tracing::{debug, info, warn};

use crate::pool::MemoryPool;
use crate::reclaimer::ReclaimStats;

/// Construction options for [`SharedArbitrator`].
#[derive(Debug, Clone)]
pub struct SharedArbitratorOptions {
    /// Fixed process-wide capacity distributed across root pools.
    pub total_capacity: u64,
    /// Capacity granted to a root pool at registration.
    pub pool_init_capacity: u64,
    /// Whether a global round may abort a victim when reclaim falls short.
    pub allow_abort: bool,
}

impl Default for SharedArbitratorOptions {
    fn default() -> Self {
        Self {
            total_capacity: 8 * 1024 * 1024 * 1024, // 8GB
            pool_init_capacity: 64 * 1024 * 1024,   // 64MB
            allow_abort: true,
        }
    }
}

/// Observable arbitrator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArbitratorStats {
    /// Capacity grow requests received.
    pub num_requests: u64,
    /// Root pools aborted under OOM.
    pub num_aborted: u64,
    /// Requests satisfied purely from free capacity.
    pub local_arbitration_count: u64,
    /// Requests that waited on a global arbitration round.
    pub global_arbitration_wait_count: u64,
    /// Cumulative bytes reclaimed from victims; monotonically non-decreasing.
    pub reclaimed_used_bytes: u64,
    /// Capacity currently not granted to any root.
    pub free_capacity_bytes: u64,
    /// Fixed total capacity.
    pub max_capacity_bytes: u64,
}

struct Participant {
    name: String,
    pool: Weak<MemoryPool>,
}

struct ArbState {
    free_capacity: u64,
    participants: Vec<Participant>,
}

/// The shared arbitrator. Identifies itself with the kind string `"SHARED"`.
pub struct SharedArbitrator {
    options: SharedArbitratorOptions,
    state: Mutex<ArbState>,
    queue: Mutex<VecDeque<u64>>,
    queue_cv: Condvar,
    next_ticket: AtomicU64,
    num_requests: AtomicU64,
    num_aborted: AtomicU64,
    local_arbitration_count: AtomicU64,
    global_arbitration_wait_count: AtomicU64,
    reclaimed_used_bytes: AtomicU64,
}

impl SharedArbitrator {
    /// Create an arbitrator owning `options.total_capacity` bytes.
    pub fn new(options: SharedArbitratorOptions) -> Arc<Self> {
        global_metrics().set_max_capacity_bytes(options.total_capacity);
        global_metrics().set_free_capacity_bytes(options.total_capacity);
        Arc::new(Self {
            state: Mutex::new(ArbState {
                free_capacity: options.total_capacity,
                participants: Vec::new(),
            }),
            options,
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            next_ticket: AtomicU64::new(0),
            num_requests: AtomicU64::new(0),
            num_aborted: AtomicU64::new(0),
            local_arbitration_count: AtomicU64::new(0),
            global_arbitration_wait_count: AtomicU64::new(0),
            reclaimed_used_bytes: AtomicU64::new(0),
        })
    }

    /// Arbitrator kind string.
    pub fn kind(&self) -> &'static str {
        "SHARED"
    }

    /// Fixed total capacity.
    pub fn total_capacity(&self) -> u64 {
        self.options.total_capacity
    }

    /// Capacity currently not granted to any root pool.
    pub fn free_capacity(&self) -> u64 {
        self.state.lock().expect("arbitrator lock").free_capacity
    }

    /// Snapshot of the observable counters.
    pub fn stats(&self) -> ArbitratorStats {
        ArbitratorStats {
            num_requests: self.num_requests.load(Ordering::Relaxed),
            num_aborted: self.num_aborted.load(Ordering::Relaxed),
            local_arbitration_count: self.local_arbitration_count.load(Ordering::Relaxed),
            global_arbitration_wait_count: self
                .global_arbitration_wait_count
                .load(Ordering::Relaxed),
            reclaimed_used_bytes: self.reclaimed_used_bytes.load(Ordering::Relaxed),
            free_capacity_bytes: self.free_capacity(),
            max_capacity_bytes: self.options.total_capacity,
        }
    }

    pub(crate) fn register_root(self: &Arc<Self>, pool: &Arc<MemoryPool>) -> Result<()> {
        let mut state = self.state.lock().expect("arbitrator lock");
        if state.participants.iter().any(|p| p.name == pool.name()) {
            return Err(ArborError::InvalidConfig(format!(
                "root pool {} already registered",
                pool.name()
            )));
        }
        let grant = self
            .options
            .pool_init_capacity
            .min(pool.max_capacity())
            .min(state.free_capacity);
        state.free_capacity -= grant;
        pool.grow_granted_capacity(grant);
        state.participants.push(Participant {
            name: pool.name().to_string(),
            pool: Arc::downgrade(pool),
        });
        global_metrics().set_free_capacity_bytes(state.free_capacity);
        debug!(pool = pool.name(), grant, "root pool registered");
        Ok(())
    }

    /// Grow `pool`'s granted capacity by at least `requested` bytes.
    ///
    /// Returns the granted bytes; zero means a re-entrant request on a root
    /// already under arbitration, which callers must treat as a refusal.
    pub fn grow_capacity(self: &Arc<Self>, pool: &Arc<MemoryPool>, requested: u64) -> Result<u64> {
        self.num_requests.fetch_add(1, Ordering::Relaxed);
        global_metrics().inc_arbitrator_requests();

        if pool.is_aborted() {
            return Err(ArborError::MemoryAborted(format!(
                "grow on aborted pool {}",
                pool.name()
            )));
        }
        // Reclaim code allocating on a root that is already mid-arbitration
        // must not recurse into another round.
        if pool.under_arbitration() {
            return Ok(0);
        }
        if pool.capacity() + requested > pool.max_capacity() {
            return Err(ArborError::CapacityExceeded(format!(
                "pool {} requested {} bytes over its {} byte cap",
                pool.name(),
                requested,
                pool.max_capacity()
            )));
        }

        if self.try_local_grant(pool, requested) {
            self.local_arbitration_count.fetch_add(1, Ordering::Relaxed);
            global_metrics().inc_local_arbitrations();
            return Ok(requested);
        }

        self.global_arbitration_wait_count
            .fetch_add(1, Ordering::Relaxed);
        global_metrics().inc_global_arbitration_waits();
        info!(
            pool = pool.name(),
            requested, "free capacity exhausted, entering global arbitration"
        );

        let _slot = self.enter_queue();
        pool.set_under_arbitration(true);
        let result = self.run_global_round(pool, requested);
        pool.set_under_arbitration(false);
        result
    }

    fn try_local_grant(&self, pool: &Arc<MemoryPool>, requested: u64) -> bool {
        let mut state = self.state.lock().expect("arbitrator lock");
        if state.free_capacity < requested {
            return false;
        }
        state.free_capacity -= requested;
        pool.grow_granted_capacity(requested);
        global_metrics().set_free_capacity_bytes(state.free_capacity);
        true
    }

    fn run_global_round(self: &Arc<Self>, pool: &Arc<MemoryPool>, requested: u64) -> Result<u64> {
        // Free capacity may have recovered while this request sat in the
        // queue behind an earlier round.
        if self.try_local_grant(pool, requested) {
            return Ok(requested);
        }

        let mut round_stats = ReclaimStats::default();
        for victim in self.reclaim_candidates(pool.name()) {
            let shortfall = {
                let state = self.state.lock().expect("arbitrator lock");
                requested.saturating_sub(state.free_capacity)
            };
            if shortfall == 0 {
                break;
            }
            victim.set_under_arbitration(true);
            let reclaimed = victim
                .reclaimer()
                .map(|reclaimer| reclaimer.reclaim(&victim, shortfall, &mut round_stats))
                .unwrap_or(Ok(0));
            victim.set_under_arbitration(false);
            match reclaimed {
                Ok(bytes) => {
                    self.reclaimed_used_bytes.fetch_add(bytes, Ordering::Relaxed);
                    global_metrics().add_reclaimed_used_bytes(bytes);
                    debug!(victim = victim.name(), bytes, "victim reclaim finished");
                }
                Err(e) => {
                    warn!(victim = victim.name(), error = %e, "victim reclaim failed");
                }
            }
            let released = victim.shrink(None);
            self.add_free_capacity(released);
        }

        if self.try_local_grant(pool, requested) {
            info!(
                pool = pool.name(),
                requested,
                reclaimed = round_stats.reclaimed_bytes,
                "global arbitration satisfied request"
            );
            return Ok(requested);
        }

        if self.options.allow_abort {
            if let Some(victim) = self.largest_abort_candidate(pool.name()) {
                self.abort(
                    &victim,
                    ArborError::CapacityExceeded(format!(
                        "pool {} aborted by arbitration to free {} bytes for {}",
                        victim.name(),
                        requested,
                        pool.name()
                    )),
                );
                if self.try_local_grant(pool, requested) {
                    return Ok(requested);
                }
            }
        }

        Err(ArborError::CapacityExceeded(format!(
            "global arbitration failed to free {} bytes for pool {}",
            requested,
            pool.name()
        )))
    }

    /// Live participant pools other than the requester. Snapshot only; the
    /// arbitrator lock is never held while reclaimers run.
    fn other_pools(&self, requester: &str) -> Vec<Arc<MemoryPool>> {
        let state = self.state.lock().expect("arbitrator lock");
        state
            .participants
            .iter()
            .filter(|p| p.name != requester)
            .filter_map(|p| p.pool.upgrade())
            .collect()
    }

    /// Victims ordered by descending reclaimable bytes, name as tie-break.
    /// Pools that cannot reclaim are excluded so they are never paused.
    fn reclaim_candidates(&self, requester: &str) -> Vec<Arc<MemoryPool>> {
        let mut candidates = self
            .other_pools(requester)
            .into_iter()
            .filter(|pool| !pool.is_aborted())
            .filter_map(|pool| {
                let reclaimable = pool
                    .reclaimer()
                    .map(|r| r.reclaimable_bytes(&pool))
                    .unwrap_or(0);
                (reclaimable > 0).then_some((pool, reclaimable))
            })
            .collect::<Vec<_>>();
        candidates.sort_by(|(a, ra), (b, rb)| {
            rb.cmp(ra).then_with(|| a.name().cmp(b.name()))
        });
        candidates.into_iter().map(|(pool, _)| pool).collect()
    }

    fn largest_abort_candidate(&self, requester: &str) -> Option<Arc<MemoryPool>> {
        self.other_pools(requester)
            .into_iter()
            .filter(|pool| !pool.is_aborted() && pool.capacity() > 0)
            .max_by(|a, b| {
                a.capacity()
                    .cmp(&b.capacity())
                    .then_with(|| b.name().cmp(a.name()))
            })
    }

    /// Abort `pool`: mark it, tear down its owner through the reclaimer, and
    /// take all of its unreserved capacity back into the free pool.
    pub fn abort(self: &Arc<Self>, pool: &Arc<MemoryPool>, reason: ArborError) {
        info!(pool = pool.name(), reason = %reason, "aborting root pool");
        self.num_aborted.fetch_add(1, Ordering::Relaxed);
        global_metrics().inc_arbitrator_aborted();
        pool.set_aborted(reason.to_string());
        if let Some(reclaimer) = pool.reclaimer() {
            reclaimer.abort(pool, &reason);
        }
        let released = pool.shrink(None);
        self.add_free_capacity(released);
    }

    /// Return unreserved capacity of `pool` to the free pool. Returns the
    /// released bytes.
    pub fn shrink_capacity(&self, pool: &Arc<MemoryPool>, target: Option<u64>) -> u64 {
        let released = pool.shrink(target);
        self.add_free_capacity(released);
        released
    }

    pub(crate) fn root_pool_dropped(&self, name: &str, capacity: u64) {
        let mut state = self.state.lock().expect("arbitrator lock");
        state.participants.retain(|p| p.name != name);
        state.free_capacity += capacity;
        global_metrics().set_free_capacity_bytes(state.free_capacity);
        debug!(pool = name, capacity, "root pool dropped, capacity returned");
    }

    fn add_free_capacity(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut state = self.state.lock().expect("arbitrator lock");
        state.free_capacity += bytes;
        global_metrics().set_free_capacity_bytes(state.free_capacity);
    }

    /// FIFO admission to the single running global round.
    fn enter_queue(&self) -> QueueSlot<'_> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.queue.lock().expect("arbitration queue");
        queue.push_back(ticket);
        while queue.front() != Some(&ticket) {
            queue = self.queue_cv.wait(queue).expect("arbitration queue");
        }
        QueueSlot {
            arbitrator: self,
            ticket,
        }
    }
}

struct QueueSlot<'a> {
    arbitrator: &'a SharedArbitrator,
    ticket: u64,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        let mut queue = self.arbitrator.queue.lock().expect("arbitration queue");
        queue.retain(|t| *t != self.ticket);
        self.arbitrator.queue_cv.notify_all();
    }
}
