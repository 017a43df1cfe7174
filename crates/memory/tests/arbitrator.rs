use std::sync::{Arc, Mutex};

use arbor_common::ArborError;
use arbor_memory::{
    MemoryAllocation, MemoryManager, MemoryManagerOptions, MemoryPool, MemoryReclaimer,
    ReclaimStats,
};

const MB: u64 = 1 << 20;

/// Reclaimer that simply drops held allocation guards, oldest first.
#[derive(Default)]
struct StubReclaimer {
    holdings: Mutex<Vec<MemoryAllocation>>,
}

impl StubReclaimer {
    fn hold(&self, allocation: MemoryAllocation) {
        self.holdings.lock().expect("holdings").push(allocation);
    }
}

impl MemoryReclaimer for StubReclaimer {
    fn reclaimable_bytes(&self, _pool: &MemoryPool) -> u64 {
        self.holdings
            .lock()
            .expect("holdings")
            .iter()
            .map(MemoryAllocation::bytes)
            .sum()
    }

    fn reclaim(
        &self,
        _pool: &Arc<MemoryPool>,
        target_bytes: u64,
        stats: &mut ReclaimStats,
    ) -> arbor_common::Result<u64> {
        let mut holdings = self.holdings.lock().expect("holdings");
        let mut freed = 0;
        while freed < target_bytes && !holdings.is_empty() {
            freed += holdings.remove(0).bytes();
        }
        stats.reclaimed_bytes += freed;
        Ok(freed)
    }

    fn abort(&self, _pool: &Arc<MemoryPool>, _reason: &ArborError) {
        self.holdings.lock().expect("holdings").clear();
    }
}

/// Reclaimer whose reclaim path allocates on its own root first, to exercise
/// the re-entrancy guard.
#[derive(Default)]
struct ReentrantReclaimer {
    leaf: Mutex<Option<Arc<MemoryPool>>>,
    holdings: Mutex<Vec<MemoryAllocation>>,
    observed_reentry_refusal: Mutex<bool>,
}

impl MemoryReclaimer for ReentrantReclaimer {
    fn reclaimable_bytes(&self, _pool: &MemoryPool) -> u64 {
        self.holdings
            .lock()
            .expect("holdings")
            .iter()
            .map(MemoryAllocation::bytes)
            .sum()
    }

    fn reclaim(
        &self,
        _pool: &Arc<MemoryPool>,
        target_bytes: u64,
        _stats: &mut ReclaimStats,
    ) -> arbor_common::Result<u64> {
        let leaf = self.leaf.lock().expect("leaf").clone().expect("leaf set");
        // Spill bookkeeping that itself wants memory: the arbitrator must
        // refuse instead of recursing into another round.
        match leaf.allocate(64 * MB) {
            Err(e) if e.is_capacity_exceeded() => {
                *self.observed_reentry_refusal.lock().expect("flag") = true;
            }
            Err(e) => return Err(e),
            Ok(extra) => drop(extra),
        }
        let mut holdings = self.holdings.lock().expect("holdings");
        let mut freed = 0;
        while freed < target_bytes && !holdings.is_empty() {
            freed += holdings.remove(0).bytes();
        }
        Ok(freed)
    }

    fn abort(&self, _pool: &Arc<MemoryPool>, _reason: &ArborError) {
        self.holdings.lock().expect("holdings").clear();
    }
}

fn balanced(manager: &MemoryManager, pools: &[&Arc<MemoryPool>]) -> bool {
    let arbitrator = manager.arbitrator();
    let granted: u64 = pools.iter().map(|pool| pool.capacity()).sum();
    granted + arbitrator.free_capacity() == arbitrator.total_capacity()
}

#[test]
fn local_grow_quantizes_reservations() {
    let manager = MemoryManager::new(MemoryManagerOptions {
        total_capacity: 64 * MB,
        pool_init_capacity: 0,
        allow_abort: false,
    });
    let root = manager.add_root_pool("query.q", 64 * MB, None).expect("root");
    let leaf = root.add_leaf_child("op").expect("leaf");

    let allocation = leaf.allocate(1).expect("allocate one byte");
    assert_eq!(leaf.used(), 1);
    assert_eq!(leaf.reserved(), MB);
    assert_eq!(root.used(), 1);
    assert_eq!(root.reserved(), MB);
    assert_eq!(root.capacity(), MB);
    assert_eq!(manager.arbitrator().stats().local_arbitration_count, 1);
    assert!(balanced(&manager, &[&root]));

    drop(allocation);
    assert_eq!(leaf.used(), 0);
    assert_eq!(root.reserved(), 0);
    // Granted capacity stays cached on the root until shrunk.
    assert_eq!(root.capacity(), MB);

    let released = manager.arbitrator().shrink_capacity(&root, None);
    assert_eq!(released, MB);
    assert_eq!(manager.arbitrator().free_capacity(), 64 * MB);
}

#[test]
fn grow_beyond_query_cap_is_capacity_exceeded() {
    let manager = MemoryManager::new(MemoryManagerOptions {
        total_capacity: 64 * MB,
        pool_init_capacity: 0,
        allow_abort: false,
    });
    let root = manager.add_root_pool("query.q", 8 * MB, None).expect("root");
    let leaf = root.add_leaf_child("op").expect("leaf");

    let held = leaf.allocate(8 * MB).expect("within cap");
    let err = leaf.allocate(MB).expect_err("over cap");
    assert!(err.is_capacity_exceeded(), "got {err}");
    drop(held);
}

#[test]
fn global_round_reclaims_from_the_largest_victim() {
    let manager = MemoryManager::new(MemoryManagerOptions {
        total_capacity: 64 * MB,
        pool_init_capacity: 0,
        allow_abort: false,
    });

    let victim_reclaimer = Arc::new(StubReclaimer::default());
    let victim_root = manager
        .add_root_pool("query.victim", 64 * MB, Some(victim_reclaimer.clone()))
        .expect("victim root");
    let victim_leaf = victim_root.add_leaf_child("agg").expect("leaf");
    for _ in 0..6 {
        victim_reclaimer.hold(victim_leaf.allocate(8 * MB).expect("grow"));
    }

    let requester_root = manager.add_root_pool("query.req", 64 * MB, None).expect("root");
    let requester_leaf = requester_root.add_leaf_child("buffer").expect("leaf");

    // 48MB held, 16MB free: a 32MB request needs a reclaim of at least 16MB.
    let held = requester_leaf.allocate(32 * MB).expect("grow via reclaim");

    let stats = manager.arbitrator().stats();
    assert_eq!(stats.global_arbitration_wait_count, 1);
    assert!(stats.reclaimed_used_bytes >= 16 * MB);
    assert_eq!(stats.num_aborted, 0);
    assert!(balanced(&manager, &[&victim_root, &requester_root]));

    drop(held);
    drop(victim_reclaimer);
}

#[test]
fn round_aborts_largest_pool_when_reclaim_cannot_cover() {
    let manager = MemoryManager::new(MemoryManagerOptions {
        total_capacity: 64 * MB,
        pool_init_capacity: 32 * MB,
        allow_abort: true,
    });

    // The victim holds a 32MB grant but only 8MB of it is reserved, and it
    // has no reclaimer.
    let victim_root = manager.add_root_pool("query.victim", 64 * MB, None).expect("root");
    let victim_leaf = victim_root.add_leaf_child("op").expect("leaf");
    let victim_held = victim_leaf.allocate(8 * MB).expect("grow");

    let requester_root = manager.add_root_pool("query.req", 64 * MB, None).expect("root");
    let requester_leaf = requester_root.add_leaf_child("op").expect("leaf");

    // Free capacity is exhausted; with nothing reclaimable the round must
    // abort the victim to serve this.
    let held = requester_leaf.allocate(40 * MB).expect("grow via abort");

    let stats = manager.arbitrator().stats();
    assert_eq!(stats.num_aborted, 1);
    assert!(victim_root.is_aborted());
    let err = victim_leaf.allocate(MB).expect_err("aborted pool");
    assert!(err.is_memory_aborted(), "got {err}");
    assert!(balanced(&manager, &[&victim_root, &requester_root]));

    drop(held);
    drop(victim_held);
}

#[test]
fn reentrant_grow_during_reclaim_is_refused_not_recursed() {
    let manager = MemoryManager::new(MemoryManagerOptions {
        total_capacity: 64 * MB,
        pool_init_capacity: 0,
        allow_abort: false,
    });

    let reclaimer = Arc::new(ReentrantReclaimer::default());
    let victim_root = manager
        .add_root_pool("query.victim", 64 * MB, Some(reclaimer.clone()))
        .expect("root");
    let victim_leaf = victim_root.add_leaf_child("agg").expect("leaf");
    *reclaimer.leaf.lock().expect("leaf slot") = Some(Arc::clone(&victim_leaf));
    for _ in 0..6 {
        let allocation = victim_leaf.allocate(8 * MB).expect("grow");
        reclaimer.holdings.lock().expect("holdings").push(allocation);
    }

    let requester_root = manager.add_root_pool("query.req", 64 * MB, None).expect("root");
    let requester_leaf = requester_root.add_leaf_child("buffer").expect("leaf");
    let held = requester_leaf.allocate(32 * MB).expect("grow via reclaim");

    assert!(*reclaimer.observed_reentry_refusal.lock().expect("flag"));
    assert!(balanced(&manager, &[&victim_root, &requester_root]));
    drop(held);
}

#[test]
fn reclaimed_used_bytes_is_monotonic_across_rounds() {
    let manager = MemoryManager::new(MemoryManagerOptions {
        total_capacity: 64 * MB,
        pool_init_capacity: 0,
        allow_abort: false,
    });

    let victim_reclaimer = Arc::new(StubReclaimer::default());
    let victim_root = manager
        .add_root_pool("query.victim", 64 * MB, Some(victim_reclaimer.clone()))
        .expect("root");
    let victim_leaf = victim_root.add_leaf_child("agg").expect("leaf");
    for _ in 0..7 {
        victim_reclaimer.hold(victim_leaf.allocate(8 * MB).expect("grow"));
    }

    let requester_root = manager.add_root_pool("query.req", 64 * MB, None).expect("root");
    let requester_leaf = requester_root.add_leaf_child("buffer").expect("leaf");

    let first = requester_leaf.allocate(16 * MB).expect("first round");
    let after_first = manager.arbitrator().stats().reclaimed_used_bytes;
    let second = requester_leaf.allocate(16 * MB).expect("second round");
    let after_second = manager.arbitrator().stats().reclaimed_used_bytes;

    assert!(after_first > 0);
    assert!(after_second >= after_first);
    drop(first);
    drop(second);
}

#[test]
fn dropping_pools_returns_all_capacity() {
    let manager = MemoryManager::new(MemoryManagerOptions {
        total_capacity: 64 * MB,
        pool_init_capacity: 16 * MB,
        allow_abort: false,
    });
    {
        let root = manager.add_root_pool("query.q", 64 * MB, None).expect("root");
        let leaf = root.add_leaf_child("op").expect("leaf");
        let _held = leaf.allocate(20 * MB).expect("grow");
        assert!(manager.arbitrator().free_capacity() < 64 * MB);
    }
    assert_eq!(manager.arbitrator().free_capacity(), 64 * MB);
}
