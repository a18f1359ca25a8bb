//! Unit tests for winstone-pool

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::{BoxError, PoolConfig, PoolError, ResourceFactory, ResourcePool};

/// Hands out sequential ids and records what was destroyed.
#[derive(Clone, Default)]
struct Tracker {
    next: Arc<AtomicUsize>,
    destroyed: Arc<Mutex<Vec<usize>>>,
    fail_create: Arc<AtomicBool>,
    reject_on_return: Arc<AtomicBool>,
}

impl Tracker {
    fn destroyed(&self) -> Vec<usize> {
        self.destroyed.lock().unwrap().clone()
    }
}

impl ResourceFactory<usize> for Tracker {
    fn create(&self) -> Result<usize, BoxError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err("backend unavailable".into());
        }
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }

    fn destroy(&self, resource: usize) {
        self.destroyed.lock().unwrap().push(resource);
    }

    fn validate(&self, _resource: &usize) -> bool {
        !self.reject_on_return.load(Ordering::SeqCst)
    }
}

fn pool(capacity: usize, max_wait_ms: u64) -> (ResourcePool<usize>, Tracker) {
    let tracker = Tracker::default();
    let config = PoolConfig::new(capacity).with_max_wait(Duration::from_millis(max_wait_ms));
    (ResourcePool::new(config, tracker.clone()), tracker)
}

// ============================================================================
// Acquire / release
// ============================================================================

#[test]
fn acquire_creates_lazily() {
    let (pool, _) = pool(3, 10);
    assert_eq!(pool.stats().live, 0);

    let a = pool.acquire().unwrap();
    assert_eq!(pool.stats().live, 1);
    assert_eq!(pool.stats().in_use, 1);
    pool.release(a);

    let stats = pool.stats();
    assert_eq!((stats.idle, stats.in_use, stats.live), (1, 0, 1));
}

#[test]
fn released_resource_is_reused() {
    let (pool, _) = pool(2, 10);
    let a = pool.acquire().unwrap();
    pool.release(a);
    let b = pool.acquire().unwrap();
    assert_eq!(a, b);
    assert_eq!(pool.stats().created, 1);
}

#[test]
fn exhausted_pool_times_out_then_recovers_after_release() {
    let (pool, _) = pool(2, 100);
    let first = pool.acquire().unwrap();
    let _second = pool.acquire().unwrap();

    let started = Instant::now();
    let err = pool.acquire().unwrap_err();
    assert!(err.is_exhausted(), "unexpected error: {err}");
    assert!(started.elapsed() >= Duration::from_millis(100));

    pool.release(first);
    let started = Instant::now();
    let again = pool.acquire().unwrap();
    assert_eq!(again, first);
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[test]
fn waiting_acquire_is_woken_by_release() {
    let (pool, _) = pool(1, 5_000);
    let pool = Arc::new(pool);
    let held = pool.acquire().unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.acquire())
    };

    thread::sleep(Duration::from_millis(50));
    pool.release(held);

    let got = waiter.join().unwrap().unwrap();
    assert_eq!(got, held);
}

#[test]
fn construction_failure_frees_reserved_slot() {
    let (pool, tracker) = pool(1, 10);
    tracker.fail_create.store(true, Ordering::SeqCst);

    let err = pool.acquire().unwrap_err();
    assert!(matches!(err, PoolError::ConstructionFailure(_)));
    assert_eq!(pool.stats().live, 0);

    tracker.fail_create.store(false, Ordering::SeqCst);
    assert!(pool.acquire().is_ok());
}

#[test]
fn release_destroys_resources_failing_validation() {
    let (pool, tracker) = pool(2, 10);
    let a = pool.acquire().unwrap();
    tracker.reject_on_return.store(true, Ordering::SeqCst);
    pool.release(a);

    assert_eq!(tracker.destroyed(), vec![a]);
    assert_eq!(pool.stats().live, 0);
}

#[test]
fn release_trims_idle_above_max_idle() {
    let tracker = Tracker::default();
    let config = PoolConfig::new(4)
        .with_max_idle(1)
        .with_max_wait(Duration::from_millis(10));
    let pool = ResourcePool::new(config, tracker.clone());

    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    pool.release(a);
    pool.release(b);

    assert_eq!(pool.stats().idle, 1);
    assert_eq!(tracker.destroyed(), vec![a]);
}

// ============================================================================
// Invalidate / drain / apply_on_idle / close
// ============================================================================

#[test]
fn invalidate_destroys_and_frees_capacity() {
    let (pool, tracker) = pool(1, 10);
    let a = pool.acquire().unwrap();
    pool.invalidate(a);

    assert_eq!(tracker.destroyed(), vec![a]);
    let b = pool.acquire().unwrap();
    assert_ne!(a, b);
}

#[test]
fn drain_keeps_min_idle() {
    let tracker = Tracker::default();
    let config = PoolConfig::new(4)
        .with_min_idle(1)
        .with_max_wait(Duration::from_millis(10));
    let pool = ResourcePool::new(config, tracker.clone());

    let held: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
    for r in held {
        pool.release(r);
    }
    assert_eq!(pool.stats().idle, 4);

    assert_eq!(pool.drain(), 3);
    let stats = pool.stats();
    assert_eq!((stats.idle, stats.live), (1, 1));
    assert_eq!(tracker.destroyed().len(), 3);
    assert_eq!(pool.drain(), 0);
}

#[test]
fn apply_on_idle_visits_each_idle_resource_once() {
    let (pool, tracker) = pool(3, 10);
    let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
    for r in &held {
        pool.release(*r);
    }

    let mut seen = Vec::new();
    let probed = pool.apply_on_idle(|r| {
        seen.push(*r);
        *r != held[1]
    });

    assert_eq!(probed, 3);
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);
    assert_eq!(tracker.destroyed(), vec![held[1]]);
    assert_eq!(pool.stats().idle, 2);
}

#[test]
fn apply_on_idle_ignores_resources_on_loan() {
    let (pool, _) = pool(2, 10);
    let on_loan = pool.acquire().unwrap();
    let idle = pool.acquire().unwrap();
    pool.release(idle);

    let mut seen = Vec::new();
    pool.apply_on_idle(|r| {
        seen.push(*r);
        true
    });
    assert_eq!(seen, vec![idle]);
    pool.release(on_loan);
}

#[test]
fn close_destroys_idle_and_rejects_acquire() {
    let (pool, tracker) = pool(2, 10);
    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    pool.release(a);

    pool.close();
    assert!(matches!(pool.acquire().unwrap_err(), PoolError::Closed));
    assert_eq!(tracker.destroyed(), vec![a]);

    pool.release(b);
    assert_eq!(tracker.destroyed(), vec![a, b]);
    assert_eq!(pool.stats().live, 0);
}

#[test]
fn guard_returns_resource_on_drop() {
    let (pool, tracker) = pool(1, 10);
    {
        let guard = pool.acquire_guard().unwrap();
        assert_eq!(*guard, 0);
        assert_eq!(pool.stats().in_use, 1);
    }
    assert_eq!(pool.stats().idle, 1);

    let guard = pool.acquire_guard().unwrap();
    guard.invalidate();
    assert_eq!(tracker.destroyed(), vec![0]);
    assert_eq!(pool.stats().live, 0);
}

#[test]
#[should_panic(expected = "pool capacity must be positive")]
fn zero_capacity_panics() {
    let _ = pool(0, 10);
}

#[test]
fn concurrent_acquire_never_exceeds_capacity() {
    let (pool, _) = pool(3, 2_000);
    let pool = Arc::new(pool);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for _ in 0..25 {
                    let r = pool.acquire().unwrap();
                    assert!(pool.stats().live <= 3);
                    thread::yield_now();
                    pool.release(r);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = pool.stats();
    assert!(stats.created <= 3);
    assert_eq!(stats.in_use, 0);
}

// ============================================================================
// Property-Based Tests
// ============================================================================

use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Acquire,
    Release,
    Invalidate,
    Drain,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Acquire),
        2 => Just(Op::Release),
        1 => Just(Op::Invalidate),
        1 => Just(Op::Drain),
    ]
}

proptest! {
    /// Property: idle + in-use never exceeds capacity, whatever the call order.
    #[test]
    fn prop_live_count_bounded(capacity in 1usize..5, ops in prop::collection::vec(op(), 1..60)) {
        let (pool, _) = pool(capacity, 0);
        let mut held = Vec::new();

        for op in ops {
            match op {
                Op::Acquire => {
                    if let Ok(r) = pool.acquire() {
                        held.push(r);
                    }
                }
                Op::Release => {
                    if let Some(r) = held.pop() {
                        pool.release(r);
                    }
                }
                Op::Invalidate => {
                    if let Some(r) = held.pop() {
                        pool.invalidate(r);
                    }
                }
                Op::Drain => {
                    pool.drain();
                }
            }

            let stats = pool.stats();
            prop_assert!(stats.idle + stats.in_use <= capacity);
            prop_assert_eq!(stats.in_use, held.len());
            prop_assert_eq!(stats.live, stats.idle + stats.in_use);
        }
    }
}
