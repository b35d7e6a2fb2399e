//! Pool-level invariants under randomized and adversarial schedules.
//!
//! The properties here are the ones the unit tests cannot pin down with
//! a fixed schedule: exclusive ownership under arbitrary interleavings,
//! full restoration once every worker is done, and forward progress of
//! the claim scan when the table churns faster than any one scan.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

use fairpool::{AcquireMode, ResourceId, ResourcePool};

fn pool(n: u32) -> Arc<ResourcePool> {
    ResourcePool::build((0..n).map(ResourceId::new), AcquireMode::Uninterruptible)
}

/// Claims the whole pool through try_acquire and hands everything back,
/// checking that exactly `n` distinct handles came out.
fn drain_and_refill(pool: &ResourcePool, n: usize) -> Result<(), TestCaseError> {
    let mut drained = Vec::with_capacity(n);
    while let Some(handle) = pool.try_acquire() {
        drained.push(handle);
    }
    prop_assert_eq!(drained.len(), n);
    let distinct: HashSet<_> = drained.iter().copied().collect();
    prop_assert_eq!(distinct.len(), n);
    for handle in drained {
        pool.release(handle);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// After every worker finishes, the pool is exactly as built.
    #[test]
    fn quiescent_pool_is_fully_restored(
        size in 1u32..4,
        workers in 1usize..6,
        cycles in 1usize..25,
    ) {
        let pool = pool(size);
        let start = Arc::new(Barrier::new(workers));

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    for _ in 0..cycles {
                        let handle = pool.acquire_uninterruptibly().unwrap();
                        std::hint::black_box(handle);
                        pool.release(handle);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        prop_assert_eq!(pool.available_permits(), size as usize);
        prop_assert_eq!(pool.in_use(), 0);
        drain_and_refill(&pool, size as usize)?;
    }

    /// No two live holders ever see the same handle.
    #[test]
    fn concurrent_holders_are_always_distinct(
        size in 1u32..4,
        workers in 2usize..7,
        cycles in 1usize..20,
    ) {
        let pool = pool(size);
        let held = Arc::new(Mutex::new(HashSet::new()));
        let start = Arc::new(Barrier::new(workers));

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let held = Arc::clone(&held);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    for _ in 0..cycles {
                        let handle = pool.acquire_uninterruptibly().unwrap();
                        assert!(
                            held.lock().unwrap().insert(handle),
                            "{handle} handed to two workers at once"
                        );
                        thread::yield_now();
                        assert!(held.lock().unwrap().remove(&handle));
                        pool.release(handle);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        prop_assert!(held.lock().unwrap().is_empty());
        prop_assert_eq!(pool.available_permits(), size as usize);
    }
}

/// The claim scan finishes even when the table churns continuously.
///
/// Three times as many workers as slots keeps every scan racing against
/// concurrent flips. A watchdog converts livelock into a test failure
/// instead of a hang.
#[test]
fn claim_scan_makes_progress_under_churn() {
    const SIZE: u32 = 4;
    const WORKERS: usize = 12;
    const CYCLES: usize = 300;

    let pool = pool(SIZE);
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);

    let driver = thread::spawn(move || {
        let start = Arc::new(Barrier::new(WORKERS));
        let workers: Vec<_> = (0..WORKERS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    for _ in 0..CYCLES {
                        let handle = pool.acquire_uninterruptibly().unwrap();
                        pool.release(handle);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(pool.available_permits(), SIZE as usize);
        done_tx.send(()).unwrap();
    });

    done_rx
        .recv_timeout(Duration::from_secs(60))
        .expect("claim scans stopped making progress");
    driver.join().unwrap();
}

/// Releases of handles the pool never owned are inert even while real
/// traffic is in flight.
#[test]
fn unknown_release_storm_is_inert() {
    const SIZE: u32 = 2;

    let pool = pool(SIZE);
    let stop = Arc::new(AtomicBool::new(false));

    let storm = {
        let pool = Arc::clone(&pool);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut raw = SIZE;
            while !stop.load(Ordering::Relaxed) {
                pool.release(ResourceId::new(raw));
                raw = raw.wrapping_add(1).max(SIZE);
            }
        })
    };

    for _ in 0..500 {
        let handle = pool.acquire_uninterruptibly().unwrap();
        assert!(handle.raw() < SIZE, "pool granted a handle it does not own");
        pool.release(handle);
    }
    stop.store(true, Ordering::Relaxed);
    storm.join().unwrap();

    assert_eq!(pool.available_permits(), SIZE as usize);
    assert_eq!(pool.in_use(), 0);
    assert!(pool.try_acquire().is_some());
}
