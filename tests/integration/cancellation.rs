//! Cancellation and timeout unwinds: every exit path must leave the
//! permit accounting exactly where it was.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fairpool::{AcquireError, AcquireMode, CancelToken, FairSemaphore, ResourceId, ResourcePool};

fn eventually(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

/// A raise that lands before the call fails it without touching permits.
#[test]
fn pre_raised_token_fails_without_consuming() {
    let sem = FairSemaphore::new(2);
    let token = CancelToken::new();
    token.cancel();

    assert_eq!(sem.acquire(&token), Err(AcquireError::Cancelled));
    assert_eq!(sem.available_permits(), 2);

    // The flag is level-triggered: still set until cleared.
    assert_eq!(sem.acquire(&token), Err(AcquireError::Cancelled));
    token.clear();
    sem.acquire(&token).unwrap();
    assert_eq!(sem.available_permits(), 1);
}

/// Cancelling a parked waiter withdraws it: queue empty, permits intact,
/// and a later waiter is unaffected.
#[test]
fn cancel_withdraws_only_the_cancelled_waiter() {
    let sem = FairSemaphore::new(0);
    let doomed = CancelToken::new();
    let spared = CancelToken::new();

    let first = {
        let sem = Arc::clone(&sem);
        let token = doomed.clone();
        thread::spawn(move || sem.acquire(&token))
    };
    assert!(eventually(|| sem.queued() == 1));
    let second = {
        let sem = Arc::clone(&sem);
        let token = spared.clone();
        thread::spawn(move || sem.acquire(&token))
    };
    assert!(eventually(|| sem.queued() == 2));

    doomed.cancel();
    assert_eq!(first.join().unwrap(), Err(AcquireError::Cancelled));
    assert_eq!(sem.queued(), 1, "the surviving waiter was withdrawn too");

    // The head position vacated by the cancelled waiter goes to the
    // survivor on the next release.
    sem.release();
    second.join().unwrap().unwrap();
    assert_eq!(sem.available_permits(), 0);
    assert_eq!(sem.queued(), 0);
}

/// The hand-off crux, hammered: when a cancel races the release that
/// grants the same waiter, the permit must survive whichever side wins.
#[test]
fn cancel_racing_handoff_never_loses_the_permit() {
    const ROUNDS: usize = 200;

    for round in 0..ROUNDS {
        let sem = FairSemaphore::new(0);
        let token = CancelToken::new();

        let waiter = {
            let sem = Arc::clone(&sem);
            let token = token.clone();
            thread::spawn(move || {
                let outcome = sem.acquire(&token);
                if outcome.is_ok() {
                    // Granted despite the cancel: hand the permit back so
                    // the final count is deterministic.
                    sem.release();
                }
                outcome
            })
        };
        assert!(eventually(|| sem.queued() == 1), "round {round}: never queued");

        // Fire the release and the cancel as close together as this host
        // allows; alternate which goes first to widen the interleavings.
        if round % 2 == 0 {
            sem.release();
            token.cancel();
        } else {
            let canceller = {
                let token = token.clone();
                thread::spawn(move || token.cancel())
            };
            sem.release();
            canceller.join().unwrap();
        }

        let outcome = waiter.join().unwrap();
        assert!(
            matches!(outcome, Ok(()) | Err(AcquireError::Cancelled)),
            "round {round}: unexpected outcome {outcome:?}"
        );
        assert_eq!(
            sem.available_permits(),
            1,
            "round {round}: permit lost or duplicated ({outcome:?})"
        );
        assert_eq!(sem.queued(), 0, "round {round}: waiter stranded");
    }
}

/// Timing out performs the same unwind as cancellation.
#[test]
fn timeout_unwinds_like_cancellation() {
    let sem = FairSemaphore::new(0);
    let token = CancelToken::new();

    let started = Instant::now();
    assert_eq!(
        sem.acquire_timeout(&token, Duration::from_millis(40)),
        Err(AcquireError::TimedOut)
    );
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(sem.available_permits(), 0);
    assert_eq!(sem.queued(), 0, "timed-out waiter left in the queue");

    // The semaphore still works afterwards.
    sem.release();
    sem.acquire_timeout(&token, Duration::from_secs(5)).unwrap();
    assert_eq!(sem.available_permits(), 0);
}

/// Several timed acquires expire against an exhausted semaphore without
/// disturbing each other or the count.
#[test]
fn concurrent_timeouts_all_expire_cleanly() {
    const WAITERS: usize = 4;

    let sem = FairSemaphore::new(0);
    let workers: Vec<_> = (0..WAITERS)
        .map(|_| {
            let sem = Arc::clone(&sem);
            thread::spawn(move || {
                let token = CancelToken::new();
                sem.acquire_timeout(&token, Duration::from_millis(30))
            })
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.join().unwrap(), Err(AcquireError::TimedOut));
    }
    assert_eq!(sem.available_permits(), 0);
    assert_eq!(sem.queued(), 0);
}

/// The uninterruptible pool entry point absorbs a cancellation raised
/// mid-wait and leaves the flag raised for the worker's own loop to see.
#[test]
fn uninterruptible_pool_acquire_defers_cancellation() {
    let pool = ResourcePool::build([ResourceId::new(0)], AcquireMode::Uninterruptible);
    let held = pool.acquire_uninterruptibly().unwrap();

    let token = CancelToken::new();
    let (tx, rx) = crossbeam_channel::bounded(1);
    let worker = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let handle = pool.acquire_uninterruptibly().unwrap();
            tx.send(()).unwrap();
            pool.release(handle);
        })
    };

    thread::sleep(Duration::from_millis(50));
    token.cancel();
    // Still parked: the raise must not unblock an uninterruptible wait.
    assert!(
        rx.recv_timeout(Duration::from_millis(100)).is_err(),
        "uninterruptible acquire was interrupted"
    );

    pool.release(held);
    rx.recv_timeout(Duration::from_secs(5))
        .expect("release did not unblock the worker");
    worker.join().unwrap();

    assert!(token.is_cancelled(), "pending cancellation state was lost");
    assert_eq!(pool.available_permits(), 1);
}

/// One token cancelling several parked workers at once: all unwind, none
/// strand, permits stay put.
#[test]
fn one_token_cancels_a_crowd() {
    const WAITERS: usize = 5;

    let pool = ResourcePool::build([ResourceId::new(0)], AcquireMode::Interruptible);
    let held = pool.acquire_default(&CancelToken::new()).unwrap();

    let token = CancelToken::new();
    let workers: Vec<_> = (0..WAITERS)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let token = token.clone();
            thread::spawn(move || pool.acquire(&token))
        })
        .collect();

    // Let the crowd park, then drop the flag on all of them.
    thread::sleep(Duration::from_millis(50));
    token.cancel();

    for worker in workers {
        assert_eq!(worker.join().unwrap(), Err(AcquireError::Cancelled));
    }
    assert_eq!(pool.available_permits(), 0);
    pool.release(held);
    assert_eq!(pool.available_permits(), 1);
}
