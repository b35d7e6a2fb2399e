//! Level-triggered cancellation for blocking acquires.
//!
//! A [`CancelToken`] stands in for an ambient per-thread interrupt flag:
//! the controller raises it, and any acquire parked with that token wakes
//! up and unwinds with [`AcquireError::Cancelled`](crate::AcquireError).
//! The flag stays raised until [`clear`](CancelToken::clear) is called, so
//! a request that lands while no acquire is in flight is observed by the
//! next one.
//!
//! # Ordering
//! The `cancelled` flag uses Release/Acquire so a raise is visible to any
//! check that synchronizes with it. Promptness for *parked* waiters does
//! not rely on the flag at all: [`cancel`](CancelToken::cancel) snapshots
//! the waiter registry under its mutex and wakes each waiter through the
//! waiter's own lock. A waiter that registers after the snapshot was taken
//! is covered too, because registration and the snapshot contend on the
//! registry mutex: registering after the snapshot means the raise
//! happens-before everything the waiter does next, so its pre-park flag
//! check observes the raise.

#[cfg(loom)]
use loom::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};
#[cfg(not(loom))]
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};

use std::fmt;

use crate::semaphore::Waiter;

/// Shared cancellation flag plus the waiters currently parked under it.
///
/// Cloning is cheap (one `Arc`); all clones observe the same flag. One
/// token per worker thread is the expected shape, but nothing prevents a
/// single token from cancelling several parked acquires at once.
///
/// # Examples
///
/// ```ignore
/// let token = CancelToken::new();
/// let t = token.clone();
/// std::thread::spawn(move || t.cancel());
/// match sem.acquire(&token) {
///     Err(AcquireError::Cancelled) => { /* stop requested */ }
///     Ok(()) => { /* got the permit before the raise landed */ }
///     Err(other) => unreachable!("{other}"),
/// }
/// ```
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    /// Waiters to wake on `cancel()`. Entries are added just before a
    /// waiter parks and removed when its acquire call unwinds.
    parked: Mutex<Vec<Arc<Waiter>>>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            parked: Mutex::new(Vec::new()),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Creates a token with the flag lowered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::default()),
        }
    }

    /// Raises the flag and wakes every acquire currently parked with this
    /// token. Idempotent; raising an already-raised token is a no-op apart
    /// from re-waking parked waiters.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        // Snapshot under the registry lock, wake outside it. Waking locks
        // each waiter's private mutex; keeping the registry lock ordering
        // strictly registry->waiter (never the reverse) is what makes this
        // deadlock-free against concurrent register/unregister.
        let parked: Vec<Arc<Waiter>> = lock_or_recover(&self.inner.parked).clone();
        for waiter in parked {
            waiter.wake();
        }
    }

    /// Current state of the flag. Advisory outside the waiter protocol:
    /// a concurrent `cancel` may land right after this returns `false`.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Lowers the flag so the token can be reused for another run.
    ///
    /// Call this only between acquires; lowering the flag while an acquire
    /// is mid-unwind does not un-cancel that call.
    pub fn clear(&self) {
        self.inner.cancelled.store(false, Ordering::Release);
    }

    /// Registers a waiter for wakeup; the returned guard unregisters on
    /// drop. The caller must not hold the waiter's lock across this call
    /// or across the guard's drop (lock order is registry before waiter).
    pub(crate) fn register_waiter(&self, waiter: &Arc<Waiter>) -> WaiterRegistration<'_> {
        lock_or_recover(&self.inner.parked).push(Arc::clone(waiter));
        WaiterRegistration {
            token: self,
            waiter_id: waiter.id(),
        }
    }

    fn unregister(&self, waiter_id: u64) {
        lock_or_recover(&self.inner.parked).retain(|w| w.id() != waiter_id);
    }

    #[cfg(test)]
    pub(crate) fn parked_len(&self) -> usize {
        lock_or_recover(&self.inner.parked).len()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.inner.cancelled.load(Ordering::Relaxed))
            .finish()
    }
}

/// Removes the waiter from the token's registry when the acquire call
/// unwinds, whatever the outcome.
pub(crate) struct WaiterRegistration<'a> {
    token: &'a CancelToken,
    waiter_id: u64,
}

impl Drop for WaiterRegistration<'_> {
    fn drop(&mut self) {
        self.token.unregister(self.waiter_id);
    }
}

/// A waiter panicking with the registry locked must not wedge every other
/// user of the token; the registry holds only `Arc`s, so the state is
/// sound even after a poisoned unlock.
fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
