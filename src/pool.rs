//! Resource pool built from a fair semaphore and a lock-free availability
//! table.
//!
//! # Purpose
//!
//! Mediates concurrent access by many worker threads to a small, fixed set
//! of interchangeable resources. The semaphore caps how many callers hold a
//! resource at once (and queues the overflow in strict FIFO order); the
//! table decides *which* resource a permitted caller gets.
//!
//! # Architecture
//!
//! ```text
//! acquire()
//!     └── FairSemaphore::acquire()      ← caps holders at N, FIFO queue
//!         └── ResourceTable::claim_any() ← CAS scan for a free slot
//! release(handle)
//!     └── ResourceTable::make_available() ← flip first (capture previous)
//!         └── FairSemaphore::release()     ← only if the flip held->free
//! ```
//!
//! # Correctness Invariants
//!
//! - **Bounded**: at most `pool_size()` resources are held at any instant.
//! - **Conserved**: `available_permits() + held == pool_size()` at every
//!   quiescent point (no calls in flight).
//! - **Ordered**: the release path flips the table before returning the
//!   permit, so a caller unblocked by that permit always finds a free slot
//!   on its scan.
//! - **Idempotent release**: releasing a handle that is already available
//!   (or was never pooled) changes nothing, in particular it never pushes
//!   the permit count past `pool_size()`.
//!
//! # Performance Characteristics
//!
//! | Operation   | Cost                                          |
//! |-------------|-----------------------------------------------|
//! | acquire     | semaphore fast path + one table pass, typical |
//! | release     | one atomic swap + lock/notify if queued       |
//! | try_acquire | lock + check, then one or more table passes   |
//!
//! The claim scan is O(N) per pass and may repeat while racing claimers
//! shuffle slots; a reserved permit guarantees a slot is logically
//! earmarked, so the retry count is governed by scheduler fairness, not by
//! a fixed bound.
//!
//! # Known Limitations
//!
//! - No fairness among *permitted* callers racing in the table scan; any
//!   of them may claim any free slot. Resources are interchangeable, so
//!   this is acceptable; FIFO order is enforced one level up, at the
//!   semaphore.
//! - `reset` assumes a quiescent pool. Callers mid-acquire across a reset
//!   are woken rather than stranded, but what they observe is undefined.

#[cfg(loom)]
use loom::sync::{Arc, Mutex, MutexGuard};
#[cfg(not(loom))]
use std::sync::{Arc, Mutex, MutexGuard};

use std::fmt;

use crate::cancel::CancelToken;
use crate::errors::AcquireError;
use crate::semaphore::FairSemaphore;
use crate::table::{ResourceId, ResourceTable};

// ============================================================================
// AcquireMode
// ============================================================================

/// Blocking policy used by [`ResourcePool::acquire_default`].
///
/// Both policies are always available as explicit entry points
/// ([`acquire`](ResourcePool::acquire) and
/// [`acquire_uninterruptibly`](ResourcePool::acquire_uninterruptibly));
/// the mode only selects which one the mode-driven entry point forwards
/// to, so a pool's chosen policy is visible at its construction site.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AcquireMode {
    /// Blocked acquires observe the caller's [`CancelToken`] and fail with
    /// [`AcquireError::Cancelled`] when it is raised.
    Interruptible,
    /// Blocked acquires ignore cancellation and wait for a permit; a raised
    /// token stays raised for the caller to observe afterwards. This is the
    /// default because workers that already hold queue positions usually
    /// finish their cycle and check for shutdown between cycles.
    #[default]
    Uninterruptible,
}

// ============================================================================
// ResourcePool
// ============================================================================

/// Fixed pool of interchangeable resources with FIFO-fair admission.
///
/// # Thread Safety
///
/// Safe to share via `Arc<ResourcePool>`. Every method takes `&self`.
///
/// # Usage
///
/// ```ignore
/// let pool = ResourcePool::build(
///     (0..4).map(ResourceId::new),
///     AcquireMode::Uninterruptible,
/// );
///
/// // Worker loop
/// let handle = pool.acquire_uninterruptibly()?;
/// use_resource(handle);
/// pool.release(handle);
///
/// // Or RAII, so a panicking worker cannot leak its slot
/// let guard = pool.acquire_guard(&token)?;
/// use_resource(guard.handle());
/// // guard drop releases
/// ```
pub struct ResourcePool {
    /// Per-resource availability flags; never replaced, only flipped.
    table: ResourceTable,
    /// Current semaphore. Swapped wholesale by [`reset`](Self::reset), so
    /// acquire/release paths clone the `Arc` out under this brief lock.
    semaphore: Mutex<Arc<FairSemaphore>>,
    /// Policy forwarded to by [`acquire_default`](Self::acquire_default).
    mode: AcquireMode,
}

impl ResourcePool {
    /// Builds a pool over `handles`, every one of them available, with the
    /// permit count equal to the (deduplicated) handle count.
    ///
    /// # Panics
    ///
    /// Panics if no handles remain after deduplication; a zero-resource
    /// pool has nothing to mediate and is always a call-site bug.
    pub fn build(handles: impl IntoIterator<Item = ResourceId>, mode: AcquireMode) -> Arc<Self> {
        let table = ResourceTable::new(handles);
        let semaphore = FairSemaphore::new(table.len());
        Arc::new(Self {
            table,
            semaphore: Mutex::new(semaphore),
            mode,
        })
    }

    /// Number of pooled resources (N). Fixed for the pool's lifetime.
    #[inline]
    pub fn pool_size(&self) -> usize {
        self.table.len()
    }

    /// The policy [`acquire_default`](Self::acquire_default) forwards to.
    #[inline]
    pub fn mode(&self) -> AcquireMode {
        self.mode
    }

    /// Permits grantable right now with nobody queued ahead. Advisory:
    /// stale the instant it is read under concurrency.
    pub fn available_permits(&self) -> usize {
        self.current_semaphore().available_permits()
    }

    /// Resources currently held by callers. Advisory, derived as
    /// `pool_size - available_permits`; queued waiters do not count as
    /// holders.
    pub fn in_use(&self) -> usize {
        self.pool_size().saturating_sub(self.available_permits())
    }

    /// True if `handle` belongs to this pool.
    pub fn contains(&self, handle: ResourceId) -> bool {
        self.table.contains(handle)
    }

    /// True once [`shutdown_now`](Self::shutdown_now) has been called and
    /// no [`reset`](Self::reset) has run since.
    pub fn is_shut_down(&self) -> bool {
        self.current_semaphore().is_closed()
    }

    // ------------------------------------------------------------------
    // Acquire
    // ------------------------------------------------------------------

    /// Claims one resource, blocking in FIFO order as needed. Fails with
    /// [`AcquireError::Cancelled`] if `token` is raised before or during
    /// the wait, and with [`AcquireError::ShutDown`] after
    /// [`shutdown_now`](Self::shutdown_now).
    pub fn acquire(&self, token: &CancelToken) -> Result<ResourceId, AcquireError> {
        self.current_semaphore().acquire(token)?;
        Ok(self.claim_reserved_slot())
    }

    /// Claims one resource, blocking in FIFO order and ignoring
    /// cancellation; a token raised meanwhile stays raised for the caller
    /// to observe afterwards. The only failure is
    /// [`AcquireError::ShutDown`].
    ///
    /// This is the policy the pool was originally run with: a worker that
    /// reached the queue keeps its position and finishes the cycle.
    pub fn acquire_uninterruptibly(&self) -> Result<ResourceId, AcquireError> {
        self.current_semaphore().acquire_uninterruptibly()?;
        Ok(self.claim_reserved_slot())
    }

    /// Claims one resource using the pool's configured [`AcquireMode`].
    ///
    /// In uninterruptible mode `token` is not observed by this call (it
    /// stays raised for later); callers pass it anyway so call sites stay
    /// mode-independent.
    pub fn acquire_default(&self, token: &CancelToken) -> Result<ResourceId, AcquireError> {
        match self.mode {
            AcquireMode::Interruptible => self.acquire(token),
            AcquireMode::Uninterruptible => self.acquire_uninterruptibly(),
        }
    }

    /// Claims one resource without blocking, or returns `None` when no
    /// permit is immediately grantable (none free, someone queued ahead,
    /// or the pool is shut down).
    pub fn try_acquire(&self) -> Option<ResourceId> {
        if !self.current_semaphore().try_acquire() {
            return None;
        }
        Some(self.claim_reserved_slot())
    }

    /// [`acquire`](Self::acquire), wrapped so the claimed resource is
    /// released when the guard drops, including during a panic unwind.
    pub fn acquire_guard(&self, token: &CancelToken) -> Result<PoolGuard<'_>, AcquireError> {
        let handle = self.acquire(token)?;
        Ok(PoolGuard { pool: self, handle })
    }

    /// Scan-and-flip with restart. Callers hold a reserved permit, which
    /// earmarks one free slot for them; a pass can still come up empty
    /// while racing claimers shuffle slots, so the scan restarts until a
    /// CAS wins. Yields between passes so a preempted releaser (table flip
    /// done, permit release pending) gets scheduled.
    fn claim_reserved_slot(&self) -> ResourceId {
        loop {
            if let Some(handle) = self.table.claim_any() {
                return handle;
            }
            std::thread::yield_now();
        }
    }

    // ------------------------------------------------------------------
    // Release / lifecycle
    // ------------------------------------------------------------------

    /// Returns `handle` to the pool.
    ///
    /// Unknown handles and handles that are already available are silent
    /// no-ops: only a genuine held-to-available flip returns a permit, so
    /// double releases can never drive the permit count past
    /// `pool_size()`. Infallible, callable from any thread.
    pub fn release(&self, handle: ResourceId) {
        // Flip before releasing the permit: a waiter unblocked by the
        // release scans immediately and must find this slot.
        match self.table.make_available(handle) {
            Some(false) => self.current_semaphore().release(),
            // Already available (double release) or never pooled.
            Some(true) | None => {}
        }
    }

    /// Re-marks every resource available and rebuilds the semaphore to the
    /// full permit count, reopening the pool if it was shut down. Handle
    /// identities persist; only availability state resets.
    ///
    /// Intended for a quiescent pool between runs. Callers still blocked in
    /// acquire from the previous run are granted or failed with
    /// [`AcquireError::ShutDown`] rather than stranded, but their permit
    /// accounting against the rebuilt pool is undefined.
    pub fn reset(&self) {
        self.table.mark_all_available();
        let retired = {
            let mut current = lock_or_recover(&self.semaphore);
            std::mem::replace(&mut *current, FairSemaphore::new(self.table.len()))
        };
        // Leftover waiters parked on the retired semaphore: grant the ones
        // already queued (every slot is free again, so their scans succeed)
        // and close it so a late enqueuer unwinds instead of parking on a
        // semaphore nobody will ever release again.
        while retired.queued() > 0 {
            retired.release();
        }
        retired.close();
    }

    /// Fails all queued and future blocking acquires with
    /// [`AcquireError::ShutDown`].
    ///
    /// Best effort: current holders are not drained, their `release` calls
    /// still work, and a release racing the shutdown may complete one last
    /// grant. [`reset`](Self::reset) reopens the pool.
    pub fn shutdown_now(&self) {
        self.current_semaphore().close();
    }

    fn current_semaphore(&self) -> Arc<FairSemaphore> {
        Arc::clone(&lock_or_recover(&self.semaphore))
    }
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("size", &self.pool_size())
            .field("available", &self.available_permits())
            .field("mode", &self.mode)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

// ============================================================================
// PoolGuard
// ============================================================================

/// RAII holder for one claimed resource.
///
/// Dropping the guard releases the handle, including during a panic
/// unwind, so a crashing worker cannot shrink the pool for everyone else.
/// The explicit [`acquire`](ResourcePool::acquire) /
/// [`release`](ResourcePool::release) pair remains the primary API; the
/// guard exists for callers whose hold spans fallible code.
#[must_use = "PoolGuard releases its resource on drop; not holding it returns the resource immediately"]
pub struct PoolGuard<'a> {
    pool: &'a ResourcePool,
    handle: ResourceId,
}

impl PoolGuard<'_> {
    /// The claimed resource.
    #[inline]
    pub fn handle(&self) -> ResourceId {
        self.handle
    }

    /// Disarms the guard and hands the handle to the caller, who becomes
    /// responsible for the eventual [`release`](ResourcePool::release).
    pub fn into_handle(self) -> ResourceId {
        let handle = self.handle;
        // No heap state; skipping Drop is the whole point.
        std::mem::forget(self);
        handle
    }
}

impl Drop for PoolGuard<'_> {
    fn drop(&mut self) {
        self.pool.release(self.handle);
    }
}

impl fmt::Debug for PoolGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolGuard")
            .field("handle", &self.handle)
            .finish()
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// Tests
// ============================================================================
