//! Lock-free availability table mapping resource handles to claim flags.
//!
//! # Invariants
//! - The slot set is fixed at construction; handles are never added,
//!   removed, or destroyed during a run, only flipped between available
//!   and held.
//! - `available_count() + held slots == len()` at every instant (each slot
//!   is exactly one or the other).
//!
//! # Ordering
//! - A successful claim CAS uses `Acquire`; a release flip uses `Release`.
//!   The pair guarantees that a claimer that observes `available == true`
//!   also observes everything the releaser published before flipping the
//!   slot back, and in particular that a table flip is visible no later
//!   than the semaphore release that follows it (so a freshly unblocked
//!   scanner finds its slot instead of spinning through a stale view).
//! - Advisory reads (`available_count`, `is_available`) are `Relaxed`;
//!   they are diagnostics, not synchronization.
//!
//! # Performance
//! - `claim_any` is O(len) per pass; `make_available` is O(len) lookup
//!   plus one atomic swap. Pools are small (a handful of interchangeable
//!   resources), so linear scans beat any index structure here.
//! - Each slot sits on its own cache line (`CachePadded`) because
//!   concurrent claimers hammer neighbouring flags during a scan.

#[cfg(loom)]
use loom::sync::atomic::{AtomicBool, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicBool, Ordering};

use std::fmt;

use crossbeam_utils::CachePadded;

// ============================================================================
// ResourceId
// ============================================================================

/// Opaque identity of one pooled resource.
///
/// The pool never inspects the value; callers pick any scheme they like
/// (indexes, device numbers, ...). Identities are immutable and persist
/// across [`reset`](crate::ResourcePool::reset).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ResourceId(u32);

impl ResourceId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource#{}", self.0)
    }
}

// ============================================================================
// ResourceTable
// ============================================================================

struct Slot {
    handle: ResourceId,
    available: AtomicBool,
}

/// Fixed set of (handle, available) slots claimed and released with
/// per-slot compare-and-swap; there is no table-wide lock.
///
/// Claiming is first-writer-wins per slot: concurrent claimers may race on
/// the same slot, exactly one CAS succeeds, and the losers move on to the
/// next candidate. Releasing captures the previous flag value so callers
/// can tell a genuine hand-back from a double release.
pub struct ResourceTable {
    slots: Box<[CachePadded<Slot>]>,
}

impl ResourceTable {
    /// Builds a table with every handle marked available. Duplicate handles
    /// are collapsed to one slot, keeping first-occurrence order.
    ///
    /// # Panics
    ///
    /// Panics if no handles remain after deduplication (a zero-resource
    /// pool has nothing to mediate and is always a bug at the call site).
    pub fn new(handles: impl IntoIterator<Item = ResourceId>) -> Self {
        // Linear dedupe: pools are a handful of slots, not thousands.
        let mut slots: Vec<CachePadded<Slot>> = Vec::new();
        for handle in handles {
            if slots.iter().any(|s| s.handle == handle) {
                continue;
            }
            slots.push(CachePadded::new(Slot {
                handle,
                available: AtomicBool::new(true),
            }));
        }
        assert!(!slots.is_empty(), "ResourceTable requires at least one handle");
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    /// Number of slots (pool size N).
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// True if `handle` has a slot in this table.
    pub fn contains(&self, handle: ResourceId) -> bool {
        self.slot(handle).is_some()
    }

    /// Handles in slot order.
    pub fn handles(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.slots.iter().map(|s| s.handle)
    }

    /// One scan pass: claims and returns the first available handle, or
    /// `None` if every slot was held (or lost to a racing claimer) for the
    /// whole pass.
    ///
    /// Callers that have already reserved a permit retry the pass: a permit
    /// guarantees one slot is logically theirs, but a concurrent claimer may
    /// transiently take "their" slot while giving up a different one, so a
    /// single pass can legitimately come up empty.
    pub fn claim_any(&self) -> Option<ResourceId> {
        for slot in self.slots.iter() {
            if slot
                .available
                .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(slot.handle);
            }
        }
        None
    }

    /// Marks `handle` available, returning the previous flag value, or
    /// `None` for a handle this table has never contained.
    ///
    /// `Some(false)` is the genuine hand-back; `Some(true)` means the slot
    /// was already available (a double release) and the caller must not
    /// return a permit for it.
    pub fn make_available(&self, handle: ResourceId) -> Option<bool> {
        let slot = self.slot(handle)?;
        Some(slot.available.swap(true, Ordering::Release))
    }

    /// Flips every slot to available. Reset-time bulk operation; concurrent
    /// claimers see each flip individually, not a snapshot.
    pub fn mark_all_available(&self) {
        for slot in self.slots.iter() {
            slot.available.store(true, Ordering::Release);
        }
    }

    /// Number of currently-available slots. Advisory: concurrent flips make
    /// this stale immediately.
    pub fn available_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.available.load(Ordering::Relaxed))
            .count()
    }

    /// Availability of one handle; `None` for an unknown handle. Advisory.
    pub fn is_available(&self, handle: ResourceId) -> Option<bool> {
        Some(self.slot(handle)?.available.load(Ordering::Relaxed))
    }

    fn slot(&self, handle: ResourceId) -> Option<&Slot> {
        self.slots
            .iter()
            .find(|slot| slot.handle == handle)
            .map(|padded| &**padded)
    }
}

impl fmt::Debug for ResourceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTable")
            .field("len", &self.len())
            .field("available", &self.available_count())
            .finish()
    }
}

// ============================================================================
// Kani proofs, property tests, and unit tests
// ============================================================================

#[cfg(any(all(test, feature = "pool-proptest"), kani))]
#[path = "table_tests.rs"]
mod table_tests;

// ---------------------------------------------------------------------------
// Loom concurrency tests
// ---------------------------------------------------------------------------

#[cfg(loom)]
mod loom_tests {
    use super::*;
    use loom::thread;

    /// Two threads race to claim a single slot; exactly one wins.
    #[test]
    fn loom_single_slot_single_winner() {
        loom::model(|| {
            let table = std::sync::Arc::new(ResourceTable::new([ResourceId::new(7)]));
            let t2 = table.clone();

            let h = thread::spawn(move || t2.claim_any());
            let mine = table.claim_any();
            let theirs = h.join().unwrap();

            assert!(
                mine.is_some() ^ theirs.is_some(),
                "exactly one claimer must win: mine={mine:?}, theirs={theirs:?}"
            );
            assert_eq!(table.available_count(), 0);
        });
    }

    /// Claim racing a release: the claimer either finds the slot or the
    /// table ends with it available, never both and never neither.
    #[test]
    fn loom_claim_vs_release() {
        loom::model(|| {
            let table = std::sync::Arc::new(ResourceTable::new([ResourceId::new(0)]));
            let id = ResourceId::new(0);
            assert_eq!(table.claim_any(), Some(id));

            let t2 = table.clone();
            let h = thread::spawn(move || t2.make_available(id));

            let claimed = table.claim_any();
            let prev = h.join().unwrap();

            assert_eq!(prev, Some(false), "release must observe the held flag");
            match claimed {
                Some(got) => {
                    assert_eq!(got, id);
                    assert_eq!(table.available_count(), 0);
                }
                None => assert_eq!(table.available_count(), 1),
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Concurrent smoke tests
// ---------------------------------------------------------------------------
