//! FIFO-fair mediation of a small, fixed pool of interchangeable resources.
//!
//! ## Scope
//! This crate mediates concurrent access by many worker threads to N
//! interchangeable resource handles: a strict-FIFO counting semaphore caps
//! holders at N and serves blocked callers in arrival order, and a
//! lock-free availability table assigns each permitted caller a concrete
//! handle. Resource content is out of scope; handles are opaque.
//!
//! ## Key invariants
//! - At most N resources are held at any instant, for pool size N.
//! - `available_permits + held == N` at every quiescent point.
//! - Permits freed while callers are queued are handed directly to the
//!   queue head; the fast path never overtakes a waiter.
//! - Release flips the table entry before returning the permit, so a
//!   freshly unblocked caller always finds a free slot.
//! - Double releases and unknown handles are silent no-ops and never mint
//!   extra permits.
//!
//! ## Acquire flow (one call)
//! 1) Fast path: permit free and nobody queued means take it, no blocking.
//! 2) Slow path: park on a fresh one-shot waiter at the queue tail.
//! 3) A release pops the head and grants that waiter directly.
//! 4) With a permit reserved, scan the table and CAS-claim a free slot.
//!
//! ## Notable entry points
//! - [`ResourcePool`]: build / acquire / release over a handle set.
//! - [`FairSemaphore`]: the strict-FIFO counting semaphore on its own.
//! - [`CancelToken`]: level-triggered cancellation for blocked acquires.
//! - [`PoolGuard`]: RAII release for panic-safe holders.
//!
//! ## Design trade-offs
//! Direct hand-off buys strict FIFO at the cost of a per-waiter signal
//! cell instead of one shared counter everyone races on. The table scan
//! trades a bounded-step guarantee for lock-freedom: a reserved permit
//! earmarks a slot, but claiming it may retry while concurrent claimers
//! shuffle which slot is free.

mod cancel;
mod errors;
mod pool;
mod semaphore;
mod table;


pub use cancel::CancelToken;
pub use errors::AcquireError;
pub use pool::{AcquireMode, PoolGuard, ResourcePool};
pub use semaphore::FairSemaphore;
pub use table::{ResourceId, ResourceTable};
