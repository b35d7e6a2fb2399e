//! Error types for blocking acquisition.
//!
//! There is exactly one fallible operation in this crate (a blocking
//! acquire), so the taxonomy is small. Invariant violations (permit
//! accounting drift, double grants) are defects and are enforced with
//! assertions, not represented here.

use std::fmt;

/// Why a blocking acquire returned without a permit.
///
/// Release paths never fail; an acquire that returns one of these variants
/// has already restored every pool invariant (no permit is leaked and no
/// waiter is left queued).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AcquireError {
    /// The caller's [`CancelToken`](crate::CancelToken) was raised before
    /// or during the wait.
    Cancelled,
    /// The deadline passed before a permit was granted.
    TimedOut,
    /// The semaphore was closed by
    /// [`shutdown_now`](crate::ResourcePool::shutdown_now) while the caller
    /// was waiting (or before it started).
    ShutDown,
}

impl AcquireError {
    /// True for the cancellation variant; convenience for callers that only
    /// distinguish "stop requested" from other outcomes.
    #[inline]
    pub fn is_cancelled(self) -> bool {
        matches!(self, AcquireError::Cancelled)
    }
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireError::Cancelled => write!(f, "acquire cancelled by caller"),
            AcquireError::TimedOut => write!(f, "acquire timed out before a permit was granted"),
            AcquireError::ShutDown => write!(f, "acquire refused: pool is shut down"),
        }
    }
}

impl std::error::Error for AcquireError {}
