//! Pluggable pinning predicate
//!
//! Whether the code running on a thread may be paused depends on the
//! execution context. The scheduler and the preemption path ask this
//! capability instead of hard-coding the cases.

use crate::pin::{self, PinReason};

/// Answers "can the calling thread be safely paused right now?"
///
/// Always evaluated on the thread being asked about, either inside a
/// safepoint poll or inside a yield.
pub trait PinPredicate: Send + Sync {
    /// `None` when the thread may be suspended
    fn pinned(&self) -> Option<PinReason>;
}

/// Default predicate backed by the thread-local critical and native depths
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPinState;

impl PinPredicate for ThreadPinState {
    #[inline]
    fn pinned(&self) -> Option<PinReason> {
        pin::current_pin()
    }
}

impl<F> PinPredicate for F
where
    F: Fn() -> Option<PinReason> + Send + Sync,
{
    fn pinned(&self) -> Option<PinReason> {
        self()
    }
}
