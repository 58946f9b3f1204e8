//! Continuation, virtual thread and managed-thread states

use core::fmt;

/// Lifecycle of a continuation
///
/// `NotStarted -> Running <-> Suspended -> Done`. Nothing leaves `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContinuationState {
    /// Created, body not yet entered
    NotStarted = 0,

    /// Mounted on some thread and executing
    Running = 1,

    /// Frames frozen into the stored state, waiting for resume
    Suspended = 2,

    /// Body returned (or panicked); no stack state remains
    Done = 3,
}

impl ContinuationState {
    /// Whether `run()` may be called in this state
    #[inline]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, ContinuationState::NotStarted | ContinuationState::Suspended)
    }

    #[inline]
    pub const fn is_done(&self) -> bool {
        matches!(self, ContinuationState::Done)
    }
}

impl From<u8> for ContinuationState {
    fn from(v: u8) -> Self {
        match v {
            0 => ContinuationState::NotStarted,
            1 => ContinuationState::Running,
            2 => ContinuationState::Suspended,
            _ => ContinuationState::Done,
        }
    }
}

/// Result of a yield or a forced-preemption attempt
///
/// Everything other than `Success` is a normal outcome: the caller backs off
/// and retries later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PreemptStatus {
    /// Frames captured; the continuation is (or will be) suspended
    Success = 0,

    /// Target holds a spin lock or is inside a frame copy
    PinnedCriticalSection = 1,

    /// Target is executing foreign code or is blocked outside the scheduler
    PinnedNative = 2,

    /// A suspend is already in progress
    Yielding = 3,
}

impl PreemptStatus {
    #[inline]
    pub const fn is_success(&self) -> bool {
        matches!(self, PreemptStatus::Success)
    }

    #[inline]
    pub const fn is_pinned(&self) -> bool {
        matches!(
            self,
            PreemptStatus::PinnedCriticalSection | PreemptStatus::PinnedNative
        )
    }

    #[inline]
    pub const fn code(&self) -> u8 {
        *self as u8
    }

    /// Decode a status carried through an operation-queue completion code
    pub const fn from_code(code: u8) -> Self {
        match code {
            0 => PreemptStatus::Success,
            1 => PreemptStatus::PinnedCriticalSection,
            2 => PreemptStatus::PinnedNative,
            _ => PreemptStatus::Yielding,
        }
    }
}

impl fmt::Display for PreemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreemptStatus::Success => write!(f, "SUCCESS"),
            PreemptStatus::PinnedCriticalSection => write!(f, "PINNED_CRITICAL_SECTION"),
            PreemptStatus::PinnedNative => write!(f, "PINNED_NATIVE"),
            PreemptStatus::Yielding => write!(f, "YIELDING"),
        }
    }
}

/// State of a virtual thread as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VThreadState {
    /// Built but not yet submitted
    New = 0,

    /// Queued on the carrier pool
    Runnable = 1,

    /// Mounted on a carrier
    Running = 2,

    /// Body finished or faulted; never resubmitted
    Terminated = 3,
}

impl VThreadState {
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, VThreadState::Terminated)
    }
}

impl From<u8> for VThreadState {
    fn from(v: u8) -> Self {
        match v {
            0 => VThreadState::New,
            1 => VThreadState::Runnable,
            2 => VThreadState::Running,
            _ => VThreadState::Terminated,
        }
    }
}

/// Safepoint state of a managed OS thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Executing managed code; must reach a poll before it counts as stopped
    Managed = 0,

    /// Parked inside a safepoint poll for a stop-the-world operation
    AtSafepoint = 1,

    /// Parked, blocked or in foreign code; already counts as stopped
    Blocked = 2,
}

impl ThreadState {
    /// Whether a stop-the-world operation may proceed past this thread
    #[inline]
    pub const fn is_stopped(&self) -> bool {
        matches!(self, ThreadState::AtSafepoint | ThreadState::Blocked)
    }
}

impl From<u8> for ThreadState {
    fn from(v: u8) -> Self {
        match v {
            0 => ThreadState::Managed,
            1 => ThreadState::AtSafepoint,
            _ => ThreadState::Blocked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuation_states() {
        assert!(ContinuationState::NotStarted.is_runnable());
        assert!(ContinuationState::Suspended.is_runnable());
        assert!(!ContinuationState::Running.is_runnable());
        assert!(!ContinuationState::Done.is_runnable());
        assert!(ContinuationState::Done.is_done());
        assert_eq!(ContinuationState::from(2), ContinuationState::Suspended);
    }

    #[test]
    fn test_preempt_status_codes() {
        for status in [
            PreemptStatus::Success,
            PreemptStatus::PinnedCriticalSection,
            PreemptStatus::PinnedNative,
            PreemptStatus::Yielding,
        ] {
            assert_eq!(PreemptStatus::from_code(status.code()), status);
        }
        assert!(PreemptStatus::PinnedNative.is_pinned());
        assert!(!PreemptStatus::Yielding.is_pinned());
        assert_eq!(format!("{}", PreemptStatus::PinnedCriticalSection), "PINNED_CRITICAL_SECTION");
    }

    #[test]
    fn test_thread_state_stopped() {
        assert!(!ThreadState::Managed.is_stopped());
        assert!(ThreadState::AtSafepoint.is_stopped());
        assert!(ThreadState::Blocked.is_stopped());
    }
}
