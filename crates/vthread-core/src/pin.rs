//! Per-thread pinning bookkeeping
//!
//! Two counters per OS thread decide whether the code currently running on it
//! may be suspended:
//!
//! - critical-section depth: spin lock holds, frame copies, explicit
//!   `CriticalSection` guards
//! - native depth: foreign code or blocking calls that the scheduler cannot
//!   capture (`NativeSection` guards)
//!
//! A yield refuses to capture while either counter is non-zero, so both are
//! always zero when a continuation migrates between carriers.

use crate::state::PreemptStatus;
use core::fmt;
use core::marker::PhantomData;
use std::cell::Cell;

thread_local! {
    static CRITICAL_DEPTH: Cell<u32> = const { Cell::new(0) };
    static NATIVE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Why the current execution context cannot be suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinReason {
    /// Inside a non-preemptible critical section
    CriticalSection,

    /// Inside foreign code with no safe suspension point
    Native,
}

impl PinReason {
    /// The preemption status a pinned target reports
    #[inline]
    pub const fn status(&self) -> PreemptStatus {
        match self {
            PinReason::CriticalSection => PreemptStatus::PinnedCriticalSection,
            PinReason::Native => PreemptStatus::PinnedNative,
        }
    }
}

impl fmt::Display for PinReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinReason::CriticalSection => write!(f, "critical section"),
            PinReason::Native => write!(f, "native code"),
        }
    }
}

// Accessors are never inlined: a continuation may resume on another OS thread,
// and a thread-local address computed before a yield would be stale after it.

#[inline(never)]
pub fn enter_critical() {
    CRITICAL_DEPTH.with(|d| d.set(d.get() + 1));
}

#[inline(never)]
pub fn exit_critical() {
    CRITICAL_DEPTH.with(|d| {
        let depth = d.get();
        debug_assert!(depth > 0, "unbalanced critical section exit");
        d.set(depth.saturating_sub(1));
    });
}

#[inline(never)]
pub fn critical_depth() -> u32 {
    CRITICAL_DEPTH.with(|d| d.get())
}

#[inline(never)]
pub fn enter_native() {
    NATIVE_DEPTH.with(|d| d.set(d.get() + 1));
}

#[inline(never)]
pub fn exit_native() {
    NATIVE_DEPTH.with(|d| {
        let depth = d.get();
        debug_assert!(depth > 0, "unbalanced native section exit");
        d.set(depth.saturating_sub(1));
    });
}

#[inline(never)]
pub fn native_depth() -> u32 {
    NATIVE_DEPTH.with(|d| d.get())
}

/// Pin state of the calling thread; critical sections take precedence
#[inline]
pub fn current_pin() -> Option<PinReason> {
    if critical_depth() > 0 {
        Some(PinReason::CriticalSection)
    } else if native_depth() > 0 {
        Some(PinReason::Native)
    } else {
        None
    }
}

/// RAII critical section
///
/// While alive, forced preemption of this thread reports
/// `PinnedCriticalSection` and cooperative yields are refused.
pub struct CriticalSection {
    _not_send: PhantomData<*const ()>,
}

impl CriticalSection {
    #[inline]
    pub fn enter() -> Self {
        enter_critical();
        CriticalSection { _not_send: PhantomData }
    }
}

impl Drop for CriticalSection {
    #[inline]
    fn drop(&mut self) {
        exit_critical();
    }
}

/// RAII marker for foreign or blocking code
pub struct NativeSection {
    _not_send: PhantomData<*const ()>,
}

impl NativeSection {
    #[inline]
    pub fn enter() -> Self {
        enter_native();
        NativeSection { _not_send: PhantomData }
    }
}

impl Drop for NativeSection {
    #[inline]
    fn drop(&mut self) {
        exit_native();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards_nest() {
        assert_eq!(current_pin(), None);
        {
            let _outer = CriticalSection::enter();
            {
                let _inner = CriticalSection::enter();
                assert_eq!(critical_depth(), 2);
            }
            assert_eq!(critical_depth(), 1);
            assert_eq!(current_pin(), Some(PinReason::CriticalSection));
        }
        assert_eq!(critical_depth(), 0);
        assert_eq!(current_pin(), None);
    }

    #[test]
    fn test_critical_wins_over_native() {
        let _n = NativeSection::enter();
        assert_eq!(current_pin(), Some(PinReason::Native));
        let _c = CriticalSection::enter();
        assert_eq!(current_pin(), Some(PinReason::CriticalSection));
        assert_eq!(
            current_pin().map(|r| r.status()),
            Some(PreemptStatus::PinnedCriticalSection)
        );
    }

    #[test]
    fn test_depth_is_per_thread() {
        let _c = CriticalSection::enter();
        let other = std::thread::spawn(critical_depth).join().unwrap();
        assert_eq!(other, 0);
        assert_eq!(critical_depth(), 1);
    }
}
