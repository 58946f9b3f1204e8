//! Thread parking
//!
//! Each waiter owns a `Parker`. `unpark` leaves a permit that the next
//! `park` consumes, so a wake issued before the waiter sleeps is not lost.
//! Used by idle carriers, threads stopped at a safepoint, operation
//! submitters and virtual-thread joiners.

use std::time::Duration;

/// Event-style sleep/wake for a single waiter
pub trait Park: Send + Sync {
    /// Sleep until a permit is available or the timeout elapses
    ///
    /// Returns `true` when a permit was consumed. Callers re-check their
    /// condition regardless of the result.
    fn park(&self, timeout: Option<Duration>) -> bool;

    /// Make a permit available, waking the waiter if it sleeps
    fn unpark(&self);
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParker as Parker;
    } else {
        mod fallback;
        pub use fallback::CondvarParker as Parker;
    }
}
