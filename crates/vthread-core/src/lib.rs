//! # vthread-core
//!
//! Core types for the vthread continuation scheduler.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Context switching, stack memory and carrier threads live in `vthread-runtime`.
//!
//! ## Modules
//!
//! - `id` - Virtual thread identifier type
//! - `state` - Continuation, virtual thread and managed-thread states
//! - `error` - Error types
//! - `spinlock` - Non-preemptible spin lock
//! - `pin` - Critical-section / native-code pinning bookkeeping
//! - `traits` - Pluggable pinning predicate
//! - `frame` - Stack-frame copier and frozen stack chunks
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod error;
pub mod spinlock;
pub mod pin;
pub mod traits;
pub mod frame;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::VThreadId;
pub use state::{ContinuationState, PreemptStatus, ThreadState, VThreadState};
pub use error::{CarrierError, MemoryError, SchedError, SchedResult};
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};
pub use pin::{CriticalSection, NativeSection, PinReason};
pub use traits::{PinPredicate, ThreadPinState};
pub use frame::StackChunk;
pub use env::{env_flag, env_get, env_millis};

/// Constants for memory layout and pool sizing
pub mod constants {
    /// Default stack size per continuation (virtual; pages are committed on touch)
    pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

    /// Smallest stack a continuation may be created with
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Guard page size at the low end of every stack
    pub const GUARD_SIZE: usize = 4096;

    /// Hard upper bound on carrier threads, compensation included
    pub const MAX_CARRIERS: usize = 1024;

    /// No carrier sentinel value
    pub const CARRIER_NONE: usize = usize::MAX;

    /// Word size used by the frame copier's aligned path
    pub const WORD_SIZE: usize = core::mem::size_of::<usize>();
}
