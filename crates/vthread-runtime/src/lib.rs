//! # vthread-runtime
//!
//! Platform runtime for the vthread continuation scheduler.
//!
//! This crate provides:
//! - Continuations on mapped stacks with freeze/thaw (`continuation`)
//! - Context switching (architecture-specific assembly)
//! - Managed threads, safepoints and the cross-thread operation queue
//! - Carrier pool, work-stealing ready queue and virtual threads
//! - Preemption monitor

pub mod arch;
pub mod config;
pub mod memory;
pub mod parking;
pub mod safepoint;
pub mod continuation;
pub mod ready_queue;
pub mod tls;
mod carrier;
pub mod vthread;
pub mod scheduler;
pub mod monitor;

// Re-exports
pub use config::{ConfigError, SchedulerConfig};
pub use continuation::{Continuation, RunOutcome, DEFAULT_PREEMPT_TIMEOUT};
pub use safepoint::{attach_current_thread, Attachment, ManagedThread, Mode, OpContext, OpOutcome, ThreadHandle};
pub use scheduler::{blocking, current, global, init_global, yield_now, Builder, Scheduler, SchedulerStats};
pub use vthread::{FaultHandler, JoinHandle, VThread};
pub use parking::{Park, Parker};

/// Serializes tests that attach threads or run carriers
///
/// A managed thread that never polls would stall another test's
/// stop-the-world indefinitely.
#[cfg(test)]
pub(crate) fn test_serial() -> std::sync::MutexGuard<'static, ()> {
    static SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}
