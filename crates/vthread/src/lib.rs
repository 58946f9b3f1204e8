//! # vthread - continuation-based virtual threads
//!
//! Many virtual threads multiplexed onto a small pool of carrier OS
//! threads. A virtual thread is a continuation: its frames are copied off
//! its stack when it yields and copied back when it resumes, possibly on a
//! different carrier.
//!
//! ## Features
//!
//! - **Yield and resume**: `yield_now()` suspends the current virtual thread
//! - **Forced preemption**: a monitor forces long-running virtual threads off
//!   their carrier at their next safepoint poll
//! - **Pinning**: critical sections, spin locks and native calls refuse capture
//! - **Safepoints**: stop-the-world and targeted operations across managed
//!   threads
//! - **Compensation**: `blocking()` recruits an extra carrier while a virtual
//!   thread blocks its OS thread
//!
//! ## Quick Start
//!
//! ```ignore
//! use vthread::{Runtime, SchedulerConfig, yield_now};
//!
//! fn main() {
//!     let mut runtime = Runtime::new(SchedulerConfig::from_env()).unwrap();
//!
//!     runtime.block_on(|rt| {
//!         let handle = rt
//!             .spawn(|| {
//!                 println!("Hello from a virtual thread!");
//!                 yield_now();
//!                 println!("Back again!");
//!             })
//!             .unwrap();
//!         handle.join().unwrap();
//!     });
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        spawn(), yield_now(), safepoint!(), blocking()       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Scheduler                              │
//! │       work-stealing ready queue, mount / unmount, stats     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Carrier  │      │  Carrier  │      │  Monitor  │
//!    │  Thread   │      │  Thread   │      │  Thread   │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────── safepoints / operation queue ┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │            Continuations on mapped stacks               │
//!    │       freeze / thaw of [leaf SP, root SP), guard page   │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use vthread_core::{
    ContinuationState, CriticalSection, MemoryError, CarrierError, NativeSection, PinPredicate,
    PinReason, PreemptStatus, SchedError, SchedResult, SpinLock, SpinLockGuard, ThreadPinState,
    VThreadId, VThreadState,
};

// Re-export kprint macros for debug logging
pub use vthread_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use vthread_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};

// Re-export env utilities
pub use vthread_core::{env_flag, env_get, env_millis};

// Re-export runtime types
pub use vthread_runtime::safepoint::{self, poll};
pub use vthread_runtime::{
    attach_current_thread, blocking, current, yield_now, Attachment, Builder, Continuation,
    JoinHandle, RunOutcome, Scheduler, SchedulerConfig, SchedulerStats, VThread,
};

/// Insert a safepoint check
///
/// Put this in long-running loops so the virtual thread can be preempted
/// and can take part in stop-the-world operations.
///
/// ```ignore
/// for i in 0..1_000_000 {
///     vthread::safepoint!();
///     // Do work...
/// }
/// ```
#[macro_export]
macro_rules! safepoint {
    () => {
        $crate::poll()
    };
}

/// Owner of one scheduler instance
///
/// Shuts the scheduler down when dropped.
pub struct Runtime {
    scheduler: Scheduler,
}

impl Runtime {
    /// Create a runtime; the scheduler is not started yet
    pub fn new(config: SchedulerConfig) -> SchedResult<Self> {
        Ok(Runtime {
            scheduler: Scheduler::new(config)?,
        })
    }

    /// Start carriers and the preemption monitor
    pub fn start(&mut self) -> SchedResult<()> {
        self.scheduler.start()
    }

    /// Start, run `f`, then shut down
    ///
    /// This is the typical entry point for applications.
    pub fn block_on<F, T>(&mut self, f: F) -> T
    where
        F: FnOnce(&Runtime) -> T,
    {
        if let Err(e) = self.start() {
            kerror!("runtime start failed: {}", e);
        }
        let result = f(self);
        self.shutdown();
        result
    }

    pub fn spawn<F>(&self, f: F) -> SchedResult<JoinHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.spawn(f)
    }

    pub fn builder(&self) -> Builder {
        self.scheduler.builder()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn shutdown(&mut self) {
        self.scheduler.shutdown();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn a virtual thread on the scheduler of the calling carrier, or on
/// the process-wide scheduler from any other thread
pub fn spawn<F>(f: F) -> SchedResult<JoinHandle>
where
    F: FnOnce() + Send + 'static,
{
    match vthread_runtime::tls::current_scheduler() {
        Some(scheduler) => scheduler.spawn(f),
        None => vthread_runtime::global()?.spawn(f),
    }
}

/// Id of the current virtual thread
///
/// Returns `VThreadId::NONE` if not running in a virtual thread.
#[inline]
pub fn current_id() -> VThreadId {
    current().map_or(VThreadId::NONE, |vt| vt.id())
}

/// Check if currently executing within a virtual thread
#[inline]
pub fn is_in_vthread() -> bool {
    vthread_runtime::tls::is_in_vthread()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn small_config() -> SchedulerConfig {
        SchedulerConfig::new()
            .parallelism(2)
            .max_carriers(4)
            .stack_size(64 * 1024)
            .park_timeout(Duration::from_millis(5))
            .enable_forced_preempt(false)
    }

    #[test]
    fn test_block_on_runs_and_joins() {
        let mut runtime = Runtime::new(small_config()).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        let stats = runtime.block_on(|rt| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let done = Arc::clone(&done);
                    rt.spawn(move || {
                        assert!(is_in_vthread());
                        assert!(!current_id().is_none());
                        // Nested spawn lands on the same scheduler
                        let inner = spawn(|| yield_now()).unwrap();
                        yield_now();
                        inner.join().unwrap();
                        done.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap()
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            rt.stats()
        });

        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert_eq!(stats.spawned, 16);
        assert_eq!(stats.terminated, 16);
        assert!(!is_in_vthread());
        assert!(current_id().is_none());
    }

    #[test]
    fn test_spawn_without_scheduler() {
        // No carrier here and no process-wide scheduler installed
        assert_eq!(spawn(|| {}).unwrap_err(), SchedError::NotInitialized);
    }
}
