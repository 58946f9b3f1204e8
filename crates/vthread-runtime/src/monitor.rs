//! Preemption monitor
//!
//! A background thread that scans the carrier slots every
//! `monitor_interval` and forces off any virtual thread mounted for longer
//! than `time_slice`. Pinned targets are left alone and looked at again on
//! the next scan.
//!
//! The monitor is not a managed thread: it never polls, and it submits
//! targeted operations as an outside requester.

use crate::scheduler::Scheduler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use vthread_core::{kdebug, CarrierError, SchedResult};

static START_INSTANT: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the first call; never decreases
#[inline]
pub fn now_ns() -> u64 {
    START_INSTANT.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

pub(crate) struct Monitor {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Monitor {
    pub(crate) fn start(sched: Scheduler) -> SchedResult<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("vthread-monitor".to_string())
            .spawn(move || monitor_loop(sched, stop))
            .map_err(|_| CarrierError::SpawnFailed)?;
        Ok(Monitor {
            handle: Some(handle),
            shutdown,
        })
    }

    /// Signal shutdown and wait for the thread
    pub(crate) fn join(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn monitor_loop(sched: Scheduler, shutdown: Arc<AtomicBool>) {
    let config = sched.config();
    let time_slice_ns = config.time_slice.as_nanos() as u64;
    let interval = config.monitor_interval.max(Duration::from_micros(100));
    let debug = config.debug_logging;

    while !shutdown.load(Ordering::Acquire) && sched.is_running() {
        thread::sleep(interval);

        for (index, slot) in sched.slots().iter().enumerate() {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            if !slot.is_active() {
                continue;
            }
            let start = slot.run_start_ns();
            if start == 0 || now_ns().saturating_sub(start) < time_slice_ns {
                continue;
            }
            let Some(vt) = slot.current() else {
                continue;
            };

            let status = vt.try_preempt();
            if debug {
                kdebug!("preempt {} on carrier {}: {:?}", vt.id(), index, status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ns_monotonic() {
        let a = now_ns();
        thread::sleep(Duration::from_millis(2));
        let b = now_ns();
        assert!(b >= a + 1_000_000);
    }
}
