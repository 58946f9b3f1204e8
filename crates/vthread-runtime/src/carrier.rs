//! Carrier threads
//!
//! Carriers are OS threads that run virtual threads. Each has a slot in the
//! scheduler's fixed slot array; the monitor scans the slots to find virtual
//! threads that have been mounted for too long.
//!
//! Slots `0..parallelism` belong to the core carriers, which live as long as
//! the scheduler. Higher slots are taken by compensating carriers, recruited
//! while virtual threads block their carriers, which retire after
//! `keep_alive` without work.

use crate::continuation::RunOutcome;
use crate::monitor::now_ns;
use crate::parking::{Park, Parker};
use crate::safepoint::{self, ThreadHandle};
use crate::scheduler::{mount, unmount, Scheduler};
use crate::tls;
use crate::vthread::VThread;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use vthread_core::{kdebug, kprint, SpinLock};

/// Per-carrier state shared with the scheduler and the monitor
pub(crate) struct CarrierSlot {
    active: AtomicBool,
    parked: AtomicBool,
    parker: Parker,
    current: SpinLock<Option<VThread>>,
    /// When the current virtual thread was mounted; 0 when none is
    run_start_ns: AtomicU64,
    thread: SpinLock<Option<ThreadHandle>>,
}

impl CarrierSlot {
    pub(crate) fn new() -> Self {
        CarrierSlot {
            active: AtomicBool::new(false),
            parked: AtomicBool::new(false),
            parker: Parker::new(),
            current: SpinLock::new(None),
            run_start_ns: AtomicU64::new(0),
            thread: SpinLock::new(None),
        }
    }

    /// Reserve a free slot
    #[inline]
    pub(crate) fn try_claim(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn release(&self) {
        self.active.store(false, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Wake the carrier if it is parked; false if it was not
    pub(crate) fn wake(&self) -> bool {
        if self
            .parked
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.parker.unpark();
            return true;
        }
        false
    }

    /// Unconditional wake, used at shutdown
    pub(crate) fn unpark(&self) {
        self.parker.unpark();
    }

    pub(crate) fn set_current(&self, vthread: Option<VThread>) {
        let start = if vthread.is_some() { now_ns().max(1) } else { 0 };
        let prev = std::mem::replace(&mut *self.current.lock(), vthread);
        self.run_start_ns.store(start, Ordering::Release);
        drop(prev);
    }

    pub(crate) fn current(&self) -> Option<VThread> {
        self.current.lock().clone()
    }

    #[inline]
    pub(crate) fn run_start_ns(&self) -> u64 {
        self.run_start_ns.load(Ordering::Acquire)
    }

    pub(crate) fn thread(&self) -> Option<ThreadHandle> {
        self.thread.lock().clone()
    }
}

/// Body of every carrier thread
pub(crate) fn carrier_main(sched: Scheduler, index: usize, compensating: bool) {
    let attachment = safepoint::attach_current_thread(&format!("vthread-carrier-{}", index));
    let slot = sched.slot(index);
    *slot.thread.lock() = Some(attachment.handle().clone());

    kprint::set_carrier_id(index);
    tls::enter_carrier(sched.clone(), index);

    let config = sched.config();
    let debug = config.debug_logging;
    if debug {
        kdebug!("carrier started (compensating={})", compensating);
    }

    let mut idle_spins: u32 = 0;
    let mut idle_since: Option<Instant> = None;

    loop {
        if !sched.is_running() {
            if debug {
                kdebug!("shutdown signaled, exiting");
            }
            break;
        }

        safepoint::poll();

        match sched.pop(index) {
            Some(vt) => {
                idle_spins = 0;
                idle_since = None;
                run_vthread(&sched, index, vt);
            }
            None => {
                if idle_spins < config.idle_spins {
                    // Quick spin first (catch fast yield -> resubmit cycles)
                    idle_spins += 1;
                    for _ in 0..32 {
                        std::hint::spin_loop();
                    }
                    std::thread::yield_now();
                    continue;
                }

                if compensating {
                    let since = *idle_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= config.keep_alive {
                        if debug {
                            kdebug!("compensating carrier retiring");
                        }
                        break;
                    }
                }

                park(&sched, slot, config.park_timeout);
                idle_spins = 0;
            }
        }
    }

    *slot.thread.lock() = None;
    slot.set_current(None);
    sched.carrier_exited();
    slot.release();

    tls::exit_carrier();
    kprint::clear_carrier_id();
    drop(attachment);
}

fn park(sched: &Scheduler, slot: &CarrierSlot, timeout: std::time::Duration) {
    sched.enter_idle();
    slot.parked.store(true, Ordering::SeqCst);
    // Work pushed before the flag was visible would not wake us
    if sched.has_work() || !sched.is_running() {
        slot.parked.store(false, Ordering::Relaxed);
    } else {
        safepoint::blocking(|| {
            slot.parker.park(Some(timeout));
        });
        slot.parked.store(false, Ordering::Relaxed);
    }
    sched.exit_idle();
}

/// Mount, run until the continuation yields or finishes, unmount
fn run_vthread(sched: &Scheduler, index: usize, vt: VThread) {
    if vt.state().is_terminated() {
        debug_assert!(false, "terminated virtual thread {} was resubmitted", vt.id());
        return;
    }

    mount(&vt);
    let result = panic::catch_unwind(AssertUnwindSafe(|| vt.continuation().run()));
    unmount();

    match result {
        Ok(RunOutcome::Yielded) => sched.resubmit(vt, Some(index)),
        Ok(RunOutcome::Preempted) => {
            sched.record_preemption();
            // Behind everything already queued
            sched.resubmit(vt, None);
        }
        Ok(RunOutcome::Finished) => sched.terminate(&vt, None),
        Err(payload) => sched.terminate(&vt, Some(payload)),
    }
}
