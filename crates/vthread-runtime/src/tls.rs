//! Thread-local carrier and virtual thread context
//!
//! Accessors are never inlined: a virtual thread may resume on a different
//! carrier, and a thread-local address computed before a yield would point
//! at the old carrier's storage after it.

use crate::scheduler::Scheduler;
use crate::vthread::VThread;
use std::cell::{Cell, RefCell};
use vthread_core::constants::CARRIER_NONE;

thread_local! {
    /// Carrier index of this OS thread
    static CARRIER_INDEX: Cell<usize> = const { Cell::new(CARRIER_NONE) };

    /// Scheduler owning this carrier
    static SCHEDULER: RefCell<Option<Scheduler>> = const { RefCell::new(None) };

    /// Virtual thread mounted on this carrier
    static CURRENT_VTHREAD: RefCell<Option<VThread>> = const { RefCell::new(None) };
}

/// Mark this OS thread as carrier `index` of `scheduler`
#[inline(never)]
pub(crate) fn enter_carrier(scheduler: Scheduler, index: usize) {
    CARRIER_INDEX.with(|c| c.set(index));
    SCHEDULER.with(|s| *s.borrow_mut() = Some(scheduler));
}

#[inline(never)]
pub(crate) fn exit_carrier() {
    CARRIER_INDEX.with(|c| c.set(CARRIER_NONE));
    let scheduler = SCHEDULER.with(|s| s.borrow_mut().take());
    drop(scheduler);
}

/// Carrier index, if this thread is a carrier
#[inline(never)]
pub fn carrier_index() -> Option<usize> {
    let index = CARRIER_INDEX.with(|c| c.get());
    (index != CARRIER_NONE).then_some(index)
}

/// Scheduler of this carrier
#[inline(never)]
pub fn current_scheduler() -> Option<Scheduler> {
    SCHEDULER.with(|s| s.borrow().clone())
}

#[inline(never)]
pub(crate) fn set_current_vthread(vthread: Option<VThread>) {
    let prev = CURRENT_VTHREAD.with(|c| c.replace(vthread));
    drop(prev);
}

/// Virtual thread mounted on this carrier
#[inline(never)]
pub fn current_vthread() -> Option<VThread> {
    CURRENT_VTHREAD.with(|c| c.borrow().clone())
}

/// Whether a virtual thread is mounted on this OS thread
#[inline(never)]
pub fn is_in_vthread() -> bool {
    CURRENT_VTHREAD.with(|c| c.borrow().is_some())
}
