//! Virtual threads and join handles

use crate::continuation::Continuation;
use crate::parking::{Park, Parker};
use crate::safepoint;
use crate::scheduler::{self, Scheduler};
use crate::tls;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vthread_core::{
    ContinuationState, PinPredicate, PreemptStatus, SchedError, SchedResult, SpinLock, VThreadId,
    VThreadState,
};

/// Receives the panic payload of a faulted virtual thread
///
/// Runs on the carrier, after the virtual thread has terminated.
pub type FaultHandler = Arc<dyn Fn(&VThread, &(dyn Any + Send)) + Send + Sync>;

/// Longest single park of an OS thread joining a virtual thread
const JOIN_PARK: Duration = Duration::from_millis(10);

/// A logical thread: one continuation plus its bookkeeping
///
/// Cheap to clone; all clones refer to the same virtual thread.
#[derive(Clone)]
pub struct VThread {
    inner: Arc<Inner>,
}

struct Inner {
    id: VThreadId,
    name: Option<String>,
    state: AtomicU8,
    continuation: Continuation,
    fault_handler: Option<FaultHandler>,
    pin: Arc<dyn PinPredicate>,
    preempt_timeout: Duration,
    finished: AtomicBool,
    faulted: AtomicBool,
    waiters: SpinLock<Vec<Arc<Parker>>>,
}

impl VThread {
    pub(crate) fn new(
        name: Option<String>,
        continuation: Continuation,
        fault_handler: Option<FaultHandler>,
        pin: Arc<dyn PinPredicate>,
        preempt_timeout: Duration,
    ) -> Self {
        VThread {
            inner: Arc::new(Inner {
                id: VThreadId::next(),
                name,
                state: AtomicU8::new(VThreadState::New as u8),
                continuation,
                fault_handler,
                pin,
                preempt_timeout,
                finished: AtomicBool::new(false),
                faulted: AtomicBool::new(false),
                waiters: SpinLock::new(Vec::new()),
            }),
        }
    }

    /// The virtual thread mounted on the calling carrier
    pub fn current() -> Option<VThread> {
        tls::current_vthread()
    }

    #[inline]
    pub fn id(&self) -> VThreadId {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    #[inline]
    pub fn state(&self) -> VThreadState {
        VThreadState::from(self.inner.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: VThreadState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn continuation(&self) -> &Continuation {
        &self.inner.continuation
    }

    pub(crate) fn fault_handler(&self) -> Option<&FaultHandler> {
        self.inner.fault_handler.as_ref()
    }

    /// Force this virtual thread off its carrier
    ///
    /// Returns `Success` when it is not running at all. Pinned outcomes are
    /// normal; try again later.
    pub fn try_preempt(&self) -> PreemptStatus {
        let cont = &self.inner.continuation;
        match cont.mounted_thread() {
            Some(thread) => cont.try_preempt_with(&thread, Arc::clone(&self.inner.pin), self.inner.preempt_timeout),
            None if cont.state() == ContinuationState::Running => PreemptStatus::Yielding,
            None => PreemptStatus::Success,
        }
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// Whether the body panicked
    pub fn is_faulted(&self) -> bool {
        self.inner.faulted.load(Ordering::Acquire)
    }

    /// Move to `Terminated`; false if already there
    pub(crate) fn terminate(&self, faulted: bool) -> bool {
        let prev = self.inner.state.swap(VThreadState::Terminated as u8, Ordering::AcqRel);
        if VThreadState::from(prev).is_terminated() {
            return false;
        }
        self.inner.faulted.store(faulted, Ordering::Release);
        true
    }

    /// Release everyone waiting in `join`
    pub(crate) fn finish(&self) {
        self.inner.finished.store(true, Ordering::Release);
        let waiters = std::mem::take(&mut *self.inner.waiters.lock());
        for waiter in waiters {
            waiter.unpark();
        }
    }

    fn add_waiter(&self, parker: Arc<Parker>) {
        self.inner.waiters.lock().push(parker);
    }
}

impl fmt::Debug for VThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VThread")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Owned permission to wait for a virtual thread's termination
pub struct JoinHandle {
    vthread: VThread,
    scheduler: Scheduler,
}

impl JoinHandle {
    pub(crate) fn new(vthread: VThread, scheduler: Scheduler) -> Self {
        JoinHandle { vthread, scheduler }
    }

    #[inline]
    pub fn id(&self) -> VThreadId {
        self.vthread.id()
    }

    pub fn thread(&self) -> &VThread {
        &self.vthread
    }

    pub fn is_finished(&self) -> bool {
        self.vthread.is_finished()
    }

    /// Wait for the virtual thread to terminate
    ///
    /// From inside a virtual thread this yields until done; from any other
    /// thread it parks. Returns `Faulted` if the body panicked and
    /// `ShutDown` if the scheduler stopped first.
    pub fn join(self) -> SchedResult<()> {
        let vt = &self.vthread;
        if tls::is_in_vthread() {
            while !vt.is_finished() {
                if self.scheduler.is_shut_down() {
                    return Err(SchedError::ShutDown);
                }
                scheduler::yield_now();
            }
        } else if !vt.is_finished() {
            let parker = Arc::new(Parker::new());
            vt.add_waiter(Arc::clone(&parker));
            let stopped = safepoint::blocking(|| {
                while !vt.is_finished() {
                    if self.scheduler.is_shut_down() {
                        return true;
                    }
                    parker.park(Some(JOIN_PARK));
                }
                false
            });
            if stopped {
                return Err(SchedError::ShutDown);
            }
        }

        if vt.is_faulted() {
            Err(SchedError::Faulted)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for JoinHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle").field("vthread", &self.vthread).finish()
    }
}
