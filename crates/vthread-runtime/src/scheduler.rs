//! Virtual thread scheduler
//!
//! Maps many virtual threads onto a bounded pool of carrier threads. Each
//! virtual thread is one continuation; a carrier mounts it, runs the
//! continuation until it yields or finishes, unmounts it, and either
//! resubmits it or terminates it.
//!
//! The scheduler is an injected handle (`Scheduler` is a cheap clone of an
//! `Arc`). A process-wide instance can be installed once with
//! `init_global` and fetched with `global`.

use crate::carrier::{carrier_main, CarrierSlot};
use crate::config::SchedulerConfig;
use crate::continuation::Continuation;
use crate::monitor::Monitor;
use crate::ready_queue::{ReadyQueue, StealingQueue};
use crate::safepoint;
use crate::tls;
use crate::vthread::{FaultHandler, JoinHandle, VThread};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use vthread_core::constants::MIN_STACK_SIZE;
use vthread_core::{
    kdebug, kerror, kprint, CarrierError, MemoryError, NativeSection, PinPredicate, PreemptStatus,
    SchedError, SchedResult, ThreadPinState, VThreadState,
};

static GLOBAL: OnceLock<Scheduler> = OnceLock::new();

/// Snapshot of scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Virtual threads submitted
    pub spawned: u64,
    /// Yielded continuations put back on the ready queue
    pub resubmitted: u64,
    /// Virtual threads that reached `Terminated`, faulted ones included
    pub terminated: u64,
    /// Virtual threads whose body panicked
    pub faulted: u64,
    /// Forced yields that captured a running virtual thread
    pub preempted: u64,
    /// Carrier threads currently alive
    pub carriers: u64,
}

#[derive(Default)]
struct Counters {
    spawned: AtomicU64,
    resubmitted: AtomicU64,
    terminated: AtomicU64,
    faulted: AtomicU64,
    preempted: AtomicU64,
}

pub(crate) struct Inner {
    config: SchedulerConfig,
    queue: StealingQueue<VThread>,
    slots: Box<[CarrierSlot]>,
    running: AtomicBool,
    started: AtomicBool,
    shut_down: AtomicBool,
    carriers: AtomicUsize,
    idle: AtomicUsize,
    stats: Counters,
    pin: Arc<dyn PinPredicate>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    monitor: Mutex<Option<Monitor>>,
}

/// Handle to a scheduler instance
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Validate `config` and build a stopped scheduler
    pub fn new(config: SchedulerConfig) -> SchedResult<Self> {
        Self::with_pin_predicate(config, Arc::new(ThreadPinState))
    }

    /// Like `new`, with the capability asked whether a carrier may be
    /// preempted
    pub fn with_pin_predicate(config: SchedulerConfig, pin: Arc<dyn PinPredicate>) -> SchedResult<Self> {
        config.validate()?;
        Ok(Scheduler {
            inner: Arc::new(Inner {
                queue: StealingQueue::new(config.parallelism, config.local_queue_capacity),
                slots: (0..config.max_carriers).map(|_| CarrierSlot::new()).collect(),
                running: AtomicBool::new(false),
                started: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                carriers: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                stats: Counters::default(),
                pin,
                handles: Mutex::new(Vec::new()),
                monitor: Mutex::new(None),
                config,
            }),
        })
    }

    /// Start the core carriers and, if enabled, the preemption monitor
    pub fn start(&self) -> SchedResult<()> {
        if self.is_shut_down() {
            return Err(SchedError::ShutDown);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SchedError::AlreadyInitialized);
        }
        if self.inner.config.debug_logging && kprint::log_level() < kprint::LogLevel::Debug {
            kprint::set_log_level(kprint::LogLevel::Debug);
        }
        self.inner.running.store(true, Ordering::SeqCst);

        for index in 0..self.inner.config.parallelism {
            let claimed = self.inner.slots[index].try_claim();
            debug_assert!(claimed);
            if let Err(e) = self.spawn_carrier(index, false) {
                self.shutdown();
                return Err(e);
            }
        }

        if self.inner.config.enable_forced_preempt {
            let monitor = Monitor::start(self.clone())?;
            *lock(&self.inner.monitor) = Some(monitor);
        }
        Ok(())
    }

    /// Stop all carriers and the monitor, then wait for them
    ///
    /// Queued and suspended virtual threads are dropped without running to
    /// completion. Must not be called from a virtual thread of this
    /// scheduler.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.running.store(false, Ordering::SeqCst);

        if let Some(monitor) = lock(&self.inner.monitor).take() {
            monitor.join();
        }

        for slot in self.inner.slots.iter() {
            slot.unpark();
        }

        let on_own_carrier = tls::current_scheduler().is_some_and(|s| s.ptr_eq(self));
        if on_own_carrier {
            kerror!("shutdown called from a carrier; not waiting for carriers");
        } else {
            // Compensating carriers may still be registering handles
            loop {
                let handles = std::mem::take(&mut *lock(&self.inner.handles));
                if handles.is_empty() && self.inner.carriers.load(Ordering::Acquire) == 0 {
                    break;
                }
                for handle in handles {
                    let _ = safepoint::blocking(|| handle.join());
                }
                thread::yield_now();
            }
        }

        while self.inner.queue.pop(0).is_some() {}
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Whether two handles refer to the same scheduler
    pub fn ptr_eq(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn stats(&self) -> SchedulerStats {
        let s = &self.inner.stats;
        SchedulerStats {
            spawned: s.spawned.load(Ordering::Relaxed),
            resubmitted: s.resubmitted.load(Ordering::Relaxed),
            terminated: s.terminated.load(Ordering::Relaxed),
            faulted: s.faulted.load(Ordering::Relaxed),
            preempted: s.preempted.load(Ordering::Relaxed),
            carriers: self.inner.carriers.load(Ordering::Relaxed) as u64,
        }
    }

    /// Spawn a virtual thread with default settings
    pub fn spawn<F>(&self, f: F) -> SchedResult<JoinHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.builder().spawn(f)
    }

    pub fn builder(&self) -> Builder {
        Builder {
            scheduler: self.clone(),
            name: None,
            stack_size: None,
            fault_handler: None,
        }
    }

    /// Virtual threads waiting to run
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    // Carrier-facing internals

    #[inline]
    pub(crate) fn slot(&self, index: usize) -> &CarrierSlot {
        &self.inner.slots[index]
    }

    pub(crate) fn slots(&self) -> &[CarrierSlot] {
        &self.inner.slots
    }

    #[inline]
    pub(crate) fn pop(&self, carrier: usize) -> Option<VThread> {
        self.inner.queue.pop(carrier)
    }

    #[inline]
    pub(crate) fn has_work(&self) -> bool {
        !self.inner.queue.is_empty()
    }

    pub(crate) fn enter_idle(&self) {
        self.inner.idle.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn exit_idle(&self) {
        self.inner.idle.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn carrier_exited(&self) {
        self.inner.carriers.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn record_preemption(&self) {
        self.inner.stats.preempted.fetch_add(1, Ordering::Relaxed);
    }

    fn submit(&self, vt: VThread, hint: Option<usize>) {
        vt.set_state(VThreadState::Runnable);
        self.inner.queue.push(vt, hint);
        self.wake_one();
    }

    /// Requeue a yielded virtual thread, locally to `carrier` if given
    pub(crate) fn resubmit(&self, vt: VThread, carrier: Option<usize>) {
        debug_assert!(!vt.continuation().is_done());
        self.inner.stats.resubmitted.fetch_add(1, Ordering::Relaxed);
        self.submit(vt, carrier);
    }

    /// Terminate a virtual thread, dispatching a panic to its fault handler
    pub(crate) fn terminate(&self, vt: &VThread, fault: Option<Box<dyn Any + Send>>) {
        if !vt.terminate(fault.is_some()) {
            return;
        }
        let stats = &self.inner.stats;
        stats.terminated.fetch_add(1, Ordering::Relaxed);

        if let Some(payload) = fault {
            stats.faulted.fetch_add(1, Ordering::Relaxed);
            dispatch_fault(vt, payload.as_ref());
        }
        vt.finish();
    }

    fn wake_one(&self) {
        for slot in self.inner.slots.iter() {
            if slot.is_active() && slot.wake() {
                return;
            }
        }
    }

    fn spawn_carrier(&self, index: usize, compensating: bool) -> SchedResult<()> {
        let sched = self.clone();
        self.inner.carriers.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name(format!("vthread-carrier-{}", index))
            .spawn(move || carrier_main(sched, index, compensating));
        match spawned {
            Ok(handle) => {
                lock(&self.inner.handles).push(handle);
                Ok(())
            }
            Err(_) => {
                self.inner.carriers.fetch_sub(1, Ordering::AcqRel);
                self.inner.slots[index].release();
                Err(CarrierError::SpawnFailed.into())
            }
        }
    }

    /// Recruit an extra carrier when none is idle and the cap allows
    fn compensate(&self) -> SchedResult<()> {
        let inner = &self.inner;
        if !self.is_running() || inner.idle.load(Ordering::Acquire) > 0 {
            return Ok(());
        }
        if inner.carriers.load(Ordering::Acquire) >= inner.config.max_carriers {
            return Err(CarrierError::PoolExhausted.into());
        }
        let parallelism = inner.config.parallelism;
        let Some(index) = (parallelism..inner.slots.len()).find(|&i| inner.slots[i].try_claim()) else {
            return Err(CarrierError::PoolExhausted.into());
        };
        if inner.config.debug_logging {
            kdebug!("recruiting compensating carrier {}", index);
        }
        self.spawn_carrier(index, true)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Virtual thread factory
pub struct Builder {
    scheduler: Scheduler,
    name: Option<String>,
    stack_size: Option<usize>,
    fault_handler: Option<FaultHandler>,
}

impl Builder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Called with the panic payload if the body panics
    pub fn fault_handler<H>(mut self, handler: H) -> Self
    where
        H: Fn(&VThread, &(dyn Any + Send)) + Send + Sync + 'static,
    {
        self.fault_handler = Some(Arc::new(handler));
        self
    }

    pub fn spawn<F>(self, f: F) -> SchedResult<JoinHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let sched = self.scheduler;
        if sched.is_shut_down() {
            return Err(SchedError::ShutDown);
        }
        let config = &sched.inner.config;
        let stack_size = self.stack_size.unwrap_or(config.stack_size);
        if stack_size < MIN_STACK_SIZE {
            return Err(MemoryError::StackTooSmall.into());
        }

        let continuation =
            Continuation::with_stack_size(stack_size, f).release_frozen_stack(config.release_frozen_stacks);
        let vt = VThread::new(
            self.name,
            continuation,
            self.fault_handler,
            Arc::clone(&sched.inner.pin),
            config.preempt_timeout,
        );

        sched.inner.stats.spawned.fetch_add(1, Ordering::Relaxed);
        // Spawned from a carrier of this scheduler: keep it local
        let hint = match tls::current_scheduler() {
            Some(s) if s.ptr_eq(&sched) => tls::carrier_index(),
            _ => None,
        };
        sched.submit(vt.clone(), hint);
        Ok(JoinHandle::new(vt, sched))
    }
}

fn dispatch_fault(vt: &VThread, payload: &(dyn Any + Send)) {
    let handled = match vt.fault_handler() {
        Some(handler) => panic::catch_unwind(AssertUnwindSafe(|| handler(vt, payload))).is_ok(),
        None => false,
    };
    if !handled {
        kerror!("virtual thread {} faulted: {}", vt.id(), panic_message(payload));
    }
}

/// Text of a panic payload, if it carries one
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Mount / unmount
// ============================================================================

/// Make `vt` the current virtual thread of this carrier
pub(crate) fn mount(vt: &VThread) {
    vt.set_state(VThreadState::Running);
    kprint::set_vthread_id(vt.id().as_u64());
    if let (Some(sched), Some(index)) = (tls::current_scheduler(), tls::carrier_index()) {
        sched.slot(index).set_current(Some(vt.clone()));
    }
    tls::set_current_vthread(Some(vt.clone()));
}

/// Restore the carrier's own identity
pub(crate) fn unmount() {
    tls::set_current_vthread(None);
    kprint::clear_vthread_id();
    if let (Some(sched), Some(index)) = (tls::current_scheduler(), tls::carrier_index()) {
        sched.slot(index).set_current(None);
    }
}

// ============================================================================
// Virtual-thread-facing operations
// ============================================================================

/// Give the carrier back and continue later
///
/// Outside a virtual thread this yields the OS thread.
pub fn yield_now() {
    safepoint::poll();
    let Some(vt) = tls::current_vthread() else {
        thread::yield_now();
        return;
    };
    unmount();
    let _ = Continuation::yield_current();
    // Possibly on another carrier now
    mount(&vt);
}

/// Carry out a forced yield requested by a preemption
///
/// Runs from a safepoint poll of the thread being preempted.
pub(crate) fn forced_yield() -> PreemptStatus {
    let vt = tls::current_vthread();
    if vt.is_some() {
        unmount();
    }
    let status = Continuation::yield_preempted();
    if let Some(vt) = vt {
        mount(&vt);
    }
    status.unwrap_or(PreemptStatus::Success)
}

/// Run `f`, which may block its OS thread, from a virtual thread
///
/// The carrier counts as blocked (stopped for safepoints, pinned native for
/// preemption) while `f` runs. If no other carrier is idle an extra one is
/// recruited so queued virtual threads keep running.
pub fn blocking<R>(f: impl FnOnce() -> R) -> R {
    if tls::is_in_vthread() {
        if let Some(sched) = tls::current_scheduler() {
            if let Err(e) = sched.compensate() {
                if sched.config().debug_logging {
                    kdebug!("no compensation: {}", e);
                }
            }
        }
    }
    let _native = NativeSection::enter();
    safepoint::blocking(f)
}

/// The virtual thread mounted on the calling carrier
pub fn current() -> Option<VThread> {
    tls::current_vthread()
}

// ============================================================================
// Global instance
// ============================================================================

/// Install the process-wide scheduler
pub fn init_global(config: SchedulerConfig) -> SchedResult<&'static Scheduler> {
    let scheduler = Scheduler::new(config)?;
    let mut installed = false;
    let global = GLOBAL.get_or_init(|| {
        installed = true;
        scheduler
    });
    if installed {
        Ok(global)
    } else {
        Err(SchedError::AlreadyInitialized)
    }
}

/// The process-wide scheduler
pub fn global() -> SchedResult<&'static Scheduler> {
    GLOBAL.get().ok_or(SchedError::NotInitialized)
}
