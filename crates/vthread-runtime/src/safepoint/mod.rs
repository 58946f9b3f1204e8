//! Managed threads and safepoints
//!
//! A managed thread is an OS thread registered with the runtime (carriers
//! attach themselves; other threads call `attach_current_thread`). Every
//! managed thread periodically calls `poll()`. The poll is the rendezvous
//! point for the cross-thread operation queue in `operation`:
//!
//! - stop-the-world: every other managed thread parks in its next poll
//!   until the operation has run
//! - targeted: one thread runs the operation in its next poll while all
//!   others continue
//!
//! A thread in `Blocked` state (parked, in foreign code, waiting on an
//! operation) already counts as stopped. Leaving `Blocked` re-checks for an
//! active stop-the-world, so a stopped world stays stopped.

mod operation;

pub use operation::{submit, submit_with_timeout, Completion, Mode, OpContext, OpOutcome};

use crate::parking::{Park, Parker};
use nix::sys::pthread::{pthread_self, Pthread};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vthread_core::{pin, NativeSection, SpinLock, ThreadState};

use operation::Operation;

/// Longest single park while waiting for a stop-the-world to end
const STOP_PARK: Duration = Duration::from_millis(1);

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

static THREADS: SpinLock<Vec<ThreadHandle>> = SpinLock::new(Vec::new());

/// Set while a stop-the-world operation owns the process
static STW_ACTIVE: AtomicBool = AtomicBool::new(false);

thread_local! {
    static CURRENT: RefCell<Option<ThreadHandle>> = const { RefCell::new(None) };
    static POLL_FLAG: Cell<*const AtomicBool> = const { Cell::new(std::ptr::null()) };
}

/// Shared handle to a managed thread
pub type ThreadHandle = Arc<ManagedThread>;

/// Registry entry of one managed OS thread
pub struct ManagedThread {
    id: u64,
    name: String,
    os_thread: Pthread,
    state: AtomicU8,
    poll_armed: AtomicBool,
    pending: SpinLock<Option<Arc<Operation>>>,
    parker: Parker,
}

impl ManagedThread {
    /// Runtime id, never zero
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// pthread id of the OS thread
    #[inline]
    pub fn os_thread(&self) -> Pthread {
        self.os_thread
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        ThreadState::from(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.state().is_stopped()
    }

    #[inline]
    fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Force the next poll onto the slow path
    #[inline]
    fn arm(&self) {
        self.poll_armed.store(true, Ordering::SeqCst);
    }

    #[inline]
    fn unpark(&self) {
        self.parker.unpark();
    }
}

impl fmt::Debug for ManagedThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("os_thread", &self.os_thread)
            .field("state", &self.state())
            .finish()
    }
}

/// Registration of the calling OS thread; detaches on drop
pub struct Attachment {
    handle: ThreadHandle,
    _not_send: PhantomData<*const ()>,
}

impl Attachment {
    pub fn handle(&self) -> &ThreadHandle {
        &self.handle
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        // Blocked forever from here on: any operation still aimed at this
        // thread is run by its requester.
        self.handle.set_state(ThreadState::Blocked);
        THREADS.lock().retain(|t| !Arc::ptr_eq(t, &self.handle));
        POLL_FLAG.with(|f| f.set(std::ptr::null()));
        CURRENT.with(|c| c.borrow_mut().take());
    }
}

/// Register the calling OS thread as a managed thread
///
/// Panics if the thread is already attached.
pub fn attach_current_thread(name: &str) -> Attachment {
    assert!(current_thread().is_none(), "thread is already attached");

    let handle = Arc::new(ManagedThread {
        id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
        name: name.to_string(),
        os_thread: pthread_self(),
        state: AtomicU8::new(ThreadState::Blocked as u8),
        poll_armed: AtomicBool::new(false),
        pending: SpinLock::new(None),
        parker: Parker::new(),
    });

    THREADS.lock().push(Arc::clone(&handle));
    CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(&handle)));
    POLL_FLAG.with(|f| f.set(&handle.poll_armed as *const AtomicBool));

    // Joining while the world is stopped waits for it to restart
    enter_managed(&handle, ThreadState::Blocked);

    Attachment {
        handle,
        _not_send: PhantomData,
    }
}

/// Handle of the calling thread, if attached
#[inline(never)]
pub fn current_thread() -> Option<ThreadHandle> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Id of the calling thread, 0 when not attached
#[inline(never)]
pub fn current_thread_id() -> u64 {
    CURRENT.with(|c| c.borrow().as_ref().map_or(0, |t| t.id))
}

/// Look up a managed thread by id
pub fn find_thread(id: u64) -> Option<ThreadHandle> {
    THREADS.lock().iter().find(|t| t.id == id).cloned()
}

/// Snapshot of every attached thread
pub fn threads() -> Vec<ThreadHandle> {
    THREADS.lock().clone()
}

/// Whether a stop-the-world operation is in progress
#[inline]
pub fn world_stopped() -> bool {
    STW_ACTIVE.load(Ordering::SeqCst)
}

/// Safepoint check
///
/// Fast path is a single load. Never inlined: after a forced yield the
/// caller may continue on a different OS thread.
#[inline(never)]
pub fn poll() {
    let flag = POLL_FLAG.with(|f| f.get());
    if flag.is_null() {
        return;
    }
    // Safety: the flag lives in the ManagedThread kept alive by CURRENT
    if unsafe { (*flag).load(Ordering::Acquire) } {
        poll_slow();
    }
}

#[cold]
fn poll_slow() {
    let Some(me) = current_thread() else {
        return;
    };
    if me.state() != ThreadState::Managed {
        return;
    }
    me.poll_armed.store(false, Ordering::SeqCst);

    if STW_ACTIVE.load(Ordering::SeqCst) {
        if pin::critical_depth() > 0 {
            // Rendezvous at the first poll after the critical section
            me.arm();
        } else {
            stop_at_safepoint(&me);
        }
    }

    let op = me.pending.lock().take();
    if let Some(op) = op {
        if op.try_claim() {
            op.execute(true);
        }
    }

    if crate::continuation::preempt_requested() {
        let _ = crate::scheduler::forced_yield();
    }
}

fn stop_at_safepoint(me: &ManagedThread) {
    me.set_state(ThreadState::AtSafepoint);
    while STW_ACTIVE.load(Ordering::SeqCst) {
        me.parker.park(Some(STOP_PARK));
    }
    enter_managed(me, ThreadState::AtSafepoint);
}

/// Transition to `Managed`, waiting out any stop-the-world first
///
/// The SeqCst store of `Managed` followed by the load of the flag pairs with
/// the requester's store of the flag followed by its loads of thread states:
/// at least one side sees the other.
fn enter_managed(me: &ManagedThread, stopped: ThreadState) {
    loop {
        me.set_state(ThreadState::Managed);
        if !STW_ACTIVE.load(Ordering::SeqCst) {
            return;
        }
        me.set_state(stopped);
        while STW_ACTIVE.load(Ordering::SeqCst) {
            me.parker.park(Some(STOP_PARK));
        }
    }
}

struct LeaveBlocked<'a>(&'a ManagedThread);

impl Drop for LeaveBlocked<'_> {
    fn drop(&mut self) {
        enter_managed(self.0, ThreadState::Blocked);
    }
}

/// Run `f` in `Blocked` state
///
/// The thread counts as stopped for the duration and is pinned native, so
/// `f` cannot yield the continuation it runs in. On return the thread waits
/// out any stop-the-world that started meanwhile.
pub fn blocking<R>(f: impl FnOnce() -> R) -> R {
    let _native = NativeSection::enter();
    let me = match current_thread() {
        Some(me) if me.state() == ThreadState::Managed => me,
        _ => return f(),
    };
    me.set_state(ThreadState::Blocked);
    let _leave = LeaveBlocked(&me);
    f()
}

/// Insert a safepoint check
#[macro_export]
macro_rules! safepoint {
    () => {
        $crate::safepoint::poll()
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    /// Attached thread that polls until `stop`, counting iterations
    fn poller(
        stop: Arc<AtomicBool>,
        count: Arc<AtomicUsize>,
    ) -> (ThreadHandle, thread::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel();
        let join = thread::spawn(move || {
            let attachment = attach_current_thread("poller");
            tx.send(Arc::clone(attachment.handle())).unwrap();
            while !stop.load(Ordering::Relaxed) {
                count.fetch_add(1, Ordering::Relaxed);
                poll();
                std::hint::spin_loop();
            }
        });
        (rx.recv().unwrap(), join)
    }

    #[test]
    fn test_attach_and_detach() {
        let _serial = crate::test_serial();
        assert!(current_thread().is_none());
        let id = {
            let attachment = attach_current_thread("main-test");
            let handle = attachment.handle();
            assert_eq!(handle.state(), ThreadState::Managed);
            assert_eq!(current_thread_id(), handle.id());
            assert!(find_thread(handle.id()).is_some());
            assert_eq!(handle.os_thread(), pthread_self());
            assert!(format!("{:?}", handle).contains(&format!("os_thread: {:?}", pthread_self())));
            handle.id()
        };
        assert!(current_thread().is_none());
        assert!(find_thread(id).is_none());
        // Unattached poll is a no-op
        poll();
    }

    #[test]
    fn test_blocking_marks_thread_stopped() {
        let _serial = crate::test_serial();
        let attachment = attach_current_thread("blocker");
        let inside = blocking(|| {
            assert_eq!(pin::current_pin(), Some(pin::PinReason::Native));
            attachment.handle().state()
        });
        assert_eq!(inside, ThreadState::Blocked);
        assert_eq!(attachment.handle().state(), ThreadState::Managed);
        assert_eq!(pin::current_pin(), None);
    }

    #[test]
    fn test_stop_the_world_stops_pollers() {
        let _serial = crate::test_serial();
        let stop = Arc::new(AtomicBool::new(false));
        let mut pollers = Vec::new();
        let mut counts = Vec::new();
        for _ in 0..3 {
            let count = Arc::new(AtomicUsize::new(0));
            pollers.push(poller(Arc::clone(&stop), Arc::clone(&count)));
            counts.push(count);
        }
        let handles: Vec<ThreadHandle> = pollers.iter().map(|(h, _)| Arc::clone(h)).collect();

        let frozen = Arc::new(AtomicBool::new(true));
        let outcome = {
            let counts = counts.clone();
            let frozen = Arc::clone(&frozen);
            submit(Mode::StopTheWorld, move |_| {
                if !handles.iter().all(|h| h.is_stopped()) {
                    frozen.store(false, Ordering::SeqCst);
                }
                let before: Vec<usize> = counts.iter().map(|c| c.load(Ordering::SeqCst)).collect();
                thread::sleep(Duration::from_millis(20));
                let after: Vec<usize> = counts.iter().map(|c| c.load(Ordering::SeqCst)).collect();
                if before != after {
                    frozen.store(false, Ordering::SeqCst);
                }
                11
            })
        };
        assert_eq!(outcome, OpOutcome::Completed(11));
        assert!(frozen.load(Ordering::SeqCst));
        assert!(!world_stopped());

        // Everyone runs again
        let resumed: Vec<usize> = counts.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        thread::sleep(Duration::from_millis(20));
        for (c, before) in counts.iter().zip(resumed) {
            assert!(c.load(Ordering::SeqCst) > before);
        }

        stop.store(true, Ordering::Relaxed);
        for (_, join) in pollers {
            join.join().unwrap();
        }
    }

    #[test]
    fn test_targeted_runs_on_target() {
        let _serial = crate::test_serial();
        let stop = Arc::new(AtomicBool::new(false));
        let (target, join) = poller(Arc::clone(&stop), Arc::new(AtomicUsize::new(0)));
        let target_id = target.id();
        let target_os = target.os_thread();
        assert_ne!(target_os, pthread_self());

        let outcome = submit(Mode::Targeted(Arc::clone(&target)), move |ctx| {
            assert!(ctx.on_target());
            if current_thread_id() == target_id && pthread_self() == target_os {
                7
            } else {
                0
            }
        });
        assert_eq!(outcome, OpOutcome::Completed(7));

        stop.store(true, Ordering::Relaxed);
        join.join().unwrap();
    }

    #[test]
    fn test_targeted_on_blocked_thread_runs_on_requester() {
        let _serial = crate::test_serial();
        let release = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let join = {
            let release = Arc::clone(&release);
            thread::spawn(move || {
                let attachment = attach_current_thread("sleeper");
                tx.send(Arc::clone(attachment.handle())).unwrap();
                blocking(|| {
                    while !release.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(1));
                    }
                });
            })
        };
        let target = rx.recv().unwrap();
        while target.state() != ThreadState::Blocked {
            thread::yield_now();
        }

        let outcome = submit(Mode::Targeted(target), |ctx| if ctx.on_target() { 1 } else { 2 });
        assert_eq!(outcome, OpOutcome::Completed(2));

        release.store(true, Ordering::Relaxed);
        join.join().unwrap();
    }

    #[test]
    fn test_targeted_times_out_without_poll() {
        let _serial = crate::test_serial();
        let release = Arc::new(AtomicBool::new(false));
        let ran = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let join = {
            let release = Arc::clone(&release);
            thread::spawn(move || {
                let attachment = attach_current_thread("busy");
                tx.send(Arc::clone(attachment.handle())).unwrap();
                // Managed but never polling
                while !release.load(Ordering::Relaxed) {
                    std::hint::spin_loop();
                }
                // A cancelled operation is never run
                poll();
            })
        };
        let target = rx.recv().unwrap();

        let start = Instant::now();
        let outcome = {
            let ran = Arc::clone(&ran);
            submit_with_timeout(Mode::Targeted(target), Duration::from_millis(20), move |_| {
                ran.store(true, Ordering::SeqCst);
                0
            })
        };
        assert_eq!(outcome, OpOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(15));

        release.store(true, Ordering::Relaxed);
        join.join().unwrap();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_deferred_completion() {
        let _serial = crate::test_serial();
        let stop = Arc::new(AtomicBool::new(false));
        let (target, join) = poller(Arc::clone(&stop), Arc::new(AtomicUsize::new(0)));

        let outcome = submit(Mode::Targeted(target), |ctx| {
            let completion = ctx.defer(5);
            completion.complete(9);
            0
        });
        assert_eq!(outcome, OpOutcome::Completed(9));

        let (target2, join2) = poller(Arc::clone(&stop), Arc::new(AtomicUsize::new(0)));
        let outcome = submit(Mode::Targeted(target2), |ctx| {
            drop(ctx.defer(5));
            0
        });
        assert_eq!(outcome, OpOutcome::Completed(5));

        stop.store(true, Ordering::Relaxed);
        join.join().unwrap();
        join2.join().unwrap();
    }

    #[test]
    fn test_concurrent_submitters_all_complete() {
        let _serial = crate::test_serial();
        let stop = Arc::new(AtomicBool::new(false));
        let (target, join) = poller(Arc::clone(&stop), Arc::new(AtomicUsize::new(0)));
        let executed = Arc::new(AtomicUsize::new(0));

        let submitters: Vec<_> = (0..8)
            .map(|i| {
                let target = Arc::clone(&target);
                let executed = Arc::clone(&executed);
                thread::spawn(move || {
                    let mode = if i % 4 == 0 {
                        Mode::StopTheWorld
                    } else {
                        Mode::Targeted(target)
                    };
                    submit(mode, move |_| {
                        executed.fetch_add(1, Ordering::SeqCst);
                        i as u8
                    })
                })
            })
            .collect();

        for (i, s) in submitters.into_iter().enumerate() {
            assert_eq!(s.join().unwrap(), OpOutcome::Completed(i as u8));
        }
        assert_eq!(executed.load(Ordering::SeqCst), 8);

        stop.store(true, Ordering::Relaxed);
        join.join().unwrap();
    }

    #[test]
    fn test_operations_serviced_in_submission_order() {
        let _serial = crate::test_serial();
        let stop = Arc::new(AtomicBool::new(false));
        let (target, join) = poller(Arc::clone(&stop), Arc::new(AtomicUsize::new(0)));
        let head_done = Arc::new(AtomicBool::new(false));
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        // Head of the queue: a targeted operation kept open by deferring
        let (tx, rx) = mpsc::channel();
        let head = {
            let target = Arc::clone(&target);
            thread::spawn(move || {
                submit(Mode::Targeted(target), move |ctx| {
                    tx.send(ctx.defer(0)).unwrap();
                    0
                })
            })
        };
        let completion = rx.recv().unwrap();
        assert_eq!(super::operation::queue_len(), 1);

        // Queue one at a time so the submission order is known
        let mut waiters = Vec::new();
        for i in 0..6usize {
            let target = Arc::clone(&target);
            let head_done = Arc::clone(&head_done);
            let log = Arc::clone(&log);
            waiters.push(thread::spawn(move || {
                let mode = if i % 3 == 0 {
                    Mode::StopTheWorld
                } else {
                    Mode::Targeted(target)
                };
                submit(mode, move |_| {
                    log.lock().unwrap().push((i, head_done.load(Ordering::SeqCst)));
                    i as u8
                })
            }));
            while super::operation::queue_len() < i + 2 {
                thread::yield_now();
            }
        }

        // Nothing behind the open head starts, the stop-the-world included
        thread::sleep(Duration::from_millis(20));
        assert!(log.lock().unwrap().is_empty());
        assert!(!world_stopped());

        head_done.store(true, Ordering::SeqCst);
        completion.complete(4);
        assert_eq!(head.join().unwrap(), OpOutcome::Completed(4));
        for (i, w) in waiters.into_iter().enumerate() {
            assert_eq!(w.join().unwrap(), OpOutcome::Completed(i as u8));
        }

        let log = log.lock().unwrap();
        assert_eq!(*log, (0..6).map(|i| (i, true)).collect::<Vec<_>>());
        assert_eq!(super::operation::queue_len(), 0);

        stop.store(true, Ordering::Relaxed);
        join.join().unwrap();
    }
}
