//! Continuations
//!
//! A continuation runs a body on its own mapped stack and can suspend that
//! stack at a yield and resume it later, on any thread.
//!
//! ```text
//!   run() ──switch──▶ body ... yield ──switch──▶ run(): freeze ──▶ Suspended
//!   run(): thaw ──switch──▶ ... yield returns ... body returns ──▶ Done
//! ```
//!
//! Freeze and thaw execute on the stack of the thread calling `run()`,
//! never on the continuation's own stack. Freeze copies the in-use span
//! `[leaf SP, root SP)` into the stored chunk and may return the stack's
//! physical pages to the OS; thaw copies the span back and jumps to the
//! recorded resume address. The stack's addresses never change, so the
//! restored frames are valid wherever the continuation resumes.
//!
//! The stack of a suspended continuation belongs to nobody. Other threads
//! must not read or write it while the continuation is frozen: writes made
//! in that window are overwritten by thaw.

use crate::arch::{init_context, switch_context, MachineContext};
use crate::memory::{stack_pool, Stack};
use crate::safepoint::{self, current_thread_id, Completion, Mode, OpContext, OpOutcome, ThreadHandle};
use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vthread_core::constants::DEFAULT_STACK_SIZE;
use vthread_core::{pin, kwarn, ContinuationState, PinPredicate, PreemptStatus, StackChunk, ThreadPinState};

/// Transfer codes passed to the root by `switch_context`
const YIELDED: usize = 1;
const PREEMPTED: usize = 2;
const FINISHED: usize = 3;

/// How long `try_preempt` waits for the target to reach a safepoint
pub const DEFAULT_PREEMPT_TIMEOUT: Duration = Duration::from_millis(10);

thread_local! {
    static CURRENT: Cell<*const Inner> = const { Cell::new(std::ptr::null()) };
}

#[inline(never)]
fn current_inner() -> *const Inner {
    CURRENT.with(|c| c.get())
}

#[inline(never)]
fn replace_current(inner: *const Inner) -> *const Inner {
    CURRENT.with(|c| c.replace(inner))
}

/// Result of one `run()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The body yielded; call `run()` again
    Yielded,

    /// The body was forced to yield by `try_preempt`; call `run()` again
    Preempted,

    /// The body returned
    Finished,
}

struct Frames {
    stack: Option<Stack>,
    stack_size: usize,
    root_sp: usize,
    root_ip: usize,
    /// Context of the body at its last transfer out
    leaf: MachineContext,
    /// Context of the `run()` caller
    ret: MachineContext,
    stored: StackChunk,
    body: Option<Box<dyn FnOnce() + Send + 'static>>,
    panic: Option<Box<dyn Any + Send + 'static>>,
    preempt_op: Option<Completion>,
}

struct Inner {
    state: AtomicU8,
    yielding: AtomicBool,
    preempt_pending: AtomicBool,
    mounted_on: AtomicU64,
    release_pages: bool,
    frames: UnsafeCell<Frames>,
}

// Safety: `frames` is touched only by the thread inside `run()` and by the
// body it is running. The preempt action writes `preempt_op` only on the
// thread the continuation is mounted on, from inside the body.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Inner {
    #[inline]
    fn state(&self) -> ContinuationState {
        ContinuationState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn is_current(&self) -> bool {
        std::ptr::eq(current_inner(), self)
    }
}

/// A suspendable, resumable computation
pub struct Continuation {
    inner: Box<Inner>,
}

impl Continuation {
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(DEFAULT_STACK_SIZE, body)
    }

    /// The stack is mapped on the first `run()`; a size the allocator
    /// rejects makes that call panic.
    pub fn with_stack_size<F>(size: usize, body: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Continuation {
            inner: Box::new(Inner {
                state: AtomicU8::new(ContinuationState::NotStarted as u8),
                yielding: AtomicBool::new(false),
                preempt_pending: AtomicBool::new(false),
                mounted_on: AtomicU64::new(0),
                release_pages: true,
                frames: UnsafeCell::new(Frames {
                    stack: None,
                    stack_size: size,
                    root_sp: 0,
                    root_ip: 0,
                    leaf: MachineContext::default(),
                    ret: MachineContext::default(),
                    stored: StackChunk::new(),
                    body: Some(Box::new(body)),
                    panic: None,
                    preempt_op: None,
                }),
            }),
        }
    }

    /// Whether freezing hands the stack's physical pages back to the OS
    pub fn release_frozen_stack(mut self, enable: bool) -> Self {
        self.inner.release_pages = enable;
        self
    }

    /// Start or resume the body on the calling thread
    ///
    /// Returns when the body yields or returns. A panic escaping the body
    /// finishes the continuation and is re-raised here.
    ///
    /// # Panics
    ///
    /// When the continuation is running or done, or its stack cannot be
    /// mapped.
    pub fn run(&self) -> RunOutcome {
        let inner: &Inner = &self.inner;
        let frames = inner.frames.get();

        let started = inner.state.compare_exchange(
            ContinuationState::NotStarted as u8,
            ContinuationState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        // Safety: state is Running and this thread won the transition, so
        // nobody else touches the frames until the body transfers back.
        unsafe {
            if started.is_ok() {
                self.start(frames);
            } else if inner
                .state
                .compare_exchange(
                    ContinuationState::Suspended as u8,
                    ContinuationState::Running as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                let ip = (*frames).stored.thaw();
                (*frames).leaf.set_instruction_pointer(ip);
            } else {
                panic!("run() on a continuation in state {:?}", inner.state());
            }
        }

        inner.mounted_on.store(current_thread_id(), Ordering::Relaxed);
        let prev = replace_current(inner);
        // Safety: leaf holds a context prepared by init_context or saved by
        // the body's last transfer, with its stack contents restored.
        let code = unsafe { switch_context(&mut (*frames).ret, &(*frames).leaf, 0) };
        replace_current(prev);

        match code {
            YIELDED => {
                unsafe { self.suspend(frames) };
                RunOutcome::Yielded
            }
            PREEMPTED => {
                unsafe { self.suspend(frames) };
                RunOutcome::Preempted
            }
            _ => {
                unsafe { self.finish(frames) };
                RunOutcome::Finished
            }
        }
    }

    unsafe fn start(&self, frames: *mut Frames) {
        let stack = match stack_pool().take((*frames).stack_size) {
            Ok(stack) => stack,
            Err(e) => {
                (*frames).body = None;
                self.inner.state.store(ContinuationState::Done as u8, Ordering::Release);
                panic!("continuation stack allocation failed: {}", e);
            }
        };
        let root_sp = stack.top() & !0xF;
        init_context(&mut (*frames).leaf, root_sp, entry, &*self.inner as *const Inner as usize);
        (*frames).root_sp = root_sp;
        (*frames).root_ip = (*frames).leaf.instruction_pointer();
        (*frames).stack = Some(stack);
    }

    unsafe fn suspend(&self, frames: *mut Frames) {
        let inner: &Inner = &self.inner;
        let leaf_sp = (*frames).leaf.stack_pointer();
        let leaf_ip = (*frames).leaf.instruction_pointer();
        (*frames).stored.freeze(leaf_sp, (*frames).root_sp, leaf_ip);

        if inner.release_pages {
            if let Some(stack) = &(*frames).stack {
                if let Err(e) = stack.release(stack.bottom(), (*frames).root_sp) {
                    kwarn!("frozen stack release failed: {}", e);
                }
            }
        }

        inner.yielding.store(false, Ordering::Relaxed);
        let op = (*frames).preempt_op.take();
        inner.mounted_on.store(0, Ordering::Relaxed);
        // Publishes the stored frames to whoever runs us next
        inner.state.store(ContinuationState::Suspended as u8, Ordering::Release);

        // Nothing of `inner` is touched from here on: a requester may already
        // be resuming the continuation on another thread.
        if let Some(op) = op {
            op.complete(PreemptStatus::Success.code());
        }
    }

    unsafe fn finish(&self, frames: *mut Frames) {
        let inner: &Inner = &self.inner;
        if let Some(stack) = (*frames).stack.take() {
            stack_pool().give(stack);
        }
        (*frames).stored.clear();
        (*frames).root_sp = 0;
        (*frames).root_ip = 0;
        drop((*frames).preempt_op.take());
        let panic = (*frames).panic.take();
        inner.yielding.store(false, Ordering::Relaxed);
        inner.mounted_on.store(0, Ordering::Relaxed);
        inner.state.store(ContinuationState::Done as u8, Ordering::Release);

        if let Some(payload) = panic {
            panic::resume_unwind(payload);
        }
    }

    /// Suspend the continuation running on the calling thread
    ///
    /// Returns after the continuation has been resumed, possibly on another
    /// thread. Refuses to capture, and returns the pin status, while the
    /// thread is inside a critical or native section.
    ///
    /// # Panics
    ///
    /// When called outside a running continuation.
    pub fn yield_current() -> PreemptStatus {
        let inner = current_inner();
        assert!(!inner.is_null(), "yield outside of a running continuation");
        if let Some(reason) = pin::current_pin() {
            return reason.status();
        }
        // Safety: a current continuation outlives its own body
        unsafe { yield_with(&*inner, YIELDED) }
    }

    /// Force the continuation running on `target` to yield
    ///
    /// Pinned and yielding targets are reported, never waited for.
    pub fn try_preempt(&self, target: &ThreadHandle) -> PreemptStatus {
        self.try_preempt_with(target, Arc::new(ThreadPinState), DEFAULT_PREEMPT_TIMEOUT)
    }

    /// `try_preempt` with an explicit pinning predicate and safepoint timeout
    ///
    /// A target that does not reach a safepoint within `timeout` reports
    /// `PinnedNative`.
    pub fn try_preempt_with(
        &self,
        target: &ThreadHandle,
        pin: Arc<dyn PinPredicate>,
        timeout: Duration,
    ) -> PreemptStatus {
        let inner: &Inner = &self.inner;
        if inner.state() != ContinuationState::Running {
            return PreemptStatus::Success;
        }
        if inner.yielding.load(Ordering::Acquire) {
            return PreemptStatus::Yielding;
        }

        if current_thread_id() == target.id() {
            if !inner.is_current() {
                return settled(inner);
            }
            if let Some(reason) = pin.pinned() {
                return reason.status();
            }
            inner.preempt_pending.store(true, Ordering::Relaxed);
            return crate::scheduler::forced_yield();
        }

        let cont = ContPtr(inner);
        let outcome = safepoint::submit_with_timeout(Mode::Targeted(Arc::clone(target)), timeout, move |ctx| {
            // Safety: the requester keeps the continuation alive until the
            // operation completes, and a cancelled operation never runs.
            unsafe { preempt_action(&*cont.get(), &*pin, ctx) }
        });
        match outcome {
            OpOutcome::Completed(code) => PreemptStatus::from_code(code),
            OpOutcome::TimedOut => PreemptStatus::PinnedNative,
        }
    }

    /// Perform a forced yield requested by `try_preempt`, if one is pending
    /// for the continuation current on this thread
    ///
    /// `None` when nothing was pending.
    pub(crate) fn yield_preempted() -> Option<PreemptStatus> {
        let inner = current_inner();
        if inner.is_null() {
            return None;
        }
        // Safety: a current continuation outlives its own body
        let inner = unsafe { &*inner };
        if !inner.preempt_pending.swap(false, Ordering::AcqRel) {
            return None;
        }
        if let Some(reason) = pin::current_pin() {
            let status = reason.status();
            // Safety: only the mounted body touches preempt_op while running
            if let Some(op) = unsafe { (*inner.frames.get()).preempt_op.take() } {
                op.complete(status.code());
            }
            return Some(status);
        }
        let status = unsafe { yield_with(inner, PREEMPTED) };
        if !status.is_success() {
            drop(unsafe { (*inner.frames.get()).preempt_op.take() });
        }
        Some(status)
    }

    #[inline]
    pub fn state(&self) -> ContinuationState {
        self.inner.state()
    }

    /// True once `run()` has been called, including after the body returned
    #[inline]
    pub fn is_started(&self) -> bool {
        self.state() != ContinuationState::NotStarted
    }

    /// True while no root frame is recorded: before start and after finish
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root_stack_pointer() == 0
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// Bytes of frame data currently frozen; 0 unless suspended
    pub fn stored_size(&self) -> usize {
        if self.state() != ContinuationState::Suspended {
            return 0;
        }
        // Safety: a suspended continuation's frames are quiescent
        unsafe { (*self.inner.frames.get()).stored.len() }
    }

    /// Highest address of the continuation's frames; 0 before start and
    /// after finish
    pub fn root_stack_pointer(&self) -> usize {
        match self.state() {
            ContinuationState::Running | ContinuationState::Suspended => unsafe {
                (*self.inner.frames.get()).root_sp
            },
            _ => 0,
        }
    }

    /// Managed thread the continuation is running on, if any
    pub fn mounted_thread(&self) -> Option<ThreadHandle> {
        match self.inner.mounted_on.load(Ordering::Relaxed) {
            0 => None,
            id => safepoint::find_thread(id),
        }
    }

    /// Whether this continuation is the innermost one running on the
    /// calling thread
    pub fn is_current(&self) -> bool {
        self.inner.is_current()
    }
}

/// Whether the continuation current on this thread has a forced yield pending
#[inline]
pub(crate) fn preempt_requested() -> bool {
    let inner = current_inner();
    // Safety: a current continuation outlives its own body
    !inner.is_null() && unsafe { (*inner).preempt_pending.load(Ordering::Relaxed) }
}

impl Drop for Continuation {
    /// Dropping a suspended continuation does not run the destructors of
    /// the values live in its frozen frames; they are leaked.
    fn drop(&mut self) {
        debug_assert!(
            self.state() != ContinuationState::Running,
            "continuation dropped while running"
        );
        let frames = self.inner.frames.get_mut();
        if let Some(stack) = frames.stack.take() {
            stack_pool().give(stack);
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("state", &self.state())
            .field("stored_size", &self.stored_size())
            .finish()
    }
}

/// Report for a running continuation that is not current where it was
/// expected
fn settled(inner: &Inner) -> PreemptStatus {
    if inner.state() == ContinuationState::Suspended {
        PreemptStatus::Success
    } else {
        PreemptStatus::Yielding
    }
}

/// Transfer to the root with `code`; returns once resumed
unsafe fn yield_with(inner: &Inner, code: usize) -> PreemptStatus {
    if inner.yielding.swap(true, Ordering::AcqRel) {
        return PreemptStatus::Yielding;
    }
    let frames = inner.frames.get();
    switch_context(&mut (*frames).leaf, &(*frames).ret, code);
    PreemptStatus::Success
}

/// Runs on the target thread at a safepoint, or on the requester when the
/// target is blocked
unsafe fn preempt_action(inner: &Inner, pin: &dyn PinPredicate, ctx: &OpContext) -> u8 {
    if inner.state() != ContinuationState::Running {
        return PreemptStatus::Success.code();
    }
    if !ctx.on_target() {
        return PreemptStatus::PinnedNative.code();
    }
    if !inner.is_current() {
        return settled(inner).code();
    }
    if let Some(reason) = pin.pinned() {
        return reason.status().code();
    }
    if inner.yielding.load(Ordering::Acquire) {
        return PreemptStatus::Yielding.code();
    }
    // Completed by the root once the frames are frozen
    (*inner.frames.get()).preempt_op = Some(ctx.defer(PreemptStatus::Yielding.code()));
    inner.preempt_pending.store(true, Ordering::Relaxed);
    PreemptStatus::Success.code()
}

struct ContPtr(*const Inner);

// Safety: see `try_preempt_with`
unsafe impl Send for ContPtr {}

impl ContPtr {
    #[inline]
    fn get(&self) -> *const Inner {
        self.0
    }
}

extern "C" fn entry(arg: usize) -> ! {
    let inner = arg as *const Inner;
    unsafe {
        let frames = (*inner).frames.get();
        if let Some(body) = (*frames).body.take() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
                (*frames).panic = Some(payload);
            }
        }
        switch_context(&mut (*frames).leaf, &(*frames).ret, FINISHED);
    }
    // A finished continuation is never resumed
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safepoint::{attach_current_thread, poll};
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Mutex};
    use std::thread;
    use vthread_core::{CriticalSection, SpinLock};

    #[test]
    fn test_yield_and_resume_k_times() {
        const K: usize = 25;
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let cont = {
            let counter = Arc::clone(&counter);
            let seen = Arc::clone(&seen);
            Continuation::new(move || {
                let mut local = 0usize;
                for _ in 0..K {
                    assert_eq!(Continuation::yield_current(), PreemptStatus::Success);
                    local += 1;
                    seen.lock().unwrap().push(local);
                }
                counter.store(local, Ordering::SeqCst);
            })
        };

        assert!(!cont.is_started());
        assert!(cont.is_empty());
        assert_eq!(cont.root_stack_pointer(), 0);

        for i in 0..K {
            assert_eq!(cont.run(), RunOutcome::Yielded);
            assert!(cont.is_started());
            assert_eq!(cont.state(), ContinuationState::Suspended);
            assert!(cont.stored_size() > 0);
            assert!(!cont.is_empty());
            assert_ne!(cont.root_stack_pointer(), 0);
            assert_eq!(seen.lock().unwrap().len(), i);
        }
        assert_eq!(cont.run(), RunOutcome::Finished);
        assert!(cont.is_done());
        assert!(cont.is_started());
        assert!(cont.is_empty());
        assert_eq!(cont.root_stack_pointer(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), K);
        assert_eq!(*seen.lock().unwrap(), (1..=K).collect::<Vec<_>>());
    }

    #[test]
    fn test_running_body_is_not_empty() {
        let slot: Arc<std::sync::OnceLock<std::sync::Weak<Continuation>>> = Arc::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let cont = {
            let slot = Arc::clone(&slot);
            let seen = Arc::clone(&seen);
            Arc::new(Continuation::new(move || {
                for _ in 0..2 {
                    let me = slot.get().and_then(|w| w.upgrade()).unwrap();
                    seen.lock().unwrap().push((me.state(), me.is_empty(), me.root_stack_pointer()));
                    Continuation::yield_current();
                }
            }))
        };
        slot.set(Arc::downgrade(&cont)).unwrap();

        while cont.run() != RunOutcome::Finished {}

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        for &(state, empty, root_sp) in seen.iter() {
            assert_eq!(state, ContinuationState::Running);
            assert!(!empty);
            assert_ne!(root_sp, 0);
        }
        // Root frame is the same after a resume
        assert_eq!(seen[0].2, seen[1].2);
        assert!(cont.is_empty());
    }

    #[inline(never)]
    fn deep(depth: usize) -> u64 {
        let mut block = [0u64; 64];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = (depth * 64 + i) as u64;
        }
        let below = if depth == 0 {
            assert_eq!(Continuation::yield_current(), PreemptStatus::Success);
            0
        } else {
            deep(depth - 1)
        };
        below + block.iter().sum::<u64>()
    }

    #[test]
    fn test_deep_frames_survive_freeze() {
        let result = Arc::new(AtomicU64::new(0));
        let cont = {
            let result = Arc::clone(&result);
            Continuation::new(move || result.store(deep(40), Ordering::SeqCst))
        };
        assert_eq!(cont.run(), RunOutcome::Yielded);
        assert!(cont.stored_size() > 40 * 64 * 8);
        assert_eq!(cont.run(), RunOutcome::Finished);

        let n = 41 * 64;
        assert_eq!(result.load(Ordering::SeqCst), (n * (n - 1) / 2) as u64);
    }

    #[test]
    fn test_frames_kept_without_page_release() {
        let cont = Continuation::new(|| {
            let values: Vec<u32> = (0..100).collect();
            Continuation::yield_current();
            assert_eq!(values.iter().sum::<u32>(), 4950);
        })
        .release_frozen_stack(false);
        assert_eq!(cont.run(), RunOutcome::Yielded);
        assert_eq!(cont.run(), RunOutcome::Finished);
    }

    #[test]
    fn test_panic_finishes_and_propagates() {
        let cont = Continuation::new(|| {
            Continuation::yield_current();
            panic!("boom");
        });
        assert_eq!(cont.run(), RunOutcome::Yielded);

        let err = panic::catch_unwind(AssertUnwindSafe(|| cont.run())).unwrap_err();
        assert_eq!(err.downcast_ref::<&str>(), Some(&"boom"));
        assert!(cont.is_done());
        assert!(cont.is_empty());

        // Resuming a finished continuation is a protocol violation
        assert!(panic::catch_unwind(AssertUnwindSafe(|| cont.run())).is_err());
    }

    #[test]
    #[should_panic(expected = "yield outside of a running continuation")]
    fn test_yield_outside_continuation_panics() {
        Continuation::yield_current();
    }

    #[test]
    fn test_yield_refused_in_critical_section() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let cont = {
            let statuses = Arc::clone(&statuses);
            Continuation::new(move || {
                let lock = SpinLock::new(());
                let guard = lock.lock();
                let held = Continuation::yield_current();
                drop(guard);
                let native = {
                    let _n = vthread_core::NativeSection::enter();
                    Continuation::yield_current()
                };
                let free = Continuation::yield_current();
                statuses.lock().unwrap().extend([held, native, free]);
            })
        };
        assert_eq!(cont.run(), RunOutcome::Yielded);
        assert_eq!(cont.run(), RunOutcome::Finished);
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![
                PreemptStatus::PinnedCriticalSection,
                PreemptStatus::PinnedNative,
                PreemptStatus::Success
            ]
        );
    }

    #[test]
    fn test_nested_continuations() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let outer = {
            let order = Arc::clone(&order);
            Continuation::new(move || {
                let inner = {
                    let order = Arc::clone(&order);
                    Continuation::new(move || {
                        order.lock().unwrap().push("inner-1");
                        Continuation::yield_current();
                        order.lock().unwrap().push("inner-2");
                    })
                };
                assert_eq!(inner.run(), RunOutcome::Yielded);
                assert!(!inner.is_current());
                order.lock().unwrap().push("outer-1");
                Continuation::yield_current();
                assert_eq!(inner.run(), RunOutcome::Finished);
                order.lock().unwrap().push("outer-2");
            })
        };
        assert_eq!(outer.run(), RunOutcome::Yielded);
        assert_eq!(outer.run(), RunOutcome::Finished);
        assert_eq!(*order.lock().unwrap(), vec!["inner-1", "outer-1", "inner-2", "outer-2"]);
    }

    #[test]
    fn test_try_preempt_idle_targets() {
        let _serial = crate::test_serial();
        let attachment = attach_current_thread("requester");
        let me = Arc::clone(attachment.handle());

        let cont = Continuation::new(|| {
            Continuation::yield_current();
        });
        // Not started, suspended and done are all already settled
        assert_eq!(cont.try_preempt(&me), PreemptStatus::Success);
        assert_eq!(cont.run(), RunOutcome::Yielded);
        let before = cont.stored_size();
        assert_eq!(cont.try_preempt(&me), PreemptStatus::Success);
        assert_eq!(cont.stored_size(), before);
        assert_eq!(cont.run(), RunOutcome::Finished);
        assert_eq!(cont.try_preempt(&me), PreemptStatus::Success);
    }

    #[test]
    fn test_self_preempt_yields() {
        let _serial = crate::test_serial();
        let attachment = attach_current_thread("self");
        let me = Arc::clone(attachment.handle());

        let cont = Arc::new(Mutex::new(None::<Arc<Continuation>>));
        let status = Arc::new(Mutex::new(None));
        let c = {
            let cont = Arc::clone(&cont);
            let status = Arc::clone(&status);
            Arc::new(Continuation::new(move || {
                let this = cont.lock().unwrap().clone().unwrap();
                *status.lock().unwrap() = Some(this.try_preempt(&me));
            }))
        };
        *cont.lock().unwrap() = Some(Arc::clone(&c));

        assert_eq!(c.run(), RunOutcome::Preempted);
        assert_eq!(c.run(), RunOutcome::Finished);
        assert_eq!(*status.lock().unwrap(), Some(PreemptStatus::Success));
        cont.lock().unwrap().take();
    }

    #[test]
    fn test_preempt_pinned_then_migrate() {
        let _serial = crate::test_serial();
        let lock = Arc::new(SpinLock::new(()));
        let locked = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let finished_on = Arc::new(Mutex::new(None));

        let cont = {
            let (lock, locked, release, stop) =
                (Arc::clone(&lock), Arc::clone(&locked), Arc::clone(&release), Arc::clone(&stop));
            let finished_on = Arc::clone(&finished_on);
            Arc::new(Continuation::new(move || {
                {
                    let _guard = lock.lock();
                    locked.store(true, Ordering::SeqCst);
                    while !release.load(Ordering::SeqCst) {
                        poll();
                        std::hint::spin_loop();
                    }
                }
                while !stop.load(Ordering::SeqCst) {
                    poll();
                    std::hint::spin_loop();
                }
                *finished_on.lock().unwrap() = Some(thread::current().id());
            }))
        };

        let (tx, rx) = mpsc::channel();
        let target = {
            let cont = Arc::clone(&cont);
            thread::spawn(move || {
                let attachment = attach_current_thread("target");
                tx.send(Arc::clone(attachment.handle())).unwrap();
                cont.run()
            })
        };
        let handle = rx.recv().unwrap();
        while !locked.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        let long = Duration::from_secs(5);
        let status = cont.try_preempt_with(&handle, Arc::new(ThreadPinState), long);
        assert_eq!(status, PreemptStatus::PinnedCriticalSection);
        assert_eq!(cont.state(), ContinuationState::Running);
        assert_eq!(cont.stored_size(), 0);
        assert_eq!(cont.mounted_thread().map(|t| t.id()), Some(handle.id()));

        release.store(true, Ordering::SeqCst);
        let status = cont.try_preempt_with(&handle, Arc::new(ThreadPinState), long);
        assert_eq!(status, PreemptStatus::Success);
        assert_eq!(target.join().unwrap(), RunOutcome::Preempted);
        assert_eq!(cont.state(), ContinuationState::Suspended);
        assert!(cont.stored_size() > 0);

        // Resume on this thread
        stop.store(true, Ordering::SeqCst);
        assert_eq!(cont.run(), RunOutcome::Finished);
        assert_eq!(*finished_on.lock().unwrap(), Some(thread::current().id()));
    }

    #[test]
    fn test_preempt_with_custom_predicate() {
        let _serial = crate::test_serial();
        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(false));
        let cont = {
            let (stop, running) = (Arc::clone(&stop), Arc::clone(&running));
            Arc::new(Continuation::new(move || {
                running.store(true, Ordering::SeqCst);
                while !stop.load(Ordering::SeqCst) {
                    poll();
                    std::hint::spin_loop();
                }
            }))
        };

        let (tx, rx) = mpsc::channel();
        let target = {
            let cont = Arc::clone(&cont);
            thread::spawn(move || {
                let attachment = attach_current_thread("target");
                tx.send(Arc::clone(attachment.handle())).unwrap();
                let mut yields = 0;
                while cont.run() != RunOutcome::Finished {
                    yields += 1;
                }
                yields
            })
        };
        let handle = rx.recv().unwrap();
        while !running.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        let always_native: Arc<dyn PinPredicate> = Arc::new(|| Some(pin::PinReason::Native));
        let status = cont.try_preempt_with(&handle, always_native, Duration::from_secs(5));
        assert_eq!(status, PreemptStatus::PinnedNative);

        let status = cont.try_preempt_with(&handle, Arc::new(ThreadPinState), Duration::from_secs(5));
        assert_eq!(status, PreemptStatus::Success);

        stop.store(true, Ordering::SeqCst);
        assert_eq!(target.join().unwrap(), 1);
        assert!(cont.is_done());
    }

    #[test]
    fn test_critical_section_blocks_capture() {
        let cont = Continuation::new(|| {
            let _cs = CriticalSection::enter();
            assert_eq!(Continuation::yield_current(), PreemptStatus::PinnedCriticalSection);
        });
        assert_eq!(cont.run(), RunOutcome::Finished);
    }
}
