//! Cross-thread operation queue
//!
//! Operations are executed one at a time in submission order. The requester
//! of the operation at the head of the queue drives it:
//!
//! - `StopTheWorld`: raise the global flag, arm every other managed thread
//!   and wait until each is stopped, then run the action on the requester
//! - `Targeted`: hand the operation to one thread, which runs it in its next
//!   poll. A target that is `Blocked` cannot poll, so the requester claims
//!   the operation and runs it itself with `on_target() == false`.
//!
//! Requesters wait in `Blocked` state, so a thread waiting for its turn
//! never holds up somebody else's stop-the-world.

use super::{blocking, current_thread, threads, ThreadHandle, STW_ACTIVE};
use crate::parking::{Park, Parker};
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use vthread_core::{SpinLock, ThreadState};

const QUEUED: u8 = 0;
const CLAIMED: u8 = 1;
const COMPLETED: u8 = 2;
const CANCELLED: u8 = 3;

/// Result code of an action that panicked
const PANICKED: u8 = u8::MAX;

/// Longest single park of a waiting requester
const WAIT_PARK: Duration = Duration::from_micros(200);

type Action = Box<dyn FnOnce(&OpContext) -> u8 + Send + 'static>;

static QUEUE: SpinLock<VecDeque<Arc<Operation>>> = SpinLock::new(VecDeque::new());

/// Where an operation runs
#[derive(Debug, Clone)]
pub enum Mode {
    /// Every other managed thread parked at a safepoint
    StopTheWorld,

    /// One specific thread at its next poll, all others running
    Targeted(ThreadHandle),
}

/// How a submitted operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    /// The action ran and produced this code
    Completed(u8),

    /// The target never reached a poll before the deadline; the action
    /// did not run and never will
    TimedOut,
}

pub(super) struct Operation {
    mode: Mode,
    action: SpinLock<Option<Action>>,
    state: AtomicU8,
    result: AtomicU8,
    turn: AtomicBool,
    parker: Parker,
}

impl Operation {
    fn new(mode: Mode, action: Action) -> Self {
        Operation {
            mode,
            action: SpinLock::new(Some(action)),
            state: AtomicU8::new(QUEUED),
            result: AtomicU8::new(0),
            turn: AtomicBool::new(false),
            parker: Parker::new(),
        }
    }

    /// Take exclusive right to execute
    #[inline]
    pub(super) fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    fn try_cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            drop(self.action.lock().take());
        }
        cancelled
    }

    #[inline]
    fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETED
    }

    fn complete(&self, code: u8) {
        self.result.store(code, Ordering::Relaxed);
        self.state.store(COMPLETED, Ordering::Release);
        self.parker.unpark();
    }

    /// Run the action of a claimed operation
    ///
    /// Completes it unless the action deferred completion. A panic in the
    /// action completes the operation and then continues unwinding.
    pub(super) fn execute(self: &Arc<Self>, on_target: bool) {
        let action = self.action.lock().take();
        let Some(action) = action else {
            return;
        };
        let ctx = OpContext {
            op: self,
            on_target,
            deferred: Cell::new(false),
        };
        match panic::catch_unwind(AssertUnwindSafe(|| action(&ctx))) {
            Ok(code) => {
                if !ctx.deferred.get() {
                    self.complete(code);
                }
            }
            Err(payload) => {
                if !ctx.deferred.get() {
                    self.complete(PANICKED);
                }
                panic::resume_unwind(payload);
            }
        }
    }

    /// Park the requester until `done` holds
    fn wait(&self, done: impl Fn() -> bool) {
        if done() {
            return;
        }
        blocking(|| {
            while !done() {
                self.parker.park(Some(WAIT_PARK));
            }
        });
    }
}

/// Handed to an action while it executes
pub struct OpContext<'a> {
    op: &'a Arc<Operation>,
    on_target: bool,
    deferred: Cell<bool>,
}

impl OpContext<'_> {
    /// Whether the action runs on the thread the operation was aimed at
    ///
    /// False when the requester runs it for a blocked target.
    #[inline]
    pub fn on_target(&self) -> bool {
        self.on_target
    }

    /// Keep the operation open after the action returns
    ///
    /// The requester stays waiting until the returned handle completes. A
    /// handle dropped without completing completes with `fallback`.
    pub fn defer(&self, fallback: u8) -> Completion {
        assert!(!self.deferred.replace(true), "operation completion deferred twice");
        Completion {
            op: Some(Arc::clone(self.op)),
            fallback,
        }
    }
}

/// Deferred completion of an operation
pub struct Completion {
    op: Option<Arc<Operation>>,
    fallback: u8,
}

impl Completion {
    pub fn complete(mut self, code: u8) {
        if let Some(op) = self.op.take() {
            op.complete(code);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(op) = self.op.take() {
            op.complete(self.fallback);
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.op.is_some())
            .field("fallback", &self.fallback)
            .finish()
    }
}

/// Removes the operation from the queue head and passes the turn on
struct Turn<'a>(&'a Arc<Operation>);

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let next = {
            let mut queue = QUEUE.lock();
            queue.retain(|op| !Arc::ptr_eq(op, self.0));
            queue.front().cloned()
        };
        if let Some(next) = next {
            next.turn.store(true, Ordering::Release);
            next.parker.unpark();
        }
    }
}

/// Submit an operation and wait for it to complete
pub fn submit<F>(mode: Mode, action: F) -> OpOutcome
where
    F: FnOnce(&OpContext) -> u8 + Send + 'static,
{
    run(mode, None, Box::new(action))
}

/// Like `submit`, but a targeted operation whose target does not poll
/// within `timeout` is cancelled
///
/// The timeout runs from the moment the operation reaches the head of the
/// queue. Stop-the-world operations ignore it.
pub fn submit_with_timeout<F>(mode: Mode, timeout: Duration, action: F) -> OpOutcome
where
    F: FnOnce(&OpContext) -> u8 + Send + 'static,
{
    run(mode, Some(timeout), Box::new(action))
}

fn run(mode: Mode, timeout: Option<Duration>, action: Action) -> OpOutcome {
    let op = Arc::new(Operation::new(mode, action));
    {
        let mut queue = QUEUE.lock();
        queue.push_back(Arc::clone(&op));
        if queue.len() == 1 {
            op.turn.store(true, Ordering::Relaxed);
        }
    }
    let _turn = Turn(&op);
    op.wait(|| op.turn.load(Ordering::Acquire));

    match &op.mode {
        Mode::StopTheWorld => run_stop_the_world(&op),
        Mode::Targeted(target) => run_targeted(&op, target, timeout),
    }
}

fn run_stop_the_world(op: &Arc<Operation>) -> OpOutcome {
    struct Restart(Vec<ThreadHandle>);

    impl Drop for Restart {
        fn drop(&mut self) {
            STW_ACTIVE.store(false, Ordering::SeqCst);
            for thread in &self.0 {
                thread.unpark();
            }
        }
    }

    let me = current_thread();
    STW_ACTIVE.store(true, Ordering::SeqCst);
    let others: Vec<ThreadHandle> = threads()
        .into_iter()
        .filter(|t| me.as_ref().is_none_or(|me| !Arc::ptr_eq(t, me)))
        .collect();
    let restart = Restart(others);

    for thread in &restart.0 {
        thread.arm();
    }
    let mut round = 0u32;
    for thread in &restart.0 {
        while !thread.is_stopped() {
            backoff(round);
            round = round.saturating_add(1);
        }
    }

    op.try_claim();
    op.execute(true);
    drop(restart);

    op.wait(|| op.is_completed());
    OpOutcome::Completed(op.result.load(Ordering::Relaxed))
}

fn run_targeted(op: &Arc<Operation>, target: &ThreadHandle, timeout: Option<Duration>) -> OpOutcome {
    let on_self = current_thread().is_some_and(|me| Arc::ptr_eq(&me, target));
    if on_self {
        op.try_claim();
        op.execute(true);
        op.wait(|| op.is_completed());
        return OpOutcome::Completed(op.result.load(Ordering::Relaxed));
    }

    *target.pending.lock() = Some(Arc::clone(op));
    target.arm();

    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if op.is_completed() {
            return OpOutcome::Completed(op.result.load(Ordering::Relaxed));
        }
        if op.state.load(Ordering::Acquire) == QUEUED {
            if target.state() == ThreadState::Blocked && op.try_claim() {
                op.execute(false);
                continue;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) && op.try_cancel() {
                return OpOutcome::TimedOut;
            }
        }
        blocking(|| {
            op.parker.park(Some(WAIT_PARK));
        });
    }
}

/// Operations queued or executing
#[cfg(test)]
pub(super) fn queue_len() -> usize {
    QUEUE.lock().len()
}

#[inline]
fn backoff(round: u32) {
    if round < 64 {
        std::hint::spin_loop();
    } else if round < 128 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_micros(50));
    }
}
