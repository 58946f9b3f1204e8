//! Non-preemptible spin lock
//!
//! Protects sub-microsecond critical sections in the continuation, frame
//! copier, operation queue and ready queues. A thread holding the lock counts
//! as being inside a critical section: forced preemption of it reports
//! `PinnedCriticalSection` and cooperative yields are refused until unlock.
//!
//! The lock word is a single integer with two values. There is no waiter
//! queue and no owner record; correctness rests on compare-and-set to acquire
//! and a release store to unlock.

use crate::pin;
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Rounds that only issue a pause hint
const SPIN_ROUNDS: u32 = 64;

/// Rounds that yield the OS thread once the pure spin is exhausted
const YIELD_ROUNDS: u32 = 8;

/// Rounds that sleep before the cycle starts over
const SLEEP_ROUNDS: u32 = 4;

/// Retry budget of one `try_lock_retries` call made by `lock_no_transition`
pub const LOCK_RETRIES: u32 = SPIN_ROUNDS + YIELD_ROUNDS + SLEEP_ROUNDS;

const BACKOFF_SLEEP: Duration = Duration::from_micros(20);

#[inline]
fn backoff(round: u32) {
    if round < SPIN_ROUNDS {
        core::hint::spin_loop();
    } else if round < SPIN_ROUNDS + YIELD_ROUNDS {
        cfg_if::cfg_if! {
            if #[cfg(any(unix, windows))] {
                std::thread::yield_now();
            } else {
                core::hint::spin_loop();
            }
        }
    } else {
        std::thread::sleep(BACKOFF_SLEEP);
    }
}

/// The bare lock word
///
/// Must be unlocked by the thread that locked it.
pub struct RawSpinLock {
    state: AtomicU32,
}

impl RawSpinLock {
    pub const fn new() -> Self {
        RawSpinLock {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Single compare-and-set attempt
    #[inline]
    pub fn try_lock(&self) -> bool {
        let acquired = self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        if acquired {
            pin::enter_critical();
        }
        acquired
    }

    /// Bounded retry: pause hints first, then OS yields, then short sleeps
    pub fn try_lock_retries(&self, retries: u32) -> bool {
        for round in 0..retries {
            // Test before test-and-set to keep the line shared while held
            if self.state.load(Ordering::Relaxed) == UNLOCKED && self.try_lock() {
                return true;
            }
            backoff(round);
        }
        false
    }

    /// Acquire without changing the thread's safepoint state
    ///
    /// Cycles through `try_lock_retries` until the lock is taken.
    #[inline]
    pub fn lock_no_transition(&self) {
        if self.try_lock() {
            return;
        }
        while !self.try_lock_retries(LOCK_RETRIES) {}
    }

    /// Release store of `UNLOCKED`
    ///
    /// Nothing inside the critical section may move past this store. Later
    /// accesses may still float above it, which is harmless.
    #[inline]
    pub fn unlock(&self) {
        debug_assert!(self.is_locked(), "unlock of an unlocked spin lock");
        self.state.store(UNLOCKED, Ordering::Release);
        pin::exit_critical();
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) == LOCKED
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Spin lock owning the data it protects
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

// Safety: SpinLock provides exclusive access to T
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        SpinLock {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock_no_transition();
        SpinLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(SpinLockGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

/// Guard that releases the spin lock when dropped
///
/// Not `Send`: the critical-section count it holds belongs to this thread.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: We hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: We hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_raw_try_lock() {
        let lock = RawSpinLock::new();
        assert!(lock.try_lock());
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        assert!(!lock.try_lock_retries(3));
        lock.unlock();
        assert!(!lock.is_locked());
        assert!(lock.try_lock_retries(1));
        lock.unlock();
    }

    #[test]
    fn test_holding_lock_pins_thread() {
        let lock = SpinLock::new(());
        assert_eq!(pin::current_pin(), None);
        {
            let _guard = lock.lock();
            assert_eq!(pin::current_pin(), Some(pin::PinReason::CriticalSection));
        }
        assert_eq!(pin::current_pin(), None);
    }

    #[test]
    fn test_try_lock_guard() {
        let lock = SpinLock::new(0u32);

        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.try_lock().is_none());

        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_waiter_acquires_after_release() {
        let lock = Arc::new(SpinLock::new(0u32));
        let guard = lock.lock();

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                // Long enough to pass through the yield and sleep phases
                let mut g = lock.lock();
                *g += 1;
            })
        };

        thread::sleep(Duration::from_millis(20));
        drop(guard);
        waiter.join().unwrap();
        assert_eq!(*lock.lock(), 1);
    }

    fn hammer(threads: usize, per_thread: usize) {
        let lock = Arc::new(SpinLock::new(0usize));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        let mut guard = lock.lock();
                        *guard += 1;
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*lock.lock(), threads * per_thread);
    }

    #[test]
    fn test_no_lost_updates_under_contention() {
        for threads in [2, 4, 8, 16, 32, 64] {
            hammer(threads, 2_000);
        }
    }
}
