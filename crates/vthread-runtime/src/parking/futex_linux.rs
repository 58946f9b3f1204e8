//! Linux futex parker
//!
//! Futex word: 0 = no permit, 1 = permit available.

use super::Park;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const EMPTY: u32 = 0;
const NOTIFIED: u32 = 1;

pub struct FutexParker {
    word: AtomicU32,
}

impl FutexParker {
    pub const fn new() -> Self {
        FutexParker {
            word: AtomicU32::new(EMPTY),
        }
    }

    fn futex_wait(&self, timeout: Option<Duration>) {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(i64::MAX as u64) as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);

        // Returns immediately unless the word is still EMPTY. Timeouts,
        // EAGAIN and EINTR all fall through to the permit check.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.word.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                EMPTY,
                ts_ptr,
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

impl Default for FutexParker {
    fn default() -> Self {
        Self::new()
    }
}

impl Park for FutexParker {
    fn park(&self, timeout: Option<Duration>) -> bool {
        if self.word.swap(EMPTY, Ordering::Acquire) == NOTIFIED {
            return true;
        }
        self.futex_wait(timeout);
        self.word.swap(EMPTY, Ordering::Acquire) == NOTIFIED
    }

    fn unpark(&self) {
        if self.word.swap(NOTIFIED, Ordering::Release) == EMPTY {
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    self.word.as_ptr(),
                    libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                    1i32,
                    std::ptr::null::<libc::timespec>(),
                    std::ptr::null::<u32>(),
                    0u32,
                );
            }
        }
    }
}
