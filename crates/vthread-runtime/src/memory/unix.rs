//! mmap-backed stacks with a guard page

use vthread_core::constants::{GUARD_SIZE, MIN_STACK_SIZE};
use vthread_core::MemoryError;
use std::sync::atomic::{AtomicUsize, Ordering};

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// System page size (cached)
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    };
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

#[inline]
fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// A mapped stack region
///
/// Layout, low to high: guard (PROT_NONE), usable stack. The stack grows
/// down from `top()` toward the guard.
pub struct Stack {
    base: *mut u8,
    mapped: usize,
    guard: usize,
    requested: usize,
}

// Safety: the mapping is exclusively owned and has no thread affinity
unsafe impl Send for Stack {}

impl Stack {
    /// Map a stack with at least `size` usable bytes
    pub fn new(size: usize) -> Result<Stack, MemoryError> {
        if size < MIN_STACK_SIZE {
            return Err(MemoryError::StackTooSmall);
        }
        let page = page_size();
        let guard = round_up(GUARD_SIZE, page);
        let mapped = round_up(size, page) + guard;

        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK;
            } else {
                let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
            }
        }

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::MapFailed);
        }

        // Overflow faults on the guard instead of corrupting the heap
        let ret = unsafe { libc::mprotect(base, guard, libc::PROT_NONE) };
        if ret != 0 {
            unsafe { libc::munmap(base, mapped) };
            return Err(MemoryError::ProtectFailed);
        }

        Ok(Stack {
            base: base as *mut u8,
            mapped,
            guard,
            requested: size,
        })
    }

    /// Highest address, exclusive; initial stack pointer
    #[inline]
    pub fn top(&self) -> usize {
        self.base as usize + self.mapped
    }

    /// Lowest usable address, just above the guard
    #[inline]
    pub fn bottom(&self) -> usize {
        self.base as usize + self.guard
    }

    /// Usable bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.mapped - self.guard
    }

    /// Size the stack was requested with
    #[inline]
    pub fn requested_size(&self) -> usize {
        self.requested
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.bottom() && addr < self.top()
    }

    /// Hand the whole pages inside `[from, to)` back to the OS
    ///
    /// The range reads as zeroes afterwards. Partial pages at either end are
    /// left alone.
    pub fn release(&self, from: usize, to: usize) -> Result<(), MemoryError> {
        let page = page_size();
        let start = round_up(from.max(self.bottom()), page);
        let end = to.min(self.top()) & !(page - 1);
        if start >= end {
            return Ok(());
        }
        let ret = unsafe {
            libc::madvise(start as *mut libc::c_void, end - start, libc::MADV_DONTNEED)
        };
        if ret != 0 {
            return Err(MemoryError::AdviseFailed);
        }
        Ok(())
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.mapped) };
        debug_assert_eq!(ret, 0, "{}", MemoryError::UnmapFailed);
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &format_args!("{:#x}", self.bottom()))
            .field("top", &format_args!("{:#x}", self.top()))
            .finish()
    }
}
