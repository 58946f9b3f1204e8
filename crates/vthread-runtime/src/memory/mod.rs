//! Continuation stack memory
//!
//! Every continuation runs on its own mapped stack so that frame addresses
//! stay put across suspends and migrations. Default-size stacks of finished
//! continuations are recycled through a process-wide pool.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    } else {
        compile_error!("vthread-runtime stack memory requires a unix target");
    }
}

use vthread_core::constants::DEFAULT_STACK_SIZE;
use vthread_core::{MemoryError, SpinLock};

/// Stacks kept for reuse at most
const POOL_CAPACITY: usize = 64;

/// LIFO cache of default-size stacks
pub struct StackPool {
    free: SpinLock<Vec<Stack>>,
}

static POOL: StackPool = StackPool::new();

/// The process-wide stack pool
#[inline]
pub fn stack_pool() -> &'static StackPool {
    &POOL
}

impl StackPool {
    pub const fn new() -> Self {
        StackPool {
            free: SpinLock::new(Vec::new()),
        }
    }

    /// A stack of at least `size` usable bytes
    pub fn take(&self, size: usize) -> Result<Stack, MemoryError> {
        if size == DEFAULT_STACK_SIZE {
            let cached = self.free.lock().pop();
            if let Some(stack) = cached {
                return Ok(stack);
            }
        }
        Stack::new(size)
    }

    /// Return a stack; non-default sizes and overflow are unmapped
    pub fn give(&self, stack: Stack) {
        if stack.requested_size() != DEFAULT_STACK_SIZE {
            return;
        }
        let overflow = {
            let mut free = self.free.lock();
            if free.len() < POOL_CAPACITY {
                free.push(stack);
                None
            } else {
                Some(stack)
            }
        };
        // Unmap outside the lock
        drop(overflow);
    }

    /// Stacks currently cached
    pub fn cached(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for StackPool {
    fn default() -> Self {
        Self::new()
    }
}
