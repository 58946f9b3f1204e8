//! Go-like work-stealing ready queue
//!
//! Design:
//! - Per-carrier local queue (bounded, lock-free `ArrayQueue`)
//! - Global injector (unbounded, lock-free `SegQueue`)
//! - Global checked every 61 pops so local work cannot starve it
//! - Batch refill of the local queue from the global one
//! - Stealing half a random victim's local queue
//!
//! Only the first `locals` carriers own a local queue. Carriers beyond that
//! (compensation) work from the global queue and steal.

use super::ReadyQueue;
use crossbeam_queue::{ArrayQueue, SegQueue};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Check global every N pops (Go uses 61)
const GLOBAL_CHECK_INTERVAL: u32 = 61;

/// Victims tried per steal attempt at most
const STEAL_TRIES: usize = 4;

struct Local<T> {
    queue: ArrayQueue<T>,
    pops: AtomicU32,
    rng: AtomicUsize,
}

pub struct StealingQueue<T> {
    locals: Box<[Local<T>]>,
    global: SegQueue<T>,
    /// Victim selection state for carriers without a local queue
    shared_rng: AtomicUsize,
}

impl<T: Send> StealingQueue<T> {
    pub fn new(locals: usize, local_capacity: usize) -> Self {
        StealingQueue {
            locals: (0..locals)
                .map(|i| Local {
                    queue: ArrayQueue::new(local_capacity),
                    pops: AtomicU32::new(0),
                    rng: AtomicUsize::new(i.wrapping_mul(2654435761) + 1),
                })
                .collect(),
            global: SegQueue::new(),
            shared_rng: AtomicUsize::new(0x9e37_79b9),
        }
    }

    /// Number of carriers with a local queue
    #[inline]
    pub fn locals(&self) -> usize {
        self.locals.len()
    }

    /// Simple LCG for victim selection
    fn random_victim(&self, carrier: usize) -> usize {
        let rng = self.locals.get(carrier).map_or(&self.shared_rng, |l| &l.rng);
        let old = rng.load(Ordering::Relaxed);
        let new = old.wrapping_mul(1103515245).wrapping_add(12345);
        rng.store(new, Ordering::Relaxed);
        (new >> 16) % self.locals.len()
    }

    fn push_local_or_global(&self, carrier: usize, item: T) {
        match self.locals.get(carrier) {
            Some(local) => {
                if let Err(item) = local.queue.push(item) {
                    self.global.push(item);
                }
            }
            None => self.global.push(item),
        }
    }

    fn try_steal(&self, carrier: usize) -> Option<T> {
        if self.locals.is_empty() {
            return None;
        }
        for _ in 0..self.locals.len().min(STEAL_TRIES) {
            let mut victim = self.random_victim(carrier);
            if victim == carrier {
                victim = (victim + 1) % self.locals.len();
                if victim == carrier {
                    return None;
                }
            }
            let queue = &self.locals[victim].queue;
            let n = queue.len().div_ceil(2);
            let Some(first) = queue.pop() else {
                continue;
            };
            for _ in 1..n {
                match queue.pop() {
                    Some(item) => self.push_local_or_global(carrier, item),
                    None => break,
                }
            }
            return Some(first);
        }
        None
    }

    fn pop_global_with_refill(&self, carrier: usize) -> Option<T> {
        let first = self.global.pop()?;
        if let Some(local) = self.locals.get(carrier) {
            let batch = local.queue.capacity() / 2;
            for _ in 0..batch {
                let Some(item) = self.global.pop() else {
                    break;
                };
                if let Err(item) = local.queue.push(item) {
                    self.global.push(item);
                    break;
                }
            }
        }
        Some(first)
    }
}

impl<T: Send> ReadyQueue<T> for StealingQueue<T> {
    fn push(&self, item: T, hint_carrier: Option<usize>) {
        match hint_carrier {
            Some(carrier) => self.push_local_or_global(carrier, item),
            None => self.global.push(item),
        }
    }

    fn pop(&self, carrier: usize) -> Option<T> {
        if let Some(local) = self.locals.get(carrier) {
            let count = local.pops.fetch_add(1, Ordering::Relaxed);
            if count % GLOBAL_CHECK_INTERVAL == 0 {
                if let Some(item) = self.global.pop() {
                    return Some(item);
                }
            }
            if let Some(item) = local.queue.pop() {
                return Some(item);
            }
        }

        if let Some(item) = self.pop_global_with_refill(carrier) {
            return Some(item);
        }

        self.try_steal(carrier)
    }

    fn len(&self) -> usize {
        self.global.len() + self.locals.iter().map(|l| l.queue.len()).sum::<usize>()
    }
}
