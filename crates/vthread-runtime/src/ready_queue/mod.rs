//! Ready queue abstraction for virtual thread scheduling
//!
//! # Implementations
//! - `StealingQueue` - per-carrier bounded local queues, a global injector,
//!   random-victim work stealing

mod stealing;

pub use stealing::StealingQueue;

/// Thread-safe queue of runnable items
///
/// Pops are always made by a carrier, identified by its index.
pub trait ReadyQueue<T>: Send + Sync {
    /// Make an item runnable
    ///
    /// `hint_carrier` names the carrier whose local queue should receive it;
    /// `None` (or a full local queue) goes to the global queue.
    fn push(&self, item: T, hint_carrier: Option<usize>);

    /// Next item for `carrier`
    ///
    /// Order: periodic global check, local, global with batch refill, steal.
    fn pop(&self, carrier: usize) -> Option<T>;

    /// Approximate number of queued items
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
