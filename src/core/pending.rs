//! Lock-guarded handoff queue
//!
//! The only structure touched by more than one thread: acceptor threads
//! push, the owning event loop drains. Draining swaps the whole `Vec` out
//! so the lock is held for a pointer swap, never for per-item work.
//!
//! Closing the queue happens under the same lock as pushing, so an item is
//! either drained by the owner or handed back to the producer, never lost.

use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub struct PendingQueue<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    items: Vec<T>,
    closed: bool,
}

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: Vec::new(),
                closed: false,
            }),
        }
    }

    /// A panic in another holder must not wedge the queue, so poisoning is
    /// ignored; the `Vec` itself is never left half-updated.
    #[inline]
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `item`, or hand it back if the queue was closed.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut guard = self.lock();
        if guard.closed {
            return Err(item);
        }
        guard.items.push(item);
        Ok(())
    }

    /// Take everything queued so far, in arrival order.
    #[inline]
    pub fn take_all(&self) -> Vec<T> {
        let mut guard = self.lock();
        if guard.items.is_empty() {
            return Vec::new();
        }
        mem::take(&mut guard.items)
    }

    /// Refuse further pushes and take what is left.
    pub fn close(&self) -> Vec<T> {
        let mut guard = self.lock();
        guard.closed = true;
        mem::take(&mut guard.items)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}
