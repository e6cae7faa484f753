//! Atomically replaced read-only view
//!
//! The owning thread publishes a fresh `Vec` wholesale; readers on other
//! threads load the latest `Arc` without ever touching the live structure.

use std::sync::Arc;

use arc_swap::ArcSwap;

pub struct Snapshot<T> {
    current: ArcSwap<Vec<T>>,
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Snapshot<T> {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Replace the published view.
    #[inline]
    pub fn publish(&self, items: Vec<T>) {
        self.current.store(Arc::new(items));
    }

    /// Latest published view. May be one publish behind the owner.
    #[inline]
    pub fn load(&self) -> Arc<Vec<T>> {
        self.current.load_full()
    }
}
