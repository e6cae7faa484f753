//! Process-wide shutdown
//!
//! Components that own threads register as [`ShutdownListener`]s. A single
//! `shutdown` call notifies each of them once, in registration order;
//! `await_termination` then waits for all of them.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

/// Something that must stop when the server stops
pub trait ShutdownListener: Send + Sync {
    fn listener_name(&self) -> &str;

    /// Begin stopping. Must not block.
    fn process_shutdown(&self, reason: &str);

    /// Block until stopped.
    fn await_termination(&self) {}
}

/// Fans a shutdown request out to every registered listener
#[derive(Default)]
pub struct ShutdownCoordinator {
    listeners: Mutex<Vec<Arc<dyn ShutdownListener>>>,
    requested: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Arc<dyn ShutdownListener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a listener.
    ///
    /// A listener registered after shutdown began is told to stop right away
    /// and `false` is returned.
    pub fn register(&self, listener: Arc<dyn ShutdownListener>) -> bool {
        {
            let mut listeners = self.listeners();
            if !self.requested.load(Ordering::Acquire) {
                listeners.push(listener);
                return true;
            }
        }
        notify(&*listener, "registered after shutdown");
        false
    }

    #[inline]
    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Notify every listener. Only the first call has any effect.
    pub fn shutdown(&self, reason: &str) {
        let listeners = {
            let listeners = self.listeners();
            if self.requested.swap(true, Ordering::AcqRel) {
                return;
            }
            listeners.clone()
        };

        info!(reason, listeners = listeners.len(), "shutting down");
        for listener in &listeners {
            notify(&**listener, reason);
        }
    }

    /// Wait for every listener to finish.
    pub fn await_termination(&self) {
        let listeners = self.listeners().clone();
        for listener in listeners {
            debug!(listener = listener.listener_name(), "awaiting termination");
            let result = panic::catch_unwind(AssertUnwindSafe(|| listener.await_termination()));
            if result.is_err() {
                warn!(listener = listener.listener_name(), "listener panicked while terminating");
            }
        }
    }
}

fn notify(listener: &dyn ShutdownListener, reason: &str) {
    debug!(listener = listener.listener_name(), "notifying shutdown listener");
    if panic::catch_unwind(AssertUnwindSafe(|| listener.process_shutdown(reason))).is_err() {
        warn!(listener = listener.listener_name(), "listener panicked during shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        name: String,
        notified: AtomicUsize,
        awaited: AtomicUsize,
        panics: bool,
    }

    impl Counter {
        fn new(name: &str, panics: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_owned(),
                notified: AtomicUsize::new(0),
                awaited: AtomicUsize::new(0),
                panics,
            })
        }
    }

    impl ShutdownListener for Counter {
        fn listener_name(&self) -> &str {
            &self.name
        }

        fn process_shutdown(&self, _: &str) {
            self.notified.fetch_add(1, Ordering::SeqCst);
            if self.panics {
                panic!("listener failure");
            }
        }

        fn await_termination(&self) {
            self.awaited.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let coordinator = ShutdownCoordinator::new();
        let a = Counter::new("a", false);
        assert!(coordinator.register(a.clone()));

        coordinator.shutdown("first");
        coordinator.shutdown("second");
        coordinator.await_termination();

        assert_eq!(a.notified.load(Ordering::SeqCst), 1);
        assert_eq!(a.awaited.load(Ordering::SeqCst), 1);
        assert!(coordinator.is_shutdown_requested());
    }

    #[test]
    fn test_panicking_listener_does_not_stop_the_rest() {
        let coordinator = ShutdownCoordinator::new();
        let bad = Counter::new("bad", true);
        let good = Counter::new("good", false);
        coordinator.register(bad.clone());
        coordinator.register(good.clone());

        coordinator.shutdown("test");
        assert_eq!(bad.notified.load(Ordering::SeqCst), 1);
        assert_eq!(good.notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_listener_is_stopped_immediately() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.shutdown("test");

        let late = Counter::new("late", false);
        assert!(!coordinator.register(late.clone()));
        assert_eq!(late.notified.load(Ordering::SeqCst), 1);
    }
}
