//! Pull-based flow control
//!
//! A consumer holds a cancellable [`Subscription`] and receives at most as
//! many items as it has requested. Producers deliver through the
//! [`Subscriber`] they were given, from whatever thread they like, and
//! finish with exactly one of `on_complete` / `on_error`.
//!
//! All methods take `&self`: both sides may call into each other
//! re-entrantly (a consumer requesting from inside `on_next`), so neither
//! side may hold a lock across a call to the other.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{BoxError, WriteError};

/// Demand handle held by a consumer
pub trait Subscription: Send + Sync {
    /// Grant `n` more items.
    fn request(&self, n: u64);
    /// Stop emitting. Idempotent.
    fn cancel(&self);
}

/// Consumer side of a response stream
pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);
    fn on_next(&self, item: T);
    fn on_error(&self, error: BoxError);
    fn on_complete(&self);
}

/// Source of response messages
pub trait ResponseProducer<T>: Send {
    fn subscribe(self: Box<Self>, subscriber: Arc<dyn Subscriber<T>>);
}

/// Receives the single terminal outcome of a response stream
///
/// Consuming `self` makes a second notification unrepresentable.
pub trait CompletionObserver: Send {
    fn on_complete(self: Box<Self>);
    fn on_error(self: Box<Self>, error: WriteError);
}

impl<F> CompletionObserver for F
where
    F: FnOnce(Result<(), WriteError>) + Send,
{
    fn on_complete(self: Box<Self>) {
        (*self)(Ok(()))
    }

    fn on_error(self: Box<Self>, error: WriteError) {
        (*self)(Err(error))
    }
}

/// Producer over an iterator of results
///
/// Emits exactly the granted demand. A `request` made from inside
/// `on_next` only raises the demand; the outer emit loop delivers it, so a
/// synchronous consumer does not grow the stack per item.
pub struct IterProducer<I> {
    iter: I,
}

impl<I> IterProducer<I> {
    pub fn new(iter: I) -> Self {
        Self { iter }
    }
}

impl<T, E, I> ResponseProducer<T> for IterProducer<I>
where
    T: Send + 'static,
    E: Into<BoxError>,
    I: Iterator<Item = Result<T, E>> + Send + 'static,
{
    fn subscribe(self: Box<Self>, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = Arc::new(IterSubscription {
            state: Mutex::new(IterState {
                iter: Some(self.iter),
                subscriber: Some(Arc::clone(&subscriber)),
                demand: 0,
                emitting: false,
            }),
        });
        subscriber.on_subscribe(subscription);
    }
}

struct IterState<T, I> {
    iter: Option<I>,
    subscriber: Option<Arc<dyn Subscriber<T>>>,
    demand: u64,
    emitting: bool,
}

impl<T, I> IterState<T, I> {
    /// Terminal: drop the iterator and the subscriber reference.
    fn finish(&mut self) -> Option<Arc<dyn Subscriber<T>>> {
        self.iter = None;
        self.emitting = false;
        self.subscriber.take()
    }
}

struct IterSubscription<T, I> {
    state: Mutex<IterState<T, I>>,
}

impl<T, I> IterSubscription<T, I> {
    fn lock(&self) -> MutexGuard<'_, IterState<T, I>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T, E, I> Subscription for IterSubscription<T, I>
where
    T: Send + 'static,
    E: Into<BoxError>,
    I: Iterator<Item = Result<T, E>> + Send + 'static,
{
    fn request(&self, n: u64) {
        let mut st = self.lock();
        if n == 0 || st.subscriber.is_none() {
            return;
        }
        st.demand = st.demand.saturating_add(n);
        if st.emitting {
            return;
        }
        st.emitting = true;

        loop {
            if st.demand == 0 {
                st.emitting = false;
                return;
            }
            let (next, subscriber) = {
                let state = &mut *st;
                match (state.iter.as_mut(), state.subscriber.clone()) {
                    (Some(iter), Some(subscriber)) => (iter.next(), subscriber),
                    _ => {
                        // Cancelled from inside on_next.
                        state.emitting = false;
                        return;
                    }
                }
            };

            match next {
                Some(Ok(item)) => {
                    st.demand -= 1;
                    drop(st);
                    subscriber.on_next(item);
                    st = self.lock();
                }
                Some(Err(e)) => {
                    st.finish();
                    drop(st);
                    subscriber.on_error(e.into());
                    return;
                }
                None => {
                    st.finish();
                    drop(st);
                    subscriber.on_complete();
                    return;
                }
            }
        }
    }

    fn cancel(&self) {
        self.lock().finish();
    }
}
