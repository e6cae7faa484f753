//! Response writer: backpressure-controlled write path
//!
//! A [`ResponseWriter`] subscribes to a response producer and moves one
//! response at a time onto a [`ResponseTransport`]:
//!
//! ```text
//! subscribe -> writable -> request(1) -> on_next -> write -> completed -> request(1) ...
//! ```
//!
//! At most one write is in flight. The downstream [`CompletionObserver`]
//! hears exactly one terminal outcome; every signal after that is ignored.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, trace};

use super::flow::{CompletionObserver, ResponseProducer, Subscriber, Subscription};
use crate::error::{BoxError, TransportError, WriteError};

/// Callbacks from the socket layer to a writer
///
/// The transport never delivers two of these concurrently for one writer.
pub trait WriteEvents: Send + Sync {
    /// The socket can take another response.
    fn write_possible(&self);
    /// The last submitted response reached the socket.
    fn write_completed(&self);
    /// The socket layer failed or cancelled the write.
    fn write_failed(&self, error: TransportError);
}

/// Socket side of a response stream
pub trait ResponseTransport<T>: Send + Sync {
    /// Call `write_possible` once the socket can accept a write.
    fn notify_can_write(&self, events: Arc<dyn WriteEvents>);

    /// Write one response, then call `write_completed` or `write_failed`.
    fn write(&self, message: T, events: Arc<dyn WriteEvents>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unsubscribed,
    AwaitingWritable,
    AwaitingResponse,
    Writing,
    Terminated,
}

struct WriterState {
    phase: Phase,
    upstream: Option<Arc<dyn Subscription>>,
    downstream: Option<Box<dyn CompletionObserver>>,
    /// Producer finished while a write was in flight.
    completing: bool,
}

/// Outcome to deliver once the state lock is released
enum Terminal {
    Complete(Option<Box<dyn CompletionObserver>>),
    Failed(Option<Box<dyn CompletionObserver>>, WriteError),
}

impl Terminal {
    fn deliver(self) {
        match self {
            Terminal::Complete(Some(observer)) => observer.on_complete(),
            Terminal::Failed(Some(observer), error) => observer.on_error(error),
            Terminal::Complete(None) | Terminal::Failed(None, _) => {}
        }
    }
}

/// Streams responses from one producer to one transport
pub struct ResponseWriter<T> {
    transport: Arc<dyn ResponseTransport<T>>,
    this: Weak<ResponseWriter<T>>,
    state: Mutex<WriterState>,
}

impl<T: Send + 'static> ResponseWriter<T> {
    pub fn new(
        transport: Arc<dyn ResponseTransport<T>>,
        downstream: Box<dyn CompletionObserver>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            transport,
            this: this.clone(),
            state: Mutex::new(WriterState {
                phase: Phase::Unsubscribed,
                upstream: None,
                downstream: Some(downstream),
                completing: false,
            }),
        })
    }

    /// Stream everything `producer` emits to `transport`, then tell
    /// `downstream` how it ended.
    pub fn deliver(
        transport: Arc<dyn ResponseTransport<T>>,
        producer: Box<dyn ResponseProducer<T>>,
        downstream: Box<dyn CompletionObserver>,
    ) -> Arc<Self> {
        let writer = Self::new(transport, downstream);
        producer.subscribe(Arc::clone(&writer) as Arc<dyn Subscriber<T>>);
        writer
    }

    /// Whether the downstream observer has been notified.
    pub fn is_terminated(&self) -> bool {
        self.lock().phase == Phase::Terminated
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn events(&self) -> Option<Arc<dyn WriteEvents>> {
        self.this
            .upgrade()
            .map(|this| this as Arc<dyn WriteEvents>)
    }

    /// Ask the producer for exactly one response.
    fn request_one(&self, st: MutexGuard<'_, WriterState>) {
        let upstream = st.upstream.clone();
        drop(st);
        if let Some(upstream) = upstream {
            upstream.request(1);
        }
    }
}

impl WriterState {
    /// Move to `Terminated`, handing back the producer to cancel and the
    /// observer to notify. Both are `None` the second time around.
    fn terminate(&mut self) -> (Option<Arc<dyn Subscription>>, Option<Box<dyn CompletionObserver>>) {
        self.phase = Phase::Terminated;
        self.completing = false;
        (self.upstream.take(), self.downstream.take())
    }

    fn fail(&mut self, error: WriteError) -> (Option<Arc<dyn Subscription>>, Terminal) {
        let (upstream, downstream) = self.terminate();
        (upstream, Terminal::Failed(downstream, error))
    }

    fn complete(&mut self) -> (Option<Arc<dyn Subscription>>, Terminal) {
        let (upstream, downstream) = self.terminate();
        (upstream, Terminal::Complete(downstream))
    }
}

fn cancel_and_deliver(upstream: Option<Arc<dyn Subscription>>, terminal: Terminal) {
    if let Some(upstream) = upstream {
        upstream.cancel();
    }
    terminal.deliver();
}

impl<T: Send + 'static> Subscriber<T> for ResponseWriter<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let mut st = self.lock();
        if st.phase != Phase::Unsubscribed {
            drop(st);
            debug!("rejecting second response producer");
            subscription.cancel();
            return;
        }
        st.upstream = Some(subscription);
        st.phase = Phase::AwaitingWritable;
        drop(st);

        if let Some(events) = self.events() {
            self.transport.notify_can_write(events);
        }
    }

    fn on_next(&self, message: T) {
        let mut st = self.lock();
        match st.phase {
            Phase::AwaitingResponse => {
                st.phase = Phase::Writing;
                drop(st);
                trace!("writing response");
                if let Some(events) = self.events() {
                    self.transport.write(message, events);
                }
            }
            // Late emission after a terminal outcome.
            Phase::Terminated => {}
            _ => {
                let (upstream, terminal) = st.fail(WriteError::DemandExceeded);
                drop(st);
                debug!("response producer emitted without demand");
                cancel_and_deliver(upstream, terminal);
            }
        }
    }

    fn on_error(&self, error: BoxError) {
        let mut st = self.lock();
        if st.phase == Phase::Terminated {
            return;
        }
        let (_, terminal) = st.fail(WriteError::Producer(error));
        drop(st);
        debug!("response producer failed");
        terminal.deliver();
    }

    fn on_complete(&self) {
        let mut st = self.lock();
        match st.phase {
            Phase::Terminated => {}
            // Let the in-flight write decide the outcome.
            Phase::Writing => st.completing = true,
            _ => {
                let (upstream, terminal) = st.complete();
                drop(st);
                cancel_and_deliver(upstream, terminal);
            }
        }
    }
}

impl<T: Send + 'static> WriteEvents for ResponseWriter<T> {
    fn write_possible(&self) {
        let mut st = self.lock();
        if st.phase != Phase::AwaitingWritable {
            return;
        }
        st.phase = Phase::AwaitingResponse;
        self.request_one(st);
    }

    fn write_completed(&self) {
        let mut st = self.lock();
        if st.phase != Phase::Writing {
            trace!(phase = ?st.phase, "ignoring write completion");
            return;
        }
        if st.completing {
            let (upstream, terminal) = st.complete();
            drop(st);
            cancel_and_deliver(upstream, terminal);
            return;
        }
        st.phase = Phase::AwaitingResponse;
        self.request_one(st);
    }

    fn write_failed(&self, error: TransportError) {
        let mut st = self.lock();
        if st.phase == Phase::Terminated {
            trace!(%error, "ignoring failure after terminal outcome");
            return;
        }
        let (upstream, terminal) = st.fail(WriteError::Transport(error));
        drop(st);
        debug!("response write failed");
        cancel_and_deliver(upstream, terminal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::flow::IterProducer;

    /// Transport that holds writes until the test completes them.
    #[derive(Default)]
    struct Manual {
        writes: Mutex<Vec<u32>>,
        events: Mutex<Option<Arc<dyn WriteEvents>>>,
    }

    impl ResponseTransport<u32> for Manual {
        fn notify_can_write(&self, events: Arc<dyn WriteEvents>) {
            *self.events.lock().unwrap() = Some(events);
        }

        fn write(&self, message: u32, events: Arc<dyn WriteEvents>) {
            self.writes.lock().unwrap().push(message);
            *self.events.lock().unwrap() = Some(events);
        }
    }

    impl Manual {
        fn events(&self) -> Arc<dyn WriteEvents> {
            self.events.lock().unwrap().clone().unwrap()
        }
    }

    fn outcome() -> (Box<dyn CompletionObserver>, Arc<Mutex<Vec<Result<(), String>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer: Box<dyn CompletionObserver> = Box::new(move |r: Result<(), WriteError>| {
            sink.lock().unwrap().push(r.map_err(|e| e.to_string()));
        });
        (observer, seen)
    }

    fn items(n: u32) -> Box<dyn ResponseProducer<u32>> {
        Box::new(IterProducer::new((0..n).map(Ok::<_, BoxError>)))
    }

    #[test]
    fn test_nothing_requested_before_writable() {
        let transport = Arc::new(Manual::default());
        let (observer, seen) = outcome();
        ResponseWriter::<u32>::deliver(transport.clone(), items(3), observer);

        assert!(transport.writes.lock().unwrap().is_empty());
        transport.events().write_possible();
        assert_eq!(*transport.writes.lock().unwrap(), [0]);
        // Writable again before the write completed: still one in flight.
        transport.events().write_possible();
        assert_eq!(*transport.writes.lock().unwrap(), [0]);

        transport.events().write_completed();
        assert_eq!(*transport.writes.lock().unwrap(), [0, 1]);
        transport.events().write_completed();
        assert_eq!(*transport.writes.lock().unwrap(), [0, 1, 2]);
        assert!(seen.lock().unwrap().is_empty());

        // The producer runs dry on the next request.
        transport.events().write_completed();
        assert_eq!(*seen.lock().unwrap(), [Ok::<(), String>(())]);
    }

    #[test]
    fn test_failure_is_reported_once() {
        let transport = Arc::new(Manual::default());
        let (observer, seen) = outcome();
        let writer = ResponseWriter::<u32>::deliver(transport.clone(), items(5), observer);

        transport.events().write_possible();
        transport.events().write_failed(TransportError::Cancelled);
        transport.events().write_failed(TransportError::Closed);
        transport.events().write_completed();
        transport.events().write_possible();

        assert!(writer.is_terminated());
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(seen.lock().unwrap()[0].is_err());
        assert_eq!(transport.writes.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_producer_completes_without_writes() {
        let transport = Arc::new(Manual::default());
        let (observer, seen) = outcome();
        ResponseWriter::<u32>::deliver(transport.clone(), items(0), observer);

        transport.events().write_possible();
        assert!(transport.writes.lock().unwrap().is_empty());
        assert_eq!(*seen.lock().unwrap(), [Ok::<(), String>(())]);
    }
}
