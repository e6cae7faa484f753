//! Socket response transport
//!
//! [`SocketTransport`] writes encoded responses straight to a non-blocking
//! socket. Bytes the kernel will not take yet are parked, and a
//! [`WriteSelector`] thread (its own `mio::Poll`, writable interest)
//! flushes them when the socket drains. A write completes only once its
//! last byte reached the kernel.
//!
//! The read side registers the same descriptor in its own poller; the two
//! registrations are independent.

use std::collections::HashMap;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use super::connection::ClientConnection;
use super::shutdown::ShutdownListener;
use super::writer::{ResponseTransport, WriteEvents};
use crate::config::WriterConfig;
use crate::error::{HandlerError, TransportError};
use crate::protocol::ResponseEncoder;

const WAKER_TOKEN: Token = Token(0);

/// Result of pushing buffered bytes at the socket
enum Flush {
    Done,
    Blocked,
}

#[derive(Default)]
struct OutboundState {
    buffer: Vec<u8>,
    offset: usize,
    /// Write waiting for the socket to drain.
    parked: Option<Arc<dyn WriteEvents>>,
    /// Writer waiting for `write_possible`.
    waiting: Option<Arc<dyn WriteEvents>>,
    closed: bool,
}

impl OutboundState {
    /// Write until done or the kernel buffer is full.
    fn flush(&mut self, mut socket: &std::net::TcpStream) -> io::Result<Flush> {
        while self.offset < self.buffer.len() {
            match socket.write(&self.buffer[self.offset..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Blocked),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.buffer.clear();
        self.offset = 0;
        Ok(Flush::Done)
    }

    /// Close and hand back whoever still waits for a callback.
    fn close(&mut self) -> [Option<Arc<dyn WriteEvents>>; 2] {
        self.closed = true;
        self.buffer.clear();
        self.offset = 0;
        [self.parked.take(), self.waiting.take()]
    }
}

/// Per-socket write state shared with the selector thread
struct Outbound {
    token: Token,
    client: Arc<ClientConnection>,
    state: Mutex<OutboundState>,
}

impl Outbound {
    fn lock(&self) -> MutexGuard<'_, OutboundState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Selector reported the socket writable (or broken).
    fn on_writable(&self) {
        let mut st = self.lock();
        if st.closed {
            return;
        }

        if let Some(events) = st.parked.take() {
            match st.flush(self.client.socket()) {
                Ok(Flush::Blocked) => {
                    st.parked = Some(events);
                }
                Ok(Flush::Done) => {
                    // The socket drained on this edge; a waiter may never see another.
                    let waiting = st.waiting.take();
                    drop(st);
                    trace!(conn_id = self.client.id(), "parked write flushed");
                    events.write_completed();
                    if let Some(waiting) = waiting {
                        waiting.write_possible();
                    }
                }
                Err(e) => {
                    let waiting = st.close();
                    drop(st);
                    debug!(conn_id = self.client.id(), error = %e, "parked write failed");
                    events.write_failed(TransportError::Io(e));
                    fail_all(waiting, || TransportError::Closed);
                }
            }
            return;
        }

        if let Some(events) = st.waiting.take() {
            drop(st);
            events.write_possible();
        }
    }

    fn fail(&self, error: impl Fn() -> TransportError) {
        let waiting = self.lock().close();
        fail_all(waiting, error);
    }
}

fn fail_all(waiting: [Option<Arc<dyn WriteEvents>>; 2], error: impl Fn() -> TransportError) {
    for events in waiting.into_iter().flatten() {
        events.write_failed(error());
    }
}

/// State shared between the selector thread and its transports
struct SelectorShared {
    name: String,
    registry: Registry,
    waker: Waker,
    outbound: Mutex<HashMap<Token, Weak<Outbound>>>,
    next_token: AtomicUsize,
    shutdown_requested: AtomicBool,
}

impl SelectorShared {
    fn outbound(&self) -> MutexGuard<'_, HashMap<Token, Weak<Outbound>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }
}

/// Write-readiness thread shared by many socket transports
pub struct WriteSelector {
    shared: Arc<SelectorShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WriteSelector {
    pub fn start(name: impl Into<String>, config: WriterConfig) -> Result<Self, HandlerError> {
        let name = name.into();
        let poll = match Poll::new() {
            Ok(poll) => poll,
            Err(source) => return Err(HandlerError::SelectorOpen { name, source }),
        };
        let registry = match poll.registry().try_clone() {
            Ok(registry) => registry,
            Err(source) => return Err(HandlerError::SelectorOpen { name, source }),
        };
        let waker = match Waker::new(poll.registry(), WAKER_TOKEN) {
            Ok(waker) => waker,
            Err(source) => return Err(HandlerError::SelectorOpen { name, source }),
        };

        let shared = Arc::new(SelectorShared {
            name,
            registry,
            waker,
            outbound: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(1),
            shutdown_requested: AtomicBool::new(false),
        });

        let loop_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(shared.name.clone())
            .spawn(move || run(loop_shared, poll, config))
            .map_err(|source| HandlerError::Spawn {
                name: shared.name.clone(),
                source,
            })?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Stop the thread and fail every write still waiting on it.
    pub fn request_shutdown(&self) {
        if !self.shared.shutdown_requested.swap(true, Ordering::AcqRel) {
            debug!(selector = %self.shared.name, "shutdown requested");
        }
        if let Err(e) = self.shared.waker.wake() {
            warn!(selector = %self.shared.name, error = %e, "failed to wake selector");
        }
    }

    pub fn join(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(selector = %self.shared.name, "write selector thread panicked");
            }
        }
    }
}

impl ShutdownListener for WriteSelector {
    fn listener_name(&self) -> &str {
        self.name()
    }

    fn process_shutdown(&self, reason: &str) {
        info!(selector = %self.shared.name, reason, "stopping write selector");
        self.request_shutdown();
    }

    fn await_termination(&self) {
        self.join();
    }
}

impl Drop for WriteSelector {
    fn drop(&mut self) {
        self.request_shutdown();
        self.join();
    }
}

fn run(shared: Arc<SelectorShared>, mut poll: Poll, config: WriterConfig) {
    let mut events = Events::with_capacity(config.events_capacity);
    info!(selector = %shared.name, "write selector started");

    while !shared.is_shutdown_requested() {
        if let Err(e) = poll.poll(&mut events, Some(config.poll_timeout)) {
            if e.kind() != io::ErrorKind::Interrupted {
                error!(selector = %shared.name, error = %e, "selector poll failed");
            }
            continue;
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            let outbound = shared.outbound().get(&token).and_then(Weak::upgrade);
            match outbound {
                Some(outbound) => outbound.on_writable(),
                None => trace!(selector = %shared.name, ?token, "event for dropped transport"),
            }
        }
    }

    let remaining: Vec<Arc<Outbound>> = shared
        .outbound()
        .drain()
        .filter_map(|(_, weak)| weak.upgrade())
        .collect();
    for outbound in remaining {
        outbound.fail(|| TransportError::Cancelled);
    }
    info!(selector = %shared.name, "write selector stopped");
}

/// Response transport over one client socket
pub struct SocketTransport<T, E> {
    outbound: Arc<Outbound>,
    selector: Arc<SelectorShared>,
    encoder: E,
    _message: PhantomData<fn(T)>,
}

impl<T, E: ResponseEncoder<T>> SocketTransport<T, E> {
    /// Register `client`'s socket with `selector` for writability.
    pub fn new(
        selector: &WriteSelector,
        client: &Arc<ClientConnection>,
        encoder: E,
    ) -> Result<Self, TransportError> {
        let shared = Arc::clone(&selector.shared);
        if shared.is_shutdown_requested() {
            return Err(TransportError::Cancelled);
        }

        let token = Token(shared.next_token.fetch_add(1, Ordering::Relaxed));
        let fd = client.socket().as_raw_fd();
        shared
            .registry
            .register(&mut SourceFd(&fd), token, Interest::WRITABLE)?;

        let outbound = Arc::new(Outbound {
            token,
            client: Arc::clone(client),
            state: Mutex::new(OutboundState::default()),
        });
        shared.outbound().insert(token, Arc::downgrade(&outbound));

        let transport = Self {
            outbound,
            selector: shared,
            encoder,
            _message: PhantomData,
        };
        // Raced with the selector's final drain.
        if transport.selector.is_shutdown_requested() {
            return Err(TransportError::Cancelled);
        }
        Ok(transport)
    }

    pub fn client(&self) -> &Arc<ClientConnection> {
        &self.outbound.client
    }
}

impl<T, E> ResponseTransport<T> for SocketTransport<T, E>
where
    E: ResponseEncoder<T>,
{
    fn notify_can_write(&self, events: Arc<dyn WriteEvents>) {
        let mut st = self.outbound.lock();
        if st.closed || !self.outbound.client.is_connected() {
            drop(st);
            events.write_failed(TransportError::Closed);
            return;
        }
        if st.parked.is_some() {
            st.waiting = Some(events);
            return;
        }
        drop(st);
        events.write_possible();
    }

    fn write(&self, message: T, events: Arc<dyn WriteEvents>) {
        let mut bytes = Vec::new();
        self.encoder.encode(&message, &mut bytes);

        let mut st = self.outbound.lock();
        if st.closed || !self.outbound.client.is_connected() {
            drop(st);
            events.write_failed(TransportError::Closed);
            return;
        }
        if st.parked.is_some() {
            drop(st);
            events.write_failed(TransportError::Busy);
            return;
        }

        st.buffer = bytes;
        st.offset = 0;
        match st.flush(self.outbound.client.socket()) {
            Ok(Flush::Done) => {
                drop(st);
                events.write_completed();
            }
            Ok(Flush::Blocked) => {
                trace!(
                    conn_id = self.outbound.client.id(),
                    pending = st.buffer.len() - st.offset,
                    "write parked until socket drains"
                );
                st.parked = Some(events);
            }
            Err(e) => {
                let waiting = st.close();
                drop(st);
                debug!(conn_id = self.outbound.client.id(), error = %e, "write failed");
                events.write_failed(TransportError::Io(e));
                fail_all(waiting, || TransportError::Closed);
            }
        }
    }
}

impl<T, E> Drop for SocketTransport<T, E> {
    fn drop(&mut self) {
        let token = self.outbound.token;
        self.selector.outbound().remove(&token);
        let fd: RawFd = self.outbound.client.socket().as_raw_fd();
        if let Err(e) = self.selector.registry.deregister(&mut SourceFd(&fd)) {
            trace!(selector = %self.selector.name, ?token, error = %e, "deregister failed");
        }
        self.outbound.fail(|| TransportError::Closed);
    }
}
