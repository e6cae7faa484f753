//! Request handler: the read-side event loop
//!
//! One thread per handler owns a `mio::Poll`, the registered connections
//! and the ready queue. Other threads reach it only through the
//! pending-registration queue and the waker.
//!
//! Each iteration:
//! 1. drain the ready queue, dispatching at most one message per
//!    connection per visit and re-appending connections that still hold a
//!    complete message (round-robin over pipelined bursts)
//! 2. register pending connections
//! 3. publish the registration snapshot
//! 4. poll with a bounded timeout
//! 5. read from readable sockets and queue them for step 1
//!
//! Connection faults end in a disconnect, never in a loop exit. That covers
//! panics from user code run on the loop thread: message processors and
//! disconnect sinks alike.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use super::connection::{ClientConnection, Connection, DisconnectReason, ReadOutcome};
use super::shutdown::ShutdownListener;
use crate::config::HandlerConfig;
use crate::core::{PendingQueue, Snapshot};
use crate::error::HandlerError;
use crate::protocol::{DecodeError, MessageDecoder};

const WAKER_TOKEN: Token = Token(0);
const FIRST_CLIENT_TOKEN: usize = 1;

/// State shared between the loop thread and everyone else
struct Shared<D: MessageDecoder> {
    name: String,
    shutdown_requested: AtomicBool,
    pending: PendingQueue<Connection<D>>,
    waker: Waker,
    keys: Snapshot<Arc<ClientConnection>>,
}

impl<D: MessageDecoder> Shared<D> {
    #[inline]
    fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(handler = %self.name, error = %e, "failed to wake selector");
        }
    }

    fn register_client(&self, conn: Connection<D>) -> bool {
        let conn = if self.is_shutdown_requested() {
            conn
        } else {
            match self.pending.push(conn) {
                Ok(()) => {
                    self.wake();
                    return true;
                }
                Err(conn) => conn,
            }
        };

        conn.client().disconnect(
            DisconnectReason::ServerShutdown,
            format!("{}: connection rejected, server is shutting down", self.name),
        );
        false
    }

    fn request_shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::AcqRel) {
            debug!(handler = %self.name, "shutdown requested");
        }
        self.wake();
    }
}

/// Handle to a running request handler
///
/// Dropping the handle shuts the loop down and waits for it.
pub struct RequestHandler<D: MessageDecoder> {
    shared: Arc<Shared<D>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<D: MessageDecoder> RequestHandler<D> {
    /// Open a selector and start the loop on a dedicated thread named `name`.
    pub fn start(name: impl Into<String>, config: HandlerConfig) -> Result<Self, HandlerError> {
        let event_loop = EventLoop::open(name.into(), config)?;
        let shared = Arc::clone(&event_loop.shared);

        let thread = thread::Builder::new()
            .name(shared.name.clone())
            .spawn(move || event_loop.run())
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

    /// Hand a connection to this handler.
    ///
    /// Returns `false`, after disconnecting it with a shutdown reason, if the
    /// handler is shutting down. Otherwise the connection is registered with
    /// the selector before the next poll completes.
    pub fn register_client(&self, conn: Connection<D>) -> bool {
        self.shared.register_client(conn)
    }

    /// Connections registered as of the last loop iteration.
    pub fn client_connections(&self) -> Vec<Arc<ClientConnection>> {
        self.shared.keys.load().iter().cloned().collect()
    }

    /// Stop the loop. Idempotent; does not wait.
    pub fn request_shutdown(&self) {
        self.shared.request_shutdown();
    }

    #[inline]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shared.is_shutdown_requested()
    }

    /// Wait for the loop thread to finish its shutdown drain.
    pub fn join(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(handler = %self.shared.name, "request handler thread panicked");
            }
        }
    }
}

impl<D: MessageDecoder> ShutdownListener for RequestHandler<D> {
    fn listener_name(&self) -> &str {
        self.name()
    }

    fn process_shutdown(&self, reason: &str) {
        info!(handler = %self.shared.name, reason, "stopping request handler");
        self.request_shutdown();
    }

    fn await_termination(&self) {
        self.join();
    }
}

impl<D: MessageDecoder> Drop for RequestHandler<D> {
    fn drop(&mut self) {
        self.request_shutdown();
        self.join();
    }
}

/// Why a connection's turn in the ready queue ended
#[derive(Debug, PartialEq, Eq)]
enum Turn {
    /// Still registered, waiting for more bytes or for the processor.
    Idle,
    /// Another complete message is buffered; visit again this pass.
    Requeue,
    /// Disconnected during the turn.
    Closed,
}

/// Fault that ends a connection during a turn
enum TurnError {
    Decode(DecodeError),
    Overflow(usize),
    Panicked(String),
}

impl From<DecodeError> for TurnError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// Loop-thread state
struct EventLoop<D: MessageDecoder> {
    shared: Arc<Shared<D>>,
    config: HandlerConfig,
    poll: Poll,
    events: Events,
    connections: HashMap<Token, Connection<D>>,
    ready: VecDeque<Token>,
    next_token: usize,
}

impl<D: MessageDecoder> EventLoop<D> {
    fn open(name: String, config: HandlerConfig) -> Result<Self, HandlerError> {
        let mut poll = match Poll::new() {
            Ok(poll) => poll,
            Err(source) => return Err(HandlerError::SelectorOpen { name, source }),
        };

        // A poller that fails a zero-timeout poll will fail every poll;
        // refuse to start rather than spin on it.
        let mut probe = Events::with_capacity(1);
        if let Err(source) = poll.poll(&mut probe, Some(std::time::Duration::ZERO)) {
            return Err(HandlerError::SelectorProbe { name, source });
        }

        let waker = match Waker::new(poll.registry(), WAKER_TOKEN) {
            Ok(waker) => waker,
            Err(source) => return Err(HandlerError::SelectorOpen { name, source }),
        };

        Ok(Self {
            shared: Arc::new(Shared {
                name,
                shutdown_requested: AtomicBool::new(false),
                pending: PendingQueue::new(),
                waker,
                keys: Snapshot::new(),
            }),
            events: Events::with_capacity(config.events_capacity),
            config,
            poll,
            connections: HashMap::new(),
            ready: VecDeque::new(),
            next_token: FIRST_CLIENT_TOKEN,
        })
    }

    fn run(mut self) {
        info!(handler = %self.shared.name, "request handler started");

        while !self.shared.is_shutdown_requested() {
            self.process_ready_connections();
            self.register_pending_connections();
            self.publish_client_connections();
            if !self.select() {
                break;
            }
            self.process_selected();
        }

        self.disconnect_all();
        info!(handler = %self.shared.name, "request handler stopped");
    }

    /// Step 1: give every ready connection its turn.
    fn process_ready_connections(&mut self) {
        let high_water = self.config.max_buffered_bytes;

        while let Some(token) = self.ready.pop_front() {
            let Some(conn) = self.connections.get_mut(&token) else {
                continue;
            };

            let turn = panic::catch_unwind(AssertUnwindSafe(|| take_turn(conn, high_water)))
                .unwrap_or_else(|payload| Err(TurnError::Panicked(panic_message(payload))));
            match turn {
                Ok(Turn::Idle) => {}
                Ok(Turn::Requeue) => self.ready.push_back(token),
                Ok(Turn::Closed) => self.cancel(token),
                Err(fault) => {
                    let (reason, cause) = match fault {
                        TurnError::Decode(e) => (DisconnectReason::ProtocolError, e.to_string()),
                        TurnError::Overflow(n) => (
                            DisconnectReason::ProtocolError,
                            format!("{n} buffered bytes without a complete message"),
                        ),
                        TurnError::Panicked(msg) => (
                            DisconnectReason::ServerError,
                            format!("unexpected failure while processing request: {msg}"),
                        ),
                    };
                    debug!(handler = %self.shared.name, conn_id = conn.client().id(), %reason, cause = %cause, "dropping connection");
                    guarded_disconnect(&self.shared.name, conn.client(), reason, &cause);
                    self.cancel(token);
                }
            }
        }
    }

    /// Step 2: move pending connections into the selector.
    fn register_pending_connections(&mut self) {
        for mut conn in self.shared.pending.take_all() {
            let token = Token(self.next_token);
            self.next_token += 1;

            let fd = conn.raw_fd();
            let registered = conn.prepare(&self.config).and_then(|()| {
                self.poll
                    .registry()
                    .register(&mut SourceFd(&fd), token, Interest::READABLE)
            });

            match registered {
                Ok(()) => {
                    info!(
                        handler = %self.shared.name,
                        conn_id = conn.client().id(),
                        peer = ?conn.client().peer_addr(),
                        "connection registered"
                    );
                    self.connections.insert(token, conn);
                }
                Err(e) => {
                    warn!(handler = %self.shared.name, conn_id = conn.client().id(), error = %e, "cannot register connection");
                    guarded_disconnect(
                        &self.shared.name,
                        conn.client(),
                        DisconnectReason::ServerError,
                        &format!("{}: cannot register connection: {e}", self.shared.name),
                    );
                }
            }
        }
    }

    /// Step 3: prune connections closed elsewhere, then publish the rest.
    fn publish_client_connections(&mut self) {
        let stale: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| !conn.client().is_connected())
            .map(|(token, _)| *token)
            .collect();
        for token in stale {
            self.cancel(token);
        }

        self.shared.keys.publish(
            self.connections
                .values()
                .map(|conn| Arc::clone(conn.client()))
                .collect(),
        );
    }

    /// Step 4: bounded poll. Returns `false` if shutdown arrived meanwhile.
    fn select(&mut self) -> bool {
        match self.poll.poll(&mut self.events, Some(self.config.poll_timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => self.events.clear(),
            Err(e) => {
                error!(handler = %self.shared.name, error = %e, "selector poll failed");
                self.events.clear();
            }
        }
        !self.shared.is_shutdown_requested()
    }

    /// Step 5: read from every reported socket.
    fn process_selected(&mut self) {
        let high_water = self.config.max_buffered_bytes;
        let registry = self.poll.registry();

        for event in self.events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            // Closed between poll return and now.
            let Some(conn) = self.connections.get_mut(&token) else {
                trace!(handler = %self.shared.name, ?token, "event for cancelled registration");
                continue;
            };

            let readiness = panic::catch_unwind(AssertUnwindSafe(|| read_event(conn, event, high_water)))
                .unwrap_or_else(|payload| {
                    let cause = format!("unexpected failure while reading: {}", panic_message(payload));
                    warn!(handler = %self.shared.name, conn_id = conn.client().id(), cause = %cause, "dropping connection");
                    guarded_disconnect(&self.shared.name, conn.client(), DisconnectReason::ServerError, &cause);
                    Readiness::Cancel
                });
            match readiness {
                Readiness::Ready => self.ready.push_back(token),
                Readiness::Idle => {}
                Readiness::Cancel => {
                    if let Some(conn) = self.connections.remove(&token) {
                        deregister(registry, &self.shared.name, token, &conn);
                    }
                }
            }
        }
    }

    /// Drop a registration. Disconnecting is the caller's business.
    fn cancel(&mut self, token: Token) {
        if let Some(conn) = self.connections.remove(&token) {
            deregister(self.poll.registry(), &self.shared.name, token, &conn);
        }
    }

    /// Step 6: disconnect everything, registered or still pending.
    fn disconnect_all(&mut self) {
        let cause = format!("{}: connection deregistered due to shutdown", self.shared.name);
        let registry = self.poll.registry();

        for (token, conn) in self.connections.drain() {
            let client = conn.client();
            if let Err(e) = client.close_socket() {
                trace!(handler = %self.shared.name, conn_id = client.id(), error = %e, "close failed");
            }
            deregister(registry, &self.shared.name, token, &conn);
            guarded_disconnect(&self.shared.name, client, DisconnectReason::ServerShutdown, &cause);
        }
        self.ready.clear();

        for conn in self.shared.pending.close() {
            guarded_disconnect(&self.shared.name, conn.client(), DisconnectReason::ServerShutdown, &cause);
        }

        self.shared.keys.publish(Vec::new());
    }
}

/// One connection's turn: dispatch at most one message, reading more bytes
/// only while no complete message is buffered.
fn take_turn<D: MessageDecoder>(conn: &mut Connection<D>, high_water: usize) -> Result<Turn, TurnError> {
    if !conn.client().is_connected() {
        return Ok(Turn::Closed);
    }

    let mut dispatched = false;
    loop {
        match conn.message_available()? {
            Some(_) if dispatched => return Ok(Turn::Requeue),
            Some(len) => {
                let message = conn.take_message(len)?;
                let accepted = conn.dispatch(message);
                if !conn.client().is_connected() {
                    return Ok(Turn::Closed);
                }
                if !accepted {
                    return Ok(Turn::Idle);
                }
                dispatched = true;
            }
            None => match conn.read_available(high_water) {
                ReadOutcome::Data(_) => {}
                ReadOutcome::Empty => return Ok(Turn::Idle),
                ReadOutcome::Full => return Err(TurnError::Overflow(conn.readable().len())),
                ReadOutcome::Closed => return Ok(Turn::Closed),
            },
        }
    }
}

/// What a readiness event means for its registration
enum Readiness {
    /// New bytes buffered; queue for processing.
    Ready,
    /// Spurious or non-read event.
    Idle,
    /// Registration is no longer valid.
    Cancel,
}

fn read_event<D: MessageDecoder>(conn: &mut Connection<D>, event: &Event, high_water: usize) -> Readiness {
    if !conn.client().is_connected() {
        return Readiness::Cancel;
    }
    if !(event.is_readable() || event.is_read_closed() || event.is_error()) {
        return Readiness::Idle;
    }

    match conn.read_available(high_water) {
        ReadOutcome::Data(_) | ReadOutcome::Full => Readiness::Ready,
        ReadOutcome::Empty => Readiness::Idle,
        ReadOutcome::Closed => Readiness::Cancel,
    }
}

fn deregister<D: MessageDecoder>(registry: &Registry, name: &str, token: Token, conn: &Connection<D>) {
    let fd = conn.raw_fd();
    if let Err(e) = registry.deregister(&mut SourceFd(&fd)) {
        trace!(handler = name, ?token, error = %e, "deregister failed");
    }
}

/// Disconnect from the loop thread. A panicking sink is logged and dropped.
fn guarded_disconnect(name: &str, client: &Arc<ClientConnection>, reason: DisconnectReason, cause: &str) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| client.disconnect(reason, cause)));
    if let Err(payload) = result {
        warn!(handler = name, conn_id = client.id(), %reason, error = %panic_message(payload), "disconnect sink panicked");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::DisconnectSink;
    use crate::protocol::{EnvelopeDecoder, RequestMessage, ResponseMessage, RESULT_SUCCESS};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<(u64, i32)>>,
        disconnects: Mutex<Vec<(u64, DisconnectReason)>>,
    }

    struct Sink(Arc<Recorder>);

    impl DisconnectSink for Sink {
        fn disconnected(&self, conn: &ClientConnection, reason: DisconnectReason, _: &str) {
            self.0.disconnects.lock().unwrap().push((conn.id(), reason));
        }
    }

    fn config() -> HandlerConfig {
        HandlerConfig::default().with_poll_timeout(Duration::from_millis(20))
    }

    fn pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    fn connection(server: TcpStream, recorder: &Arc<Recorder>, accept: bool) -> Connection<EnvelopeDecoder> {
        let rec = Arc::clone(recorder);
        Connection::new(
            server,
            EnvelopeDecoder::default(),
            move |conn: &Arc<ClientConnection>, msg: RequestMessage| {
                rec.messages.lock().unwrap().push((conn.id(), msg.message_id));
                accept
            },
            Sink(Arc::clone(recorder)),
        )
    }

    fn frames(ids: &[i32]) -> Vec<u8> {
        let mut wire = Vec::new();
        for &id in ids {
            ResponseMessage::result(id, 0, RESULT_SUCCESS, "").encode(&mut wire);
        }
        wire
    }

    /// Poll until some connection is ready.
    fn select_until_ready(el: &mut EventLoop<EnvelopeDecoder>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while el.ready.is_empty() && Instant::now() < deadline {
            assert!(el.select());
            el.process_selected();
        }
    }

    #[test]
    fn test_pipelined_messages_dispatch_in_one_drain() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut el = EventLoop::open("test".into(), config()).unwrap();

        let (server, mut client) = pair(&listener);
        el.shared.register_client(connection(server, &recorder, true));
        el.register_pending_connections();
        assert_eq!(el.connections.len(), 1);

        client.write_all(&frames(&[1, 2, 3])).unwrap();
        select_until_ready(&mut el);
        el.process_ready_connections();

        let ids: Vec<i32> = recorder.messages.lock().unwrap().iter().map(|m| m.1).collect();
        assert_eq!(ids, [1, 2, 3]);
        assert!(el.ready.is_empty());
    }

    #[test]
    fn test_refusing_processor_stops_the_drain() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut el = EventLoop::open("test".into(), config()).unwrap();

        let (server, mut client) = pair(&listener);
        el.shared.register_client(connection(server, &recorder, false));
        el.register_pending_connections();

        client.write_all(&frames(&[1, 2, 3])).unwrap();
        select_until_ready(&mut el);
        el.process_ready_connections();

        // Message 1 was refused, so 2 and 3 stay buffered.
        assert_eq!(recorder.messages.lock().unwrap().len(), 1);
        assert!(el.ready.is_empty());
        assert_eq!(el.connections.len(), 1);
    }

    #[test]
    fn test_pipelined_connections_alternate() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut el = EventLoop::open("test".into(), config()).unwrap();

        let (server_a, mut client_a) = pair(&listener);
        let (server_b, mut client_b) = pair(&listener);
        let conn_a = connection(server_a, &recorder, true);
        let conn_b = connection(server_b, &recorder, true);
        let (id_a, id_b) = (conn_a.client().id(), conn_b.client().id());
        el.shared.register_client(conn_a);
        el.shared.register_client(conn_b);
        el.register_pending_connections();

        client_a.write_all(&frames(&[1, 2])).unwrap();
        client_b.write_all(&frames(&[1, 2])).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while el.ready.len() < 2 && Instant::now() < deadline {
            el.select();
            el.process_selected();
        }
        el.process_ready_connections();

        let order: Vec<u64> = recorder.messages.lock().unwrap().iter().map(|m| m.0).collect();
        assert_eq!(order.len(), 4);
        assert_ne!(order[0], order[1], "second visit should go to the other connection");
        assert!(order.contains(&id_a) && order.contains(&id_b));
    }

    #[test]
    fn test_decode_error_is_connection_local() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut el = EventLoop::open("test".into(), config()).unwrap();

        let (server_bad, mut client_bad) = pair(&listener);
        let (server_good, mut client_good) = pair(&listener);
        let bad = connection(server_bad, &recorder, true);
        let bad_id = bad.client().id();
        el.shared.register_client(bad);
        el.shared.register_client(connection(server_good, &recorder, true));
        el.register_pending_connections();

        client_bad.write_all(&[0x30, 0x80, 0x00, 0x00]).unwrap();
        client_good.write_all(&frames(&[7])).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while el.ready.len() < 2 && Instant::now() < deadline {
            el.select();
            el.process_selected();
        }
        el.process_ready_connections();

        assert_eq!(
            *recorder.disconnects.lock().unwrap(),
            [(bad_id, DisconnectReason::ProtocolError)]
        );
        assert_eq!(recorder.messages.lock().unwrap().len(), 1);
        assert_eq!(el.connections.len(), 1);
    }

    #[test]
    fn test_panicking_processor_disconnects_with_server_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut el = EventLoop::open("test".into(), config()).unwrap();

        let (server, mut client) = pair(&listener);
        let conn = Connection::new(
            server,
            EnvelopeDecoder::default(),
            |_: &Arc<ClientConnection>, _: RequestMessage| -> bool { panic!("boom") },
            Sink(Arc::clone(&recorder)),
        );
        let id = conn.client().id();
        el.shared.register_client(conn);
        el.register_pending_connections();

        client.write_all(&frames(&[1])).unwrap();
        select_until_ready(&mut el);
        el.process_ready_connections();

        assert_eq!(
            *recorder.disconnects.lock().unwrap(),
            [(id, DisconnectReason::ServerError)]
        );
        assert!(el.connections.is_empty());
    }

    /// Records like `Sink`, then panics.
    struct PanickingSink(Arc<Recorder>);

    impl DisconnectSink for PanickingSink {
        fn disconnected(&self, conn: &ClientConnection, reason: DisconnectReason, _: &str) {
            self.0.disconnects.lock().unwrap().push((conn.id(), reason));
            panic!("sink failure");
        }
    }

    #[test]
    fn test_panicking_sink_does_not_stop_the_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut el = EventLoop::open("test".into(), config()).unwrap();
        let shared = Arc::clone(&el.shared);

        let (server_bad, client_bad) = pair(&listener);
        let bad = Connection::new(
            server_bad,
            EnvelopeDecoder::default(),
            |_: &Arc<ClientConnection>, _: RequestMessage| true,
            PanickingSink(Arc::clone(&recorder)),
        );
        let bad_id = bad.client().id();
        let (server_good, mut client_good) = pair(&listener);
        let good = connection(server_good, &recorder, true);
        let good_id = good.client().id();
        shared.register_client(bad);
        shared.register_client(good);
        el.register_pending_connections();

        drop(client_bad);
        client_good.write_all(&frames(&[5])).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while recorder.messages.lock().unwrap().is_empty() && Instant::now() < deadline {
            el.process_ready_connections();
            el.select();
            el.process_selected();
        }
        el.process_ready_connections();
        el.publish_client_connections();

        assert_eq!(*recorder.messages.lock().unwrap(), [(good_id, 5)]);
        assert_eq!(el.connections.len(), 1);

        shared.request_shutdown();
        el.run();
        assert_eq!(
            *recorder.disconnects.lock().unwrap(),
            [
                (bad_id, DisconnectReason::ClientDisconnect),
                (good_id, DisconnectReason::ServerShutdown)
            ]
        );
    }

    #[test]
    fn test_shutdown_disconnects_registered_and_pending_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut el = EventLoop::open("test".into(), config()).unwrap();
        let shared = Arc::clone(&el.shared);

        let mut clients = Vec::new();
        for _ in 0..5 {
            let (server, client) = pair(&listener);
            clients.push(client);
            assert!(shared.register_client(connection(server, &recorder, true)));
        }
        el.register_pending_connections();
        el.publish_client_connections();
        assert_eq!(shared.keys.load().len(), 5);

        for _ in 0..2 {
            let (server, client) = pair(&listener);
            clients.push(client);
            assert!(shared.register_client(connection(server, &recorder, true)));
        }

        shared.request_shutdown();
        el.run();

        let disconnects = recorder.disconnects.lock().unwrap();
        assert_eq!(disconnects.len(), 7);
        assert!(disconnects
            .iter()
            .all(|(_, reason)| *reason == DisconnectReason::ServerShutdown));
        let mut ids: Vec<u64> = disconnects.iter().map(|d| d.0).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 7);
        assert!(shared.keys.load().is_empty());
    }

    #[test]
    fn test_register_after_shutdown_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let recorder = Arc::new(Recorder::default());
        let el = EventLoop::<EnvelopeDecoder>::open("test".into(), config()).unwrap();

        el.shared.request_shutdown();
        let (server, _client) = pair(&listener);
        assert!(!el.shared.register_client(connection(server, &recorder, true)));
        assert_eq!(
            recorder.disconnects.lock().unwrap()[0].1,
            DisconnectReason::ServerShutdown
        );
        assert!(el.shared.pending.is_empty());
    }

    #[test]
    fn test_externally_disconnected_connection_is_pruned() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut el = EventLoop::open("test".into(), config()).unwrap();

        let (server, _client) = pair(&listener);
        let conn = connection(server, &recorder, true);
        let client = Arc::clone(conn.client());
        el.shared.register_client(conn);
        el.register_pending_connections();
        el.publish_client_connections();
        assert_eq!(el.shared.keys.load().len(), 1);

        client.disconnect(DisconnectReason::ClientDisconnect, "unbind");
        el.publish_client_connections();
        assert!(el.connections.is_empty());
        assert!(el.shared.keys.load().is_empty());
    }
}
