//! Client connections
//!
//! A connection has two faces:
//! - [`ClientConnection`]: the shared, `Arc`-held identity. Holds the socket,
//!   the disconnect state and the disconnect sink. Anyone may disconnect it.
//! - [`Connection`]: the read side, owned by exactly one request handler.
//!   Holds the decode cursor and the message processor, so it is never
//!   touched by two threads.

use std::fmt;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::HandlerConfig;
use crate::protocol::{DecodeError, MessageDecoder};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const CONNECTED: u8 = 0;
const DISCONNECTING: u8 = 1;
const CLOSED: u8 = 2;

/// Why a connection was terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Peer sent bytes we could not decode.
    ProtocolError,
    /// Local failure: transport, registration or an unexpected fault.
    ServerError,
    /// The server is shutting down.
    ServerShutdown,
    /// The peer closed the connection or asked to.
    ClientDisconnect,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ProtocolError => "protocol error",
            Self::ServerError => "server error",
            Self::ServerShutdown => "server shutdown",
            Self::ClientDisconnect => "client disconnect",
        })
    }
}

/// Disconnect state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnecting,
    Closed,
}

/// Releases whatever the server attached to a connection.
///
/// Called at most once per connection, from whichever thread won the
/// disconnect.
pub trait DisconnectSink: Send + Sync {
    fn disconnected(&self, conn: &ClientConnection, reason: DisconnectReason, cause: &str);
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDisconnects;

impl DisconnectSink for LogDisconnects {
    fn disconnected(&self, conn: &ClientConnection, reason: DisconnectReason, cause: &str) {
        debug!(conn_id = conn.id(), peer = ?conn.peer_addr(), %reason, cause, "client disconnected");
    }
}

/// Shared identity of one accepted client socket
pub struct ClientConnection {
    id: u64,
    peer_addr: Option<SocketAddr>,
    socket: Arc<TcpStream>,
    state: AtomicU8,
    sink: Box<dyn DisconnectSink>,
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl ClientConnection {
    fn new(socket: TcpStream, sink: Box<dyn DisconnectSink>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr: socket.peer_addr().ok(),
            socket: Arc::new(socket),
            state: AtomicU8::new(CONNECTED),
            sink,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Underlying socket, shared with the write path.
    #[inline(always)]
    pub fn socket(&self) -> &Arc<TcpStream> {
        &self.socket
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            CONNECTED => ConnectionState::Connected,
            DISCONNECTING => ConnectionState::Disconnecting,
            _ => ConnectionState::Closed,
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::Acquire) == CONNECTED
    }

    /// Shut both directions of the socket down. The descriptor itself is
    /// released when the last holder drops it.
    pub fn close_socket(&self) -> io::Result<()> {
        match self.socket.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    /// Terminate the connection.
    ///
    /// Only the first call has any effect; it closes the socket and notifies
    /// the sink. Returns whether this call performed the disconnect.
    pub fn disconnect(&self, reason: DisconnectReason, cause: impl AsRef<str>) -> bool {
        if self
            .state
            .compare_exchange(CONNECTED, DISCONNECTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!(conn_id = self.id, %reason, "ignoring repeated disconnect");
            return false;
        }

        let cause = cause.as_ref();
        if let Err(e) = self.close_socket() {
            trace!(conn_id = self.id, error = %e, "socket shutdown failed");
        }
        self.sink.disconnected(self, reason, cause);
        self.state.store(CLOSED, Ordering::Release);
        true
    }
}

/// Consumes decoded messages for one connection.
///
/// Returning `false` means the processor cannot take more work from this
/// connection right now; the handler stops draining it for this pass.
pub trait MessageProcessor<M>: Send {
    fn process(&mut self, conn: &Arc<ClientConnection>, message: M) -> bool;
}

impl<M, F> MessageProcessor<M> for F
where
    F: FnMut(&Arc<ClientConnection>, M) -> bool + Send,
{
    #[inline]
    fn process(&mut self, conn: &Arc<ClientConnection>, message: M) -> bool {
        self(conn, message)
    }
}

/// Result of one raw read pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many new bytes were buffered.
    Data(usize),
    /// Nothing available right now.
    Empty,
    /// Buffer is at its high-water mark; nothing was read.
    Full,
    /// Peer closed or the read failed; the connection has been disconnected.
    Closed,
}

/// Read side of a connection
pub struct Connection<D: MessageDecoder> {
    client: Arc<ClientConnection>,
    decoder: D,
    processor: Box<dyn MessageProcessor<D::Message>>,
    read_buffer: Vec<u8>,
    read_pos: usize,
    read_len: usize,
    peer_closed: bool,
}

impl<D: MessageDecoder> Connection<D> {
    /// Wrap a freshly accepted socket.
    pub fn new<P, S>(socket: TcpStream, decoder: D, processor: P, sink: S) -> Self
    where
        P: MessageProcessor<D::Message> + 'static,
        S: DisconnectSink + 'static,
    {
        Self {
            client: Arc::new(ClientConnection::new(socket, Box::new(sink))),
            decoder,
            processor: Box::new(processor),
            read_buffer: Vec::new(),
            read_pos: 0,
            read_len: 0,
            peer_closed: false,
        }
    }

    #[inline(always)]
    pub fn client(&self) -> &Arc<ClientConnection> {
        &self.client
    }

    #[inline(always)]
    pub(crate) fn raw_fd(&self) -> RawFd {
        self.client.socket.as_raw_fd()
    }

    /// Non-blocking mode plus socket options, applied right before the
    /// socket is handed to a selector.
    pub(crate) fn prepare(&mut self, config: &HandlerConfig) -> io::Result<()> {
        let socket = &self.client.socket;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(config.nodelay)?;

        #[cfg(unix)]
        if let Some(size) = config.socket_buffer_size {
            set_socket_buffers(socket.as_raw_fd(), size);
        }

        if self.read_buffer.is_empty() {
            self.read_buffer = vec![0u8; config.read_buffer_size];
        }
        Ok(())
    }

    /// Buffered, not yet decoded bytes (zero-copy)
    #[inline(always)]
    pub fn readable(&self) -> &[u8] {
        &self.read_buffer[self.read_pos..self.read_len]
    }

    /// Length of the next complete message, if one is buffered.
    #[inline]
    pub fn message_available(&self) -> Result<Option<usize>, DecodeError> {
        self.decoder.message_available(self.readable())
    }

    /// Decode the next `len` bytes and advance the cursor past them.
    pub fn take_message(&mut self, len: usize) -> Result<D::Message, DecodeError> {
        let frame = &self.read_buffer[self.read_pos..self.read_pos + len];
        let message = self.decoder.decode(frame);
        self.read_pos += len;
        message
    }

    /// Hand one message to the processor.
    #[inline]
    pub fn dispatch(&mut self, message: D::Message) -> bool {
        self.processor.process(&self.client, message)
    }

    /// Read limit: the high-water mark, raised to the size of the message
    /// being assembled when its header declares more.
    #[inline]
    fn read_limit(&self, high_water: usize) -> usize {
        match self.decoder.declared_len(self.readable()) {
            Some(len) => high_water.max(len),
            None => high_water,
        }
    }

    /// Drain the socket into the buffer until it would block.
    ///
    /// Readiness is edge-triggered, so a partial drain could leave bytes
    /// nobody is told about. The only early stop is the read limit, which
    /// the caller resolves by decoding before reading again.
    pub fn read_available(&mut self, high_water: usize) -> ReadOutcome {
        if !self.client.is_connected() {
            return ReadOutcome::Closed;
        }
        if self.peer_closed {
            self.client
                .disconnect(DisconnectReason::ClientDisconnect, "client closed the connection");
            return ReadOutcome::Closed;
        }

        self.compact();
        let mut total = 0;
        loop {
            let limit = self.read_limit(high_water);
            if self.read_len >= limit {
                return if total > 0 {
                    ReadOutcome::Data(total)
                } else {
                    ReadOutcome::Full
                };
            }
            if self.read_len == self.read_buffer.len() {
                let grown = (self.read_buffer.len() * 2).clamp(4096, limit.max(4096));
                self.read_buffer.resize(grown, 0);
            }

            match (&*self.client.socket).read(&mut self.read_buffer[self.read_len..]) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => {
                    self.read_len += n;
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.client.disconnect(
                        DisconnectReason::ServerError,
                        format!("read failed: {e}"),
                    );
                    return ReadOutcome::Closed;
                }
            }
        }

        if total > 0 {
            // EOF is reported on the next read, after buffered messages
            // have had their turn.
            ReadOutcome::Data(total)
        } else if self.peer_closed {
            self.client
                .disconnect(DisconnectReason::ClientDisconnect, "client closed the connection");
            ReadOutcome::Closed
        } else {
            ReadOutcome::Empty
        }
    }

    /// Move unread bytes to the front of the buffer.
    #[inline]
    fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        let remaining = self.read_len - self.read_pos;
        if remaining > 0 {
            self.read_buffer.copy_within(self.read_pos..self.read_len, 0);
        }
        self.read_len = remaining;
        self.read_pos = 0;
    }
}

/// Socket buffer sizes. Errors are ignored: not every platform honours them.
#[cfg(unix)]
fn set_socket_buffers(fd: RawFd, size: usize) {
    let optval = size.min(libc::c_int::MAX as usize) as libc::c_int;
    for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
        // SAFETY: fd is a live socket owned by the connection and optval
        // outlives the call.
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EnvelopeDecoder, RequestMessage, ResponseMessage, RESULT_SUCCESS};
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<DisconnectReason>>);

    impl DisconnectSink for Arc<RecordingSink> {
        fn disconnected(&self, _: &ClientConnection, reason: DisconnectReason, _: &str) {
            self.0.lock().unwrap().push(reason);
        }
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    fn connection(sink: Arc<RecordingSink>) -> (Connection<EnvelopeDecoder>, TcpStream) {
        let (server, client) = socket_pair();
        let mut conn = Connection::new(
            server,
            EnvelopeDecoder::default(),
            |_: &Arc<ClientConnection>, _: RequestMessage| true,
            sink,
        );
        conn.prepare(&HandlerConfig::default().with_read_buffer_size(512))
            .unwrap();
        (conn, client)
    }

    fn read_until(conn: &mut Connection<EnvelopeDecoder>, pred: impl Fn(ReadOutcome) -> bool) -> ReadOutcome {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let outcome = conn.read_available(1 << 20);
            if pred(outcome) || Instant::now() > deadline {
                return outcome;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_disconnect_is_exactly_once() {
        let sink = Arc::new(RecordingSink::default());
        let (conn, _client) = connection(Arc::clone(&sink));
        let client = conn.client();

        assert!(client.disconnect(DisconnectReason::ProtocolError, "bad"));
        assert!(!client.disconnect(DisconnectReason::ServerShutdown, "again"));
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(*sink.0.lock().unwrap(), [DisconnectReason::ProtocolError]);
    }

    #[test]
    fn test_read_then_decode_advances_cursor() {
        let sink = Arc::new(RecordingSink::default());
        let (mut conn, mut client) = connection(sink);

        let mut wire = Vec::new();
        ResponseMessage::result(1, 0, RESULT_SUCCESS, "").encode(&mut wire);
        ResponseMessage::result(2, 0, RESULT_SUCCESS, "").encode(&mut wire);
        client.write_all(&wire).unwrap();

        assert!(matches!(read_until(&mut conn, |o| matches!(o, ReadOutcome::Data(_))), ReadOutcome::Data(_)));
        let len = conn.message_available().unwrap().unwrap();
        assert_eq!(conn.take_message(len).unwrap().message_id, 1);
        let len = conn.message_available().unwrap().unwrap();
        assert_eq!(conn.take_message(len).unwrap().message_id, 2);
        assert!(conn.message_available().unwrap().is_none());
        assert!(conn.readable().is_empty());
    }

    #[test]
    fn test_buffer_grows_past_initial_size() {
        let sink = Arc::new(RecordingSink::default());
        let (mut conn, mut client) = connection(sink);

        let mut wire = Vec::new();
        ResponseMessage::result(1, 0, RESULT_SUCCESS, &"d".repeat(3000)).encode(&mut wire);
        client.write_all(&wire).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while conn.message_available().unwrap().is_none() && Instant::now() < deadline {
            conn.read_available(1 << 20);
        }
        assert_eq!(conn.message_available().unwrap(), Some(wire.len()));
    }

    #[test]
    fn test_declared_message_may_exceed_high_water() {
        let sink = Arc::new(RecordingSink::default());
        let (mut conn, mut client) = connection(Arc::clone(&sink));

        let mut wire = Vec::new();
        ResponseMessage::result(9, 0, RESULT_SUCCESS, &"d".repeat(8000)).encode(&mut wire);
        client.write_all(&wire).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while conn.message_available().unwrap().is_none() && Instant::now() < deadline {
            assert_ne!(conn.read_available(1024), ReadOutcome::Full);
        }
        let len = conn.message_available().unwrap().unwrap();
        assert_eq!(len, wire.len());
        assert_eq!(conn.take_message(len).unwrap().message_id, 9);
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_peer_close_disconnects_once() {
        let sink = Arc::new(RecordingSink::default());
        let (mut conn, client) = connection(Arc::clone(&sink));
        drop(client);

        assert_eq!(read_until(&mut conn, |o| o == ReadOutcome::Closed), ReadOutcome::Closed);
        assert_eq!(conn.read_available(1 << 20), ReadOutcome::Closed);
        assert_eq!(*sink.0.lock().unwrap(), [DisconnectReason::ClientDisconnect]);
    }
}
