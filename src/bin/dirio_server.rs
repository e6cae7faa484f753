//! dirio demonstration server
//!
//! Accepts TCP connections, spreads them round-robin over the request
//! handlers and answers every request with a success result.
//!
//! Usage:
//!   cargo run --release --bin dirio_server -- --bind 127.0.0.1:3389 --handlers 4

use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use dirio::network::{
    ClientConnection, CompletionObserver, Connection, DisconnectReason, IterProducer,
    LogDisconnects, ResponseProducer, ResponseTransport, ResponseWriter, ShutdownCoordinator,
    SocketTransport, WriteSelector,
};
use dirio::protocol::{
    EnvelopeDecoder, EnvelopeEncoder, RequestMessage, ResponseMessage, DEFAULT_MAX_MESSAGE_SIZE,
    OP_UNBIND_REQUEST, RESULT_SUCCESS,
};
use dirio::{BoxError, HandlerConfig, RequestHandler, WriteError, WriterConfig};

static STOP: AtomicBool = AtomicBool::new(false);

const ACCEPT_IDLE: Duration = Duration::from_millis(50);

extern "C" fn handle_signal(_: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

/// Server options
#[derive(Debug, Parser)]
#[command(name = "dirio_server")]
#[command(about = "Directory-protocol I/O engine demonstration server")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:3389", env = "DIRIO_BIND")]
    bind: SocketAddr,

    /// Number of request handler threads
    #[arg(long, default_value_t = 2, env = "DIRIO_HANDLERS",
          value_parser = clap::value_parser!(u16).range(1..))]
    handlers: u16,

    /// Selector poll timeout in milliseconds
    #[arg(long = "poll-timeout-ms", default_value_t = 1000, env = "DIRIO_POLL_TIMEOUT_MS")]
    poll_timeout_ms: u64,

    /// Largest accepted request, in bytes
    #[arg(long = "max-message-size", default_value_t = DEFAULT_MAX_MESSAGE_SIZE, env = "DIRIO_MAX_MESSAGE_SIZE")]
    max_message_size: usize,

    /// SO_SNDBUF / SO_RCVBUF in KiB (kernel default if unset)
    #[arg(long = "socket-buffer-kb", env = "DIRIO_SOCKET_BUFFER_KB")]
    socket_buffer_kb: Option<usize>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,
}

/// Serializes response streams on one connection
///
/// Responses queued while a stream is in flight go out as the next batch.
struct Responder {
    client: Arc<ClientConnection>,
    transport: Arc<dyn ResponseTransport<ResponseMessage>>,
    state: Mutex<ResponderState>,
}

#[derive(Default)]
struct ResponderState {
    queue: Vec<ResponseMessage>,
    busy: bool,
}

impl Responder {
    fn send(self: &Arc<Self>, response: ResponseMessage) {
        let batch = {
            let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            st.queue.push(response);
            if st.busy {
                return;
            }
            st.busy = true;
            mem::take(&mut st.queue)
        };
        self.start(batch);
    }

    fn start(self: &Arc<Self>, batch: Vec<ResponseMessage>) {
        let this = Arc::clone(self);
        let producer: Box<dyn ResponseProducer<ResponseMessage>> =
            Box::new(IterProducer::new(batch.into_iter().map(Ok::<_, BoxError>)));
        let observer: Box<dyn CompletionObserver> =
            Box::new(move |result: Result<(), WriteError>| this.finished(result));
        ResponseWriter::deliver(Arc::clone(&self.transport), producer, observer);
    }

    fn finished(self: Arc<Self>, result: Result<(), WriteError>) {
        if let Err(e) = result {
            self.client
                .disconnect(DisconnectReason::ServerError, format!("cannot write response: {e}"));
            return;
        }
        let batch = {
            let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if st.queue.is_empty() {
                st.busy = false;
                return;
            }
            mem::take(&mut st.queue)
        };
        self.start(batch);
    }
}

/// Per-connection processor: answer everything, disconnect on unbind.
fn processor(
    selector: Arc<WriteSelector>,
) -> impl FnMut(&Arc<ClientConnection>, RequestMessage) -> bool + Send {
    let mut attached: Option<Arc<Responder>> = None;

    move |conn: &Arc<ClientConnection>, request: RequestMessage| {
        if request.op_tag == OP_UNBIND_REQUEST {
            conn.disconnect(DisconnectReason::ClientDisconnect, "unbind request");
            return true;
        }
        if !request.expects_response() {
            return true;
        }

        let responder = match &attached {
            Some(responder) => Arc::clone(responder),
            None => match SocketTransport::<ResponseMessage, _>::new(&selector, conn, EnvelopeEncoder) {
                Ok(transport) => {
                    let created = Arc::new(Responder {
                        client: Arc::clone(conn),
                        transport: Arc::new(transport),
                        state: Mutex::new(ResponderState::default()),
                    });
                    attached = Some(Arc::clone(&created));
                    created
                }
                Err(e) => {
                    conn.disconnect(DisconnectReason::ServerError, format!("cannot attach writer: {e}"));
                    return true;
                }
            },
        };

        debug!(conn_id = conn.id(), message_id = request.message_id, op = request.op_number(), "request");
        responder.send(ResponseMessage::result_for(&request, RESULT_SUCCESS, ""));
        true
    }
}

fn accept_loop(
    listener: TcpListener,
    handlers: Vec<Arc<RequestHandler<EnvelopeDecoder>>>,
    selector: Arc<WriteSelector>,
    max_message_size: usize,
) {
    let mut next = 0usize;
    // Non-blocking so STOP is seen without waiting for another client.
    while !STOP.load(Ordering::SeqCst) {
        let socket = match listener.accept() {
            Ok((socket, _)) => socket,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_IDLE);
                continue;
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(ACCEPT_IDLE);
                continue;
            }
        };

        let handler = &handlers[next % handlers.len()];
        next = next.wrapping_add(1);

        let conn = Connection::new(
            socket,
            EnvelopeDecoder::new(max_message_size),
            processor(Arc::clone(&selector)),
            LogDisconnects,
        );
        handler.register_client(conn);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}

fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    init_logging(args.verbose);

    unsafe {
        libc::signal(libc::SIGINT, handle_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let config = HandlerConfig::default()
        .with_poll_timeout(Duration::from_millis(args.poll_timeout_ms))
        .with_socket_buffer_size(args.socket_buffer_kb.map(|kb| kb * 1024));

    let coordinator = ShutdownCoordinator::new();

    let selector = Arc::new(WriteSelector::start("dirio Response Writer", WriterConfig::default())?);
    coordinator.register(selector.clone());

    let mut handlers = Vec::with_capacity(args.handlers as usize);
    for id in 0..args.handlers {
        let handler = Arc::new(RequestHandler::<EnvelopeDecoder>::start(
            format!("dirio Request Handler {id}"),
            config.clone(),
        )?);
        coordinator.register(handler.clone());
        handlers.push(handler);
    }

    let listener = TcpListener::bind(args.bind)?;
    listener.set_nonblocking(true)?;
    info!(bind = %args.bind, handlers = args.handlers, "dirio server listening");

    let acceptor = {
        let selector = Arc::clone(&selector);
        let max_message_size = args.max_message_size;
        thread::Builder::new()
            .name("dirio Acceptor".into())
            .spawn(move || accept_loop(listener, handlers, selector, max_message_size))?
    };

    while !STOP.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    if acceptor.join().is_err() {
        warn!("acceptor thread panicked");
    }
    coordinator.shutdown("signal received");
    coordinator.await_termination();
    info!("dirio server stopped");
    Ok(())
}
