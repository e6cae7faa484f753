//! Network Layer: non-blocking I/O engine
//!
//! Read side: accepted sockets become [`Connection`]s, are handed to a
//! [`RequestHandler`] and from then on are read, decoded and dispatched by
//! that handler's event-loop thread alone.
//!
//! Write side: a [`ResponseWriter`] pulls responses from a producer one at
//! a time and writes them through a [`ResponseTransport`], usually a
//! [`SocketTransport`] driven by a shared [`WriteSelector`].
//!
//! Both sides register with a [`ShutdownCoordinator`].

mod connection;
pub mod flow;
mod request_handler;
mod shutdown;
mod transport;
mod writer;

pub use connection::{
    ClientConnection, Connection, ConnectionState, DisconnectReason, DisconnectSink,
    LogDisconnects, MessageProcessor, ReadOutcome,
};
pub use flow::{CompletionObserver, IterProducer, ResponseProducer, Subscriber, Subscription};
pub use request_handler::RequestHandler;
pub use shutdown::{ShutdownCoordinator, ShutdownListener};
pub use transport::{SocketTransport, WriteSelector};
pub use writer::{ResponseTransport, ResponseWriter, WriteEvents};
