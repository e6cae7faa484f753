//! dirio - non-blocking network I/O engine for directory-protocol servers
//!
//! Architecture:
//! - Read side: one selector thread per request handler, fair round-robin
//!   draining of pipelined requests
//! - Write side: pull-based response streaming, one write in flight per
//!   connection
//! - Handoff: a single lock-guarded pending queue between acceptors and
//!   each event loop
//! - Framing: BER envelope decoding as the default message decoder

pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod protocol;

pub use config::{HandlerConfig, WriterConfig};
pub use error::{BoxError, HandlerError, TransportError, WriteError};
pub use network::{
    ClientConnection, Connection, DisconnectReason, RequestHandler, ResponseWriter,
    ShutdownCoordinator, SocketTransport, WriteSelector,
};
