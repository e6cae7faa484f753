//! Engine errors
//!
//! Connection-local failures never surface here: they become disconnects.
//! These types cover start-up and the write path's terminal outcomes.

use std::io;

use thiserror::Error;

/// Opaque failure raised by a response producer.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure to bring up an event loop
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{name}: cannot open selector: {source}")]
    SelectorOpen { name: String, source: io::Error },
    #[error("{name}: selector probe failed, platform poller is unusable: {source}")]
    SelectorProbe { name: String, source: io::Error },
    #[error("{name}: cannot spawn thread: {source}")]
    Spawn { name: String, source: io::Error },
}

/// Socket-layer failure reported to a write completion
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("write cancelled")]
    Cancelled,
    #[error("connection closed")]
    Closed,
    #[error("a write is already in flight")]
    Busy,
}

/// Terminal failure of a response stream
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("response producer failed: {0}")]
    Producer(#[source] BoxError),
    #[error("producer emitted a response without demand")]
    DemandExceeded,
}
