//! Protocol Layer: message framing collaborators
//!
//! The network engine never interprets bytes itself. It asks a
//! [`MessageDecoder`] whether a complete message sits at the front of a
//! connection's buffer, and hands responses to a [`ResponseEncoder`].
//!
//! The default implementations frame BER elements and decode the
//! directory-protocol envelope (message id + opaque operation).

pub mod ber;
mod codec;
mod message;

pub use codec::{EnvelopeDecoder, EnvelopeEncoder, DEFAULT_MAX_MESSAGE_SIZE};
pub use message::{
    RequestMessage, ResponseMessage, OP_ABANDON_REQUEST, OP_UNBIND_REQUEST, RESULT_SUCCESS,
};

use thiserror::Error;

/// Malformed bytes on a connection
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("multi-byte tag 0x{0:02x} is not supported")]
    UnsupportedTag(u8),
    #[error("indefinite length encoding is not allowed")]
    IndefiniteLength,
    #[error("length field of {0} bytes is too long")]
    LengthOverflow(usize),
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("element truncated inside a complete message")]
    Truncated,
    #[error("expected tag 0x{expected:02x}, found 0x{found:02x}")]
    UnexpectedTag { expected: u8, found: u8 },
    #[error("integer of {0} bytes does not fit")]
    BadInteger(usize),
    #[error("invalid message id {0}")]
    InvalidMessageId(i32),
}

/// Turns buffered bytes into messages.
///
/// `message_available` must be cheap: the request handler calls it after
/// every dispatch to decide whether a connection still has pipelined work.
pub trait MessageDecoder: Send + 'static {
    type Message: Send + 'static;

    /// Length of the complete message at the front of `buf`, or `None` if
    /// more bytes are needed.
    fn message_available(&self, buf: &[u8]) -> Result<Option<usize>, DecodeError>;

    /// Size the message at the front of `buf` declares, as soon as its
    /// header is readable and the size is within the decoder's limit.
    ///
    /// The read side buffers up to this much even past its high-water mark,
    /// so any message the decoder accepts can be completed.
    fn declared_len(&self, _buf: &[u8]) -> Option<usize> {
        None
    }

    /// Decode exactly one message from `frame`, whose length was reported
    /// by `message_available`.
    fn decode(&self, frame: &[u8]) -> Result<Self::Message, DecodeError>;
}

/// Serializes one response into wire bytes.
pub trait ResponseEncoder<T>: Send + Sync + 'static {
    fn encode(&self, message: &T, out: &mut Vec<u8>);
}
