//! Default envelope codec

use super::ber;
use super::message::{RequestMessage, ResponseMessage};
use super::{DecodeError, MessageDecoder, ResponseEncoder};

/// 16 MiB, generous for directory traffic.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Decoder for [`RequestMessage`] envelopes
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeDecoder {
    max_message_size: usize,
}

impl EnvelopeDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    #[inline(always)]
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Default for EnvelopeDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl MessageDecoder for EnvelopeDecoder {
    type Message = RequestMessage;

    #[inline]
    fn message_available(&self, buf: &[u8]) -> Result<Option<usize>, DecodeError> {
        ber::element_available(buf, self.max_message_size)
    }

    fn declared_len(&self, buf: &[u8]) -> Option<usize> {
        match ber::read_header(buf) {
            Ok(Some(header)) if header.total_len() <= self.max_message_size => Some(header.total_len()),
            _ => None,
        }
    }

    fn decode(&self, frame: &[u8]) -> Result<RequestMessage, DecodeError> {
        RequestMessage::decode(frame)
    }
}

/// Encoder for [`ResponseMessage`] envelopes
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeEncoder;

impl ResponseEncoder<ResponseMessage> for EnvelopeEncoder {
    #[inline]
    fn encode(&self, message: &ResponseMessage, out: &mut Vec<u8>) {
        message.encode(out);
    }
}
