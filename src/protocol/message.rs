//! Directory protocol envelope
//!
//! Layout:
//! ```text
//! SEQUENCE {
//!     messageID   INTEGER (0 .. maxInt),
//!     protocolOp  [APPLICATION n] ...,   -- kept opaque
//!     controls    [0] ... OPTIONAL       -- kept opaque
//! }
//! ```
//!
//! Only the envelope is interpreted. Operation bodies stay as raw bytes
//! for whatever server logic consumes them.

use super::ber::{self, Reader, TAG_ENUMERATED, TAG_INTEGER, TAG_OCTET_STRING, TAG_SEQUENCE};
use super::DecodeError;

/// Class bits of an APPLICATION tag.
const CLASS_APPLICATION: u8 = 0x40;
/// Constructed bit.
const CONSTRUCTED: u8 = 0x20;

/// Unbind request tag (`[APPLICATION 2]`, primitive NULL).
pub const OP_UNBIND_REQUEST: u8 = 0x42;
/// Abandon request tag (`[APPLICATION 16]`, primitive INTEGER).
pub const OP_ABANDON_REQUEST: u8 = 0x50;

/// Result code `success`.
pub const RESULT_SUCCESS: i32 = 0;

/// One decoded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMessage {
    pub message_id: i32,
    /// Full tag byte of the protocol op.
    pub op_tag: u8,
    /// Content octets of the protocol op.
    pub op_body: Vec<u8>,
    /// Raw controls element, if present.
    pub controls: Option<Vec<u8>>,
}

impl RequestMessage {
    /// Operation number inside the APPLICATION class.
    #[inline(always)]
    pub fn op_number(&self) -> u8 {
        self.op_tag & 0x1f
    }

    /// Requests that never receive a response.
    #[inline]
    pub fn expects_response(&self) -> bool {
        self.op_tag != OP_UNBIND_REQUEST && self.op_tag != OP_ABANDON_REQUEST
    }

    /// Decode a complete envelope element.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let mut outer = Reader::new(frame);
        let (header, content) = outer.next_element()?;
        if header.tag != TAG_SEQUENCE {
            return Err(DecodeError::UnexpectedTag {
                expected: TAG_SEQUENCE,
                found: header.tag,
            });
        }

        let mut inner = Reader::new(content);
        let message_id = inner.read_i32(TAG_INTEGER)?;
        if message_id < 0 {
            return Err(DecodeError::InvalidMessageId(message_id));
        }

        let (op, op_body) = inner.next_element()?;
        if op.tag & 0xc0 != CLASS_APPLICATION {
            return Err(DecodeError::UnexpectedTag {
                expected: CLASS_APPLICATION,
                found: op.tag,
            });
        }

        let controls = if inner.remaining() > 0 {
            let (_, raw) = inner.next_element()?;
            Some(raw.to_vec())
        } else {
            None
        };

        Ok(Self {
            message_id,
            op_tag: op.tag,
            op_body: op_body.to_vec(),
            controls,
        })
    }

    /// Encode back into envelope form.
    pub fn encode(&self, out: &mut Vec<u8>) {
        encode_envelope(out, self.message_id, self.op_tag, &self.op_body);
    }
}

/// One response ready for the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMessage {
    pub message_id: i32,
    pub op_tag: u8,
    pub op_body: Vec<u8>,
}

impl ResponseMessage {
    /// Generic LDAPResult-shaped response:
    /// `{ resultCode ENUMERATED, matchedDN OCTET STRING, diagnosticMessage OCTET STRING }`.
    pub fn result(message_id: i32, op_number: u8, result_code: i32, diagnostic: &str) -> Self {
        let mut body = Vec::with_capacity(8 + diagnostic.len());
        ber::write_integer(&mut body, TAG_ENUMERATED, result_code);
        ber::write_element(&mut body, TAG_OCTET_STRING, &[]);
        ber::write_element(&mut body, TAG_OCTET_STRING, diagnostic.as_bytes());
        Self {
            message_id,
            op_tag: CLASS_APPLICATION | CONSTRUCTED | (op_number & 0x1f),
            op_body: body,
        }
    }

    /// Result for `request`, using the conventional `op + 1` response number.
    pub fn result_for(request: &RequestMessage, result_code: i32, diagnostic: &str) -> Self {
        Self::result(
            request.message_id,
            request.op_number().wrapping_add(1),
            result_code,
            diagnostic,
        )
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        encode_envelope(out, self.message_id, self.op_tag, &self.op_body);
    }
}

fn encode_envelope(out: &mut Vec<u8>, message_id: i32, op_tag: u8, op_body: &[u8]) {
    let mut content = Vec::with_capacity(8 + op_body.len());
    ber::write_integer(&mut content, TAG_INTEGER, message_id);
    ber::write_element(&mut content, op_tag, op_body);
    ber::write_element(out, TAG_SEQUENCE, &content);
}
