//! BER element framing
//!
//! Only definite-length encodings are accepted. An element is
//! `[tag][length][content]`, where the length is either a single byte
//! (`< 0x80`) or `0x80 | n` followed by `n` big-endian length bytes.

use super::DecodeError;

/// Universal SEQUENCE, constructed.
pub const TAG_SEQUENCE: u8 = 0x30;
/// Universal INTEGER.
pub const TAG_INTEGER: u8 = 0x02;
/// Universal ENUMERATED.
pub const TAG_ENUMERATED: u8 = 0x0a;
/// Universal OCTET STRING.
pub const TAG_OCTET_STRING: u8 = 0x04;

/// Longest length-of-length we accept. Four bytes is already 4 GiB.
const MAX_LENGTH_BYTES: usize = 4;

/// Header of a single BER element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementHeader {
    pub tag: u8,
    /// Bytes taken by tag + length octets.
    pub header_len: usize,
    /// Bytes of content following the header.
    pub content_len: usize,
}

impl ElementHeader {
    /// Total element size (header + content)
    #[inline(always)]
    pub fn total_len(&self) -> usize {
        self.header_len + self.content_len
    }
}

/// Read the element header at the front of `buf`.
///
/// Returns `Ok(None)` while the header itself is still incomplete.
#[inline]
pub fn read_header(buf: &[u8]) -> Result<Option<ElementHeader>, DecodeError> {
    let Some(&tag) = buf.first() else {
        return Ok(None);
    };
    if tag & 0x1f == 0x1f {
        return Err(DecodeError::UnsupportedTag(tag));
    }
    let Some(&first) = buf.get(1) else {
        return Ok(None);
    };

    if first & 0x80 == 0 {
        return Ok(Some(ElementHeader {
            tag,
            header_len: 2,
            content_len: first as usize,
        }));
    }

    let count = (first & 0x7f) as usize;
    if count == 0 {
        return Err(DecodeError::IndefiniteLength);
    }
    if count > MAX_LENGTH_BYTES {
        return Err(DecodeError::LengthOverflow(count));
    }
    if buf.len() < 2 + count {
        return Ok(None);
    }

    let content_len = buf[2..2 + count]
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | b as usize);

    Ok(Some(ElementHeader {
        tag,
        header_len: 2 + count,
        content_len,
    }))
}

/// Size of the complete element at the front of `buf`, if fully buffered.
///
/// Elements larger than `max_len` are rejected as soon as their header is
/// readable, so a peer cannot make us buffer an unbounded message.
#[inline]
pub fn element_available(buf: &[u8], max_len: usize) -> Result<Option<usize>, DecodeError> {
    let Some(header) = read_header(buf)? else {
        return Ok(None);
    };
    let total = header.total_len();
    if total > max_len {
        return Err(DecodeError::TooLarge {
            size: total,
            limit: max_len,
        });
    }
    Ok((buf.len() >= total).then_some(total))
}

/// Cursor over the elements of a fully buffered constructed value.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Next element as `(header, content)`. Truncation is an error here
    /// because the enclosing element was already complete.
    pub fn next_element(&mut self) -> Result<(ElementHeader, &'a [u8]), DecodeError> {
        let rest = &self.buf[self.pos..];
        let header = read_header(rest)?.ok_or(DecodeError::Truncated)?;
        if rest.len() < header.total_len() {
            return Err(DecodeError::Truncated);
        }
        let content = &rest[header.header_len..header.total_len()];
        self.pos += header.total_len();
        Ok((header, content))
    }

    /// Read an INTEGER that must fit in an `i32`.
    pub fn read_i32(&mut self, expected_tag: u8) -> Result<i32, DecodeError> {
        let (header, content) = self.next_element()?;
        if header.tag != expected_tag {
            return Err(DecodeError::UnexpectedTag {
                expected: expected_tag,
                found: header.tag,
            });
        }
        decode_i32(content)
    }

    /// Remaining bytes
    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Two's complement big-endian integer content.
pub fn decode_i32(content: &[u8]) -> Result<i32, DecodeError> {
    if content.is_empty() || content.len() > 4 {
        return Err(DecodeError::BadInteger(content.len()));
    }
    let negative = content[0] & 0x80 != 0;
    let mut value: i64 = if negative { -1 } else { 0 };
    for &b in content {
        value = (value << 8) | b as i64;
    }
    Ok(value as i32)
}

/// Append a definite length.
pub fn write_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

/// Append a minimal two's complement INTEGER (or ENUMERATED) element.
pub fn write_integer(out: &mut Vec<u8>, tag: u8, value: i32) {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 3 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    out.push(tag);
    write_length(out, 4 - start);
    out.extend_from_slice(&bytes[start..]);
}

/// Append a primitive element with arbitrary content.
pub fn write_element(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    write_length(out, content.len());
    out.extend_from_slice(content);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&[0x30, 0x03, 1, 2, 3], Some(5))]
    #[case(&[0x30, 0x03, 1, 2], None)]
    #[case(&[0x30], None)]
    #[case(&[], None)]
    #[case(&[0x04, 0x81, 0x02, 9, 9], Some(5))]
    #[case(&[0x04, 0x82, 0x00], None)]
    fn test_element_available(#[case] buf: &[u8], #[case] expected: Option<usize>) {
        assert_eq!(element_available(buf, 1024).unwrap(), expected);
    }

    #[test]
    fn test_indefinite_length_rejected() {
        assert!(matches!(
            element_available(&[0x30, 0x80, 0, 0], 1024),
            Err(DecodeError::IndefiniteLength)
        ));
    }

    #[test]
    fn test_oversize_rejected_before_content_arrives() {
        // Header claims 0x010000 bytes, only the header is buffered.
        let err = element_available(&[0x30, 0x83, 0x01, 0x00, 0x00], 4096).unwrap_err();
        assert!(matches!(err, DecodeError::TooLarge { size, limit: 4096 } if size == 0x10005));
    }

    #[test]
    fn test_high_tag_number_rejected() {
        assert!(matches!(
            read_header(&[0x1f, 0x01]),
            Err(DecodeError::UnsupportedTag(0x1f))
        ));
    }

    #[rstest]
    #[case(0, &[0x02, 0x01, 0x00])]
    #[case(127, &[0x02, 0x01, 0x7f])]
    #[case(128, &[0x02, 0x02, 0x00, 0x80])]
    #[case(-1, &[0x02, 0x01, 0xff])]
    #[case(-129, &[0x02, 0x02, 0xff, 0x7f])]
    fn test_write_integer(#[case] value: i32, #[case] expected: &[u8]) {
        let mut out = Vec::new();
        write_integer(&mut out, TAG_INTEGER, value);
        assert_eq!(out, expected);
        assert_eq!(decode_i32(&out[2..]).unwrap(), value);
    }

    #[test]
    fn test_long_form_length() {
        let mut out = Vec::new();
        write_length(&mut out, 300);
        assert_eq!(out, [0x82, 0x01, 0x2c]);
    }
}
