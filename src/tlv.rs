//! Minimal BER-TLV decoding over borrowed byte slices.
//!
//! Every length is validated against the end of the input before any value
//! is exposed; a field view can never extend past the buffer it was parsed
//! from. This is the primary defense against a malicious or corrupted card
//! response driving an out-of-bounds read.

use core::ops::Range;

use bytes::{BufMut, BytesMut};

use crate::{Error, Result};

/// Marker in the first tag byte indicating a two-byte tag
const MULTI_BYTE_TAG: u8 = 0b1_1111;

/// A decoded TLV field borrowing its value from the parsed buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvField<'a> {
    /// Tag number (one or two bytes)
    pub tag: u16,
    /// Value bytes, guaranteed in-bounds
    pub value: &'a [u8],
    /// Byte range of the whole encoded field (tag + length + value)
    /// relative to the buffer handed to the reader
    pub encoded: Range<usize>,
    /// Byte range of the value relative to the buffer handed to the reader
    pub value_range: Range<usize>,
}

/// Parse a BER-TLV tag from the start of `buf`.
///
/// Returns the tag and the number of bytes consumed. A first byte whose low
/// five bits are all set introduces a two-byte tag.
pub fn parse_tag(buf: &[u8]) -> Result<(u16, usize)> {
    let &first = buf.first().ok_or(Error::TlvTruncated)?;
    if first & MULTI_BYTE_TAG == MULTI_BYTE_TAG {
        let &second = buf.get(1).ok_or(Error::TlvTruncated)?;
        Ok((u16::from_be_bytes([first, second]), 2))
    } else {
        Ok((first as u16, 1))
    }
}

/// Parse a BER-TLV length from the start of `buf`.
///
/// Returns the value length and the number of bytes consumed. Fails with
/// [`Error::TlvLengthOverflow`] if the declared value would run past the end
/// of `buf`; this check is unconditional.
pub fn parse_length(buf: &[u8]) -> Result<(usize, usize)> {
    let &first = buf.first().ok_or(Error::TlvTruncated)?;

    let (length, consumed) = if first & 0x80 == 0 {
        (first as usize, 1)
    } else {
        let num_bytes = (first & 0x7F) as usize;
        if num_bytes == 0 || num_bytes > 2 {
            return Err(Error::InvalidFormat("unsupported TLV length encoding"));
        }
        let length_bytes = buf.get(1..1 + num_bytes).ok_or(Error::TlvTruncated)?;
        let mut length = 0usize;
        for &b in length_bytes {
            length = (length << 8) | b as usize;
        }
        (length, 1 + num_bytes)
    };

    if consumed + length > buf.len() {
        return Err(Error::TlvLengthOverflow);
    }

    Ok((length, consumed))
}

/// Cursor yielding successive TLV fields from a byte slice.
#[derive(Debug)]
pub struct TlvReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TlvReader<'a> {
    /// Create a reader over the full buffer
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Whether all input has been consumed
    pub const fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Decode the next field, or `None` at end of input.
    pub fn next_field(&mut self) -> Option<Result<TlvField<'a>>> {
        if self.is_empty() {
            return None;
        }
        Some(self.read_field())
    }

    /// Decode the next field and fail unless it carries `expected` as tag.
    pub fn expect_field(&mut self, expected: u16) -> Result<TlvField<'a>> {
        let field = self.read_field()?;
        if field.tag != expected {
            return Err(Error::UnexpectedTag {
                expected,
                actual: field.tag,
            });
        }
        Ok(field)
    }

    fn read_field(&mut self) -> Result<TlvField<'a>> {
        let start = self.pos;
        let (tag, tag_len) = parse_tag(&self.buf[start..])?;
        let (length, len_len) = parse_length(&self.buf[start + tag_len..])?;

        let value_start = start + tag_len + len_len;
        let value_end = value_start + length;
        // parse_length already proved value_end <= buf.len()
        let field = TlvField {
            tag,
            value: &self.buf[value_start..value_end],
            encoded: start..value_end,
            value_range: value_start..value_end,
        };
        self.pos = value_end;
        Ok(field)
    }
}

/// Append the BER-TLV encoding of `tag`/`value` to `out`.
///
/// Values must fit the two length bytes this encoding supports.
pub fn encode(tag: u16, value: &[u8], out: &mut BytesMut) {
    debug_assert!(
        value.len() <= u16::MAX as usize,
        "TLV value exceeds two length bytes"
    );

    if tag > 0xFF {
        out.put_u16(tag);
    } else {
        out.put_u8(tag as u8);
    }

    match value.len() {
        len if len < 0x80 => out.put_u8(len as u8),
        len if len <= 0xFF => {
            out.put_u8(0x81);
            out.put_u8(len as u8);
        }
        len => {
            out.put_u8(0x82);
            out.put_u16(len as u16);
        }
    }

    out.put_slice(value);
}
