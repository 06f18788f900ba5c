//! Codec utilities for TDS protocol encoding and decoding.
//!
//! Low-level helpers for the UTF-16LE strings and variable-length blobs that
//! appear inside login feature data.

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;
use crate::prelude::*;

/// Largest blob length that fits in the one-byte short form.
const SHORT_BLOB_MAX: usize = 0xFE;

/// Marker byte announcing a four-byte little-endian blob length.
const LONG_BLOB_MARKER: u8 = 0xFF;

/// Read a length-prefixed UTF-16LE string.
///
/// The format is: 1-byte length (in characters) followed by UTF-16LE bytes.
pub fn read_b_varchar(src: &mut impl Buf) -> Option<String> {
    if src.remaining() < 1 {
        return None;
    }
    let len = src.get_u8() as usize;
    read_utf16_string(src, len)
}

/// Read a UTF-16LE string of specified character length.
pub fn read_utf16_string(src: &mut impl Buf, char_count: usize) -> Option<String> {
    let byte_count = char_count * 2;
    if src.remaining() < byte_count {
        return None;
    }

    let mut chars = Vec::with_capacity(char_count);
    for _ in 0..char_count {
        chars.push(src.get_u16_le());
    }

    String::from_utf16(&chars).ok()
}

/// Number of UTF-16 code units in `s`, checked against the one-byte limit.
pub fn identifier_char_count(s: &str) -> Result<u8, ProtocolError> {
    let len = s.encode_utf16().count();
    u8::try_from(len).map_err(|_| ProtocolError::IdentifierTooLong { len })
}

/// Encoded size of an identifier: the count byte plus two bytes per code unit.
///
/// An absent identifier is written as a zero count.
pub fn identifier_len(s: Option<&str>) -> Result<usize, ProtocolError> {
    match s {
        Some(s) => Ok(1 + identifier_char_count(s)? as usize * 2),
        None => Ok(1),
    }
}

/// Write a one-byte-counted UTF-16LE identifier.
///
/// Unlike a plain `B_VARCHAR`, an identifier longer than 255 code units is
/// refused rather than truncated, so the byte count stays predictable.
pub fn write_identifier(dst: &mut impl BufMut, s: Option<&str>) -> Result<(), ProtocolError> {
    match s {
        Some(s) => {
            dst.put_u8(identifier_char_count(s)?);
            write_utf16_string(dst, s);
        }
        None => dst.put_u8(0),
    }
    Ok(())
}

/// Write a UTF-16LE string without length prefix.
pub fn write_utf16_string(dst: &mut impl BufMut, s: &str) {
    for c in s.encode_utf16() {
        dst.put_u16_le(c);
    }
}

/// Encoded size of a variable-length blob prefix for `len` data bytes.
#[must_use]
pub const fn blob_prefix_len(len: usize) -> usize {
    if len <= SHORT_BLOB_MAX { 1 } else { 5 }
}

/// Write a blob length prefix: one byte below 255, otherwise `0xFF`
/// followed by a little-endian DWORD.
pub fn write_blob_len(dst: &mut impl BufMut, len: usize) {
    if len <= SHORT_BLOB_MAX {
        dst.put_u8(len as u8);
    } else {
        dst.put_u8(LONG_BLOB_MARKER);
        dst.put_u32_le(len as u32);
    }
}

/// Read a blob length prefix written by [`write_blob_len`].
pub fn read_blob_len(src: &mut impl Buf) -> Option<usize> {
    if !src.has_remaining() {
        return None;
    }
    match src.get_u8() {
        LONG_BLOB_MARKER => {
            if src.remaining() < 4 {
                return None;
            }
            Some(src.get_u32_le() as usize)
        }
        short => Some(short as usize),
    }
}

/// Calculate the byte length of a UTF-16 encoded string.
#[must_use]
pub fn utf16_byte_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_identifier_roundtrip() {
        let original = "master";
        let mut buf = BytesMut::new();
        write_identifier(&mut buf, Some(original)).unwrap();
        assert_eq!(buf.len(), identifier_len(Some(original)).unwrap());

        let mut cursor = buf.freeze();
        assert_eq!(read_b_varchar(&mut cursor).unwrap(), original);
    }

    #[test]
    fn test_absent_identifier_is_zero_count() {
        let mut buf = BytesMut::new();
        write_identifier(&mut buf, None).unwrap();
        assert_eq!(&buf[..], &[0x00]);
        assert_eq!(identifier_len(None).unwrap(), 1);
    }

    #[test]
    fn test_identifier_too_long() {
        let name = "x".repeat(256);
        let mut buf = BytesMut::new();
        let err = write_identifier(&mut buf, Some(&name)).unwrap_err();
        assert_eq!(err, ProtocolError::IdentifierTooLong { len: 256 });
        assert!(identifier_len(Some(&"y".repeat(255))).is_ok());
    }

    #[test]
    fn test_blob_len_forms() {
        let mut buf = BytesMut::new();
        write_blob_len(&mut buf, 254);
        assert_eq!(&buf[..], &[0xFE]);
        assert_eq!(blob_prefix_len(254), 1);

        buf.clear();
        write_blob_len(&mut buf, 255);
        assert_eq!(&buf[..], &[0xFF, 0xFF, 0x00, 0x00, 0x00]);
        assert_eq!(blob_prefix_len(255), 5);

        let mut cursor = buf.freeze();
        assert_eq!(read_blob_len(&mut cursor), Some(255));
    }

    #[test]
    fn test_utf16_byte_len() {
        assert_eq!(utf16_byte_len("Hello"), 10);
        assert_eq!(utf16_byte_len("世界"), 4);
    }
}
