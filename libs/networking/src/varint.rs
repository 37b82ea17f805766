//! Minecraft wire primitives.
//!
//! Wire format:
//! - VarInt: 1 to 5 bytes, 7 data bits per byte, high bit set on every
//!   byte but the last, little-endian groups, folded into an `i32`
//! - String: VarInt byte length followed by UTF-8 bytes
//! - Unsigned short: 2 bytes big-endian
//! - Packet: VarInt length of (packet id + body), VarInt packet id, body
//!
//! Decoding works on any [`bytes::Buf`], which includes `&[u8]` cursors.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Longest encoding of a 32-bit VarInt.
pub const MAX_VARINT_LEN: usize = 5;

/// Wire decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// VarInt continued past five bytes.
    #[error("varint is too big")]
    VarIntTooBig,

    /// Buffer ended in the middle of a field.
    #[error("unexpected end of packet")]
    UnexpectedEnd,

    /// Length prefix was negative.
    #[error("negative length prefix: {0}")]
    NegativeLength(i32),

    /// String longer than the field allows.
    #[error("string of {len} bytes exceeds limit of {max}")]
    StringTooLong { len: usize, max: usize },

    /// String bytes are not valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
}

/// Number of bytes `value` takes on the wire.
pub fn varint_len(value: i32) -> usize {
    let value = value as u32;
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0x0fff_ffff => 4,
        _ => 5,
    }
}

/// Append `value` as a VarInt.
pub fn put_varint<B: BufMut + ?Sized>(buf: &mut B, value: i32) {
    let mut value = value as u32;
    loop {
        if value & !0x7f == 0 {
            buf.put_u8(value as u8);
            return;
        }
        buf.put_u8((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
}

/// Decode a VarInt from the front of `buf`.
pub fn get_varint<B: Buf + ?Sized>(buf: &mut B) -> Result<i32, WireError> {
    let mut value: u32 = 0;
    for index in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(WireError::UnexpectedEnd);
        }
        let byte = buf.get_u8();
        value |= u32::from(byte & 0x7f) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(WireError::VarIntTooBig)
}

/// Try to decode a VarInt from a possibly incomplete prefix.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the value and
/// the number of bytes it used.
pub fn decode_varint_prefix(prefix: &[u8]) -> Result<Option<(i32, usize)>, WireError> {
    let mut cursor = prefix;
    match get_varint(&mut cursor) {
        Ok(value) => Ok(Some((value, prefix.len() - cursor.len()))),
        Err(WireError::UnexpectedEnd) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Decode a length-prefixed string, enforcing `max_len` bytes when given.
pub fn get_string<B: Buf + ?Sized>(buf: &mut B, max_len: Option<usize>) -> Result<String, WireError> {
    let len = get_varint(buf)?;
    let len = usize::try_from(len).map_err(|_| WireError::NegativeLength(len))?;
    if let Some(max) = max_len {
        if len > max {
            return Err(WireError::StringTooLong { len, max });
        }
    }
    if buf.remaining() < len {
        return Err(WireError::UnexpectedEnd);
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
}

/// Append a length-prefixed string.
pub fn put_string<B: BufMut + ?Sized>(buf: &mut B, value: &str) {
    put_varint(buf, value.len() as i32);
    buf.put_slice(value.as_bytes());
}

/// Decode a big-endian `u16`.
pub fn get_u16<B: Buf + ?Sized>(buf: &mut B) -> Result<u16, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::UnexpectedEnd);
    }
    Ok(buf.get_u16())
}

/// Decode a single byte.
pub fn get_u8<B: Buf + ?Sized>(buf: &mut B) -> Result<u8, WireError> {
    if !buf.has_remaining() {
        return Err(WireError::UnexpectedEnd);
    }
    Ok(buf.get_u8())
}

/// Decode a boolean (any non-zero byte is true).
pub fn get_bool<B: Buf + ?Sized>(buf: &mut B) -> Result<bool, WireError> {
    Ok(get_u8(buf)? != 0)
}

/// Skip `n` bytes.
pub fn skip<B: Buf + ?Sized>(buf: &mut B, n: usize) -> Result<(), WireError> {
    if buf.remaining() < n {
        return Err(WireError::UnexpectedEnd);
    }
    buf.advance(n);
    Ok(())
}

/// Skip a VarInt length-prefixed byte array.
pub fn skip_byte_array<B: Buf + ?Sized>(buf: &mut B) -> Result<(), WireError> {
    let len = get_varint(buf)?;
    let len = usize::try_from(len).map_err(|_| WireError::NegativeLength(len))?;
    skip(buf, len)
}

/// Frame `payload` (packet id + body) with its VarInt length.
pub fn put_packet<B: BufMut + ?Sized>(buf: &mut B, payload: &[u8]) {
    put_varint(buf, payload.len() as i32);
    buf.put_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, &[0x00])]
    #[case(1, &[0x01])]
    #[case(2, &[0x02])]
    #[case(127, &[0x7f])]
    #[case(128, &[0x80, 0x01])]
    #[case(255, &[0xff, 0x01])]
    #[case(25565, &[0xdd, 0xc7, 0x01])]
    #[case(2097151, &[0xff, 0xff, 0x7f])]
    #[case(2147483647, &[0xff, 0xff, 0xff, 0xff, 0x07])]
    #[case(-1, &[0xff, 0xff, 0xff, 0xff, 0x0f])]
    #[case(-2147483648, &[0x80, 0x80, 0x80, 0x80, 0x08])]
    fn test_varint_wire_bytes(#[case] value: i32, #[case] expected: &[u8]) {
        let mut encoded = Vec::new();
        put_varint(&mut encoded, value);
        assert_eq!(encoded, expected);
        assert_eq!(varint_len(value), expected.len());

        let mut cursor = expected;
        assert_eq!(get_varint(&mut cursor).unwrap(), value);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_varint_too_big() {
        let mut cursor: &[u8] = &[0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert_eq!(get_varint(&mut cursor), Err(WireError::VarIntTooBig));
    }

    #[test]
    fn test_varint_truncated() {
        let mut cursor: &[u8] = &[0x80, 0x80];
        assert_eq!(get_varint(&mut cursor), Err(WireError::UnexpectedEnd));
        assert_eq!(decode_varint_prefix(&[0x80, 0x80]), Ok(None));
        assert_eq!(decode_varint_prefix(&[0xdd, 0xc7, 0x01, 0x00]), Ok(Some((25565, 3))));
    }

    #[test]
    fn test_string_limits() {
        let mut encoded = Vec::new();
        put_string(&mut encoded, "Steve");
        let mut cursor = &encoded[..];
        assert_eq!(get_string(&mut cursor, Some(16)).unwrap(), "Steve");

        let mut cursor = &encoded[..];
        assert_eq!(
            get_string(&mut cursor, Some(4)),
            Err(WireError::StringTooLong { len: 5, max: 4 })
        );

        let mut cursor: &[u8] = &[0x05, b'a', b'b'];
        assert_eq!(get_string(&mut cursor, None), Err(WireError::UnexpectedEnd));
    }

    #[test]
    fn test_packet_framing() {
        let mut framed = Vec::new();
        put_packet(&mut framed, &[0x01, 0x00]);
        assert_eq!(framed, [0x02, 0x01, 0x00]);
    }

    proptest! {
        #[test]
        fn prop_varint_roundtrip(value in any::<i32>()) {
            let mut encoded = Vec::new();
            put_varint(&mut encoded, value);
            prop_assert_eq!(encoded.len(), varint_len(value));
            let mut cursor = &encoded[..];
            prop_assert_eq!(get_varint(&mut cursor).unwrap(), value);
        }
    }
}
