//! Variable Byte Integer codec for the MQTT remaining-length field.
//!
//! Seven value bits per byte, high bit set while more bytes follow. The
//! encoding is capped at 4 bytes (max value 268 435 455); a continuation
//! bit on the fourth byte is a protocol violation.

use crate::error::{ProtocolError, Result};

/// Maximum value representable in a 4-byte variable byte integer.
pub const MAX_VALUE: usize = 268_435_455;

/// Decode a variable byte integer from the front of `buf`.
///
/// Returns `Ok(Some((value, bytes_consumed)))` on success, `Ok(None)` when
/// the buffer ends before the final byte (caller must read more), and an
/// error when a fifth continuation byte appears.
///
/// # Example
/// ```
/// use wiremq_core::varint::decode;
/// let (value, consumed) = decode(&[0xAC, 0x02]).unwrap().unwrap();
/// assert_eq!((value, consumed), (300, 2));
/// ```
pub fn decode(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;
    for (i, &byte) in buf.iter().enumerate() {
        value |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        if i == 3 {
            return Err(ProtocolError::InvalidRemainingLength);
        }
    }
    // Ran out of bytes before the terminating byte.
    Ok(None)
}

/// Append a value as a variable byte integer, returning the bytes written.
pub fn encode_to_vec(mut value: u32, buf: &mut Vec<u8>) -> usize {
    let start = buf.len();
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
    buf.len() - start
}

/// Number of bytes `value` occupies once encoded.
pub fn encoded_len(mut value: u32) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}
