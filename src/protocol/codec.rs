//! Primitive encoding/decoding helpers for the datagram wire format.
//!
//! All multi-byte integers are big-endian.

use super::DecodeError;

type Result<T> = std::result::Result<T, DecodeError>;

/// Read a single byte from the front of `buf`.
pub fn read_u8(buf: &[u8]) -> Result<u8> {
    buf.first().copied().ok_or(DecodeError::Truncated { needed: 1 })
}

/// Read a 2-byte big-endian u16 from the front of `buf`.
pub fn read_u16(buf: &[u8]) -> Result<u16> {
    if buf.len() < 2 {
        return Err(DecodeError::Truncated { needed: 2 - buf.len() });
    }
    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}

/// Read the remainder of `buf` as a UTF-8 string.
pub fn read_str(buf: &[u8]) -> Result<&str> {
    core::str::from_utf8(buf).map_err(|_| DecodeError::InvalidUtf8)
}

/// Append a 2-byte big-endian u16.
pub fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Split a framed datagram into its message-type octet and body.
///
/// The length prefix is 1 byte, or `0x01` followed by a 2-byte length for
/// messages of 256 bytes and up. The length covers the whole datagram
/// including the prefix itself, and must equal the datagram size exactly.
pub fn read_frame(buf: &[u8]) -> Result<(u8, &[u8])> {
    if buf.is_empty() {
        return Err(DecodeError::Truncated { needed: 2 });
    }

    let (length, header_len) = if buf[0] == 0x01 {
        if buf.len() < 3 {
            return Err(DecodeError::Truncated { needed: 3 - buf.len() });
        }
        (u16::from_be_bytes([buf[1], buf[2]]) as usize, 3)
    } else {
        (buf[0] as usize, 1)
    };

    if length != buf.len() {
        return Err(DecodeError::LengthMismatch { length, actual: buf.len() });
    }
    if buf.len() < header_len + 1 {
        return Err(DecodeError::Truncated { needed: header_len + 1 - buf.len() });
    }

    Ok((buf[header_len], &buf[header_len + 1..]))
}

/// Frame a message-type octet and body into a complete datagram.
pub fn write_frame(msg_type: u8, body: &[u8]) -> Vec<u8> {
    // type octet + body, before the length prefix
    let inner = 1 + body.len();

    let mut out;
    if inner + 1 <= 0xFF {
        out = Vec::with_capacity(inner + 1);
        out.push((inner + 1) as u8);
    } else {
        out = Vec::with_capacity(inner + 3);
        out.push(0x01);
        put_u16(&mut out, (inner + 3) as u16);
    }
    out.push(msg_type);
    out.extend_from_slice(body);
    out
}
