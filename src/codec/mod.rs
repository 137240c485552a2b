//! MQTT 3.1.1 packet codec
//!
//! The broker session encodes with [`Encoder`] and decodes with
//! [`Decoder`]; the test broker uses the same pair from the other side.
//! Only the packets a bridging client exchanges are supported.

mod decode;
mod encode;

#[cfg(test)]
mod tests;

pub use decode::Decoder;
pub use encode::Encoder;

use crate::protocol::{DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};

/// Largest value a four byte remaining length can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Packet size limit the session applies to broker traffic
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Decode a remaining length, returning the value and the bytes it took
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value = 0u32;
    for (i, byte) in buf.iter().take(4).enumerate() {
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if buf.len() < 4 {
        Err(DecodeError::InsufficientData)
    } else {
        Err(DecodeError::InvalidRemainingLength)
    }
}

/// Encode a remaining length, returning the bytes written
pub fn write_variable_int(buf: &mut BytesMut, value: u32) -> Result<usize, EncodeError> {
    if value as usize > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }
    let mut rest = value;
    let mut written = 0;
    loop {
        let digit = (rest & 0x7F) as u8;
        rest >>= 7;
        written += 1;
        if rest == 0 {
            buf.put_u8(digit);
            return Ok(written);
        }
        buf.put_u8(digit | 0x80);
    }
}

pub fn read_u16(buf: &[u8]) -> Result<u16, DecodeError> {
    match buf {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(DecodeError::InsufficientData),
    }
}

/// Length-prefixed bytes, returning the field and its encoded size
pub fn read_binary(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    let end = 2 + read_u16(buf)? as usize;
    let field = buf.get(2..end).ok_or(DecodeError::InsufficientData)?;
    Ok((field, end))
}

/// Length-prefixed UTF-8 without NUL characters
pub fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (field, used) = read_binary(buf)?;
    let text = std::str::from_utf8(field).map_err(|_| DecodeError::InvalidUtf8)?;
    if text.contains('\0') {
        return Err(DecodeError::MalformedPacket("NUL in string"));
    }
    Ok((text, used))
}

pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::StringTooLong)?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_binary(buf, s.as_bytes())
}
