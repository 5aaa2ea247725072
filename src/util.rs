//! # MQTT Serialization Utilities
//!
//! This module provides helper functions for reading and writing MQTT-specific data types
//! from and to byte buffers, such as variable-byte integers and length-prefixed strings.

use alloc::vec::Vec;

use crate::error::ProtocolError;

/// Largest value a four-byte variable-byte integer can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Reads a variable-byte integer from the buffer, advancing the cursor.
///
/// This is a common encoding scheme in MQTT for packet lengths.
pub fn read_variable_byte_integer(cursor: &mut usize, buf: &[u8]) -> Result<usize, ProtocolError> {
    let mut multiplier = 1;
    let mut value = 0;
    let mut i = 0;
    loop {
        let encoded_byte = buf
            .get(*cursor + i)
            .ok_or(ProtocolError::MalformedPacket)?;
        value += (encoded_byte & 127) as usize * multiplier;
        if (encoded_byte & 128) == 0 {
            break;
        }
        multiplier *= 128;
        i += 1;
        if i >= 4 {
            return Err(ProtocolError::MalformedPacket);
        }
    }
    *cursor += i + 1;
    Ok(value)
}

/// Encodes a variable-byte integer into at most four bytes.
pub fn encode_variable_byte_integer(mut val: usize) -> Result<heapless::Vec<u8, 4>, ProtocolError> {
    if val > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::PayloadTooLarge);
    }
    let mut out = heapless::Vec::new();
    loop {
        let mut encoded_byte = (val % 128) as u8;
        val /= 128;
        if val > 0 {
            encoded_byte |= 128;
        }
        out.push(encoded_byte)
            .map_err(|_| ProtocolError::PayloadTooLarge)?;
        if val == 0 {
            break;
        }
    }
    Ok(out)
}

/// Appends a variable-byte integer to the output.
pub fn write_variable_byte_integer(out: &mut Vec<u8>, val: usize) -> Result<(), ProtocolError> {
    out.extend_from_slice(&encode_variable_byte_integer(val)?);
    Ok(())
}

/// Reads a big-endian `u16`, advancing the cursor.
pub fn read_u16(cursor: &mut usize, buf: &[u8]) -> Result<u16, ProtocolError> {
    let bytes = buf
        .get(*cursor..*cursor + 2)
        .ok_or(ProtocolError::MalformedPacket)?;
    *cursor += 2;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Reads a single byte, advancing the cursor.
pub fn read_u8(cursor: &mut usize, buf: &[u8]) -> Result<u8, ProtocolError> {
    let byte = *buf.get(*cursor).ok_or(ProtocolError::MalformedPacket)?;
    *cursor += 1;
    Ok(byte)
}

/// Reads binary data prefixed with a 2-byte length.
pub fn read_binary<'a>(cursor: &mut usize, buf: &'a [u8]) -> Result<&'a [u8], ProtocolError> {
    let len = read_u16(cursor, buf)? as usize;
    let data = buf
        .get(*cursor..*cursor + len)
        .ok_or(ProtocolError::MalformedPacket)?;
    *cursor += len;
    Ok(data)
}

/// Reads a UTF-8 encoded string (prefixed with a 2-byte length) from the buffer.
pub fn read_utf8_string<'a>(cursor: &mut usize, buf: &'a [u8]) -> Result<&'a str, ProtocolError> {
    let raw = read_binary(cursor, buf)?;
    let s = core::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8String)?;
    // MQTT-1.5.3-2: the null character is not allowed in a UTF-8 string.
    if s.contains('\0') {
        return Err(ProtocolError::InvalidUtf8String);
    }
    Ok(s)
}

/// Appends binary data prefixed with a 2-byte length.
pub fn write_binary(out: &mut Vec<u8>, data: &[u8]) -> Result<(), ProtocolError> {
    let len = u16::try_from(data.len()).map_err(|_| ProtocolError::PayloadTooLarge)?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

/// Appends a UTF-8 encoded string (prefixed with a 2-byte length).
pub fn write_utf8_string(out: &mut Vec<u8>, s: &str) -> Result<(), ProtocolError> {
    write_binary(out, s.as_bytes())
}
