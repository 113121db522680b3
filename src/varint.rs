//! Base-128 unsigned integers, least-significant group first.
//!
//! Every byte but the last has its high bit set. `255` is `[0xff, 0x01]`.

use crate::error::{Error, Result};
use byteorder::ReadBytesExt;
use std::io;

/// Longest possible encoding of a `u64`.
pub const MAX_LEN: usize = 10;

/// Append the encoding of `value` to `buf`.
pub fn write(mut value: u64, buf: &mut Vec<u8>) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

pub fn encode(value: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_LEN);
    write(value, &mut buf);
    buf
}

/// Number of bytes `value` takes up once encoded.
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Decode a varint from the start of `bytes`, returning the value and the number of bytes
/// consumed.
pub fn decode(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut rest = bytes;
    let value = read(&mut rest)?;
    Ok((value, bytes.len() - rest.len()))
}

/// Read a varint from a reader, leaving it positioned just past the terminating byte.
pub fn read<R: io::Read>(reader: &mut R) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = match reader.read_u8() {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(Error::Format("varint ended before its last byte".into()))
            }
            Err(e) => return Err(e.into()),
        };
        let group = (byte & 0x7F) as u64;
        if shift >= 64 || (shift == 63 && group > 1) {
            return Err(Error::Format("varint larger than a u64".into()));
        }
        value |= group << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}
