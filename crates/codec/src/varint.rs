//! Unsigned LEB128 length prefixes.
//!
//! Seven payload bits per byte, high bit set on every byte except the last.
//! A `u64` needs at most 10 bytes.

use std::io::{self, Read, Write};

/// Maximum encoded size of a `u64`.
const MAX_VARINT_BYTES: usize = 10;

/// Writes `value` as unsigned LEB128.
pub fn write_varint(out: &mut dyn Write, mut value: u64) -> io::Result<()> {
    let mut buf = [0u8; MAX_VARINT_BYTES];
    let mut n = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[n] = byte;
            n += 1;
            break;
        }
        buf[n] = byte | 0x80;
        n += 1;
    }
    out.write_all(&buf[..n])
}

/// Reads one unsigned LEB128 value.
///
/// A value longer than 10 bytes, or one whose tenth byte carries bits above
/// bit 63, is reported as `InvalidData`.
pub fn read_varint(input: &mut dyn Read) -> io::Result<u64> {
    let mut result = 0u64;
    let mut byte = [0u8; 1];
    for i in 0..MAX_VARINT_BYTES {
        input.read_exact(&mut byte)?;
        let payload = (byte[0] & 0x7f) as u64;
        if i == MAX_VARINT_BYTES - 1 && payload > 1 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "varint overflows u64"));
        }
        result |= payload << (7 * i);
        if byte[0] & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(io::Error::new(io::ErrorKind::InvalidData, "varint longer than 10 bytes"))
}

/// Number of bytes [`write_varint`] emits for `value`.
#[cfg(test)]
pub(crate) fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}
