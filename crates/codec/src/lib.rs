//! # Codec - key/value stream serialization
//!
//! Every component of the sieve moves keys through byte streams: the bucket
//! spills them to its side file, and the disk-backed new flow persists them in
//! segment files. A [`Serializer`] describes how one type crosses that
//! boundary.
//!
//! ## Contract
//!
//! - [`Serializer::to_stream`] writes a **self-delimiting** encoding.
//! - [`Serializer::from_stream`] is its exact inverse.
//! - [`Serializer::skip`] consumes exactly the bytes `from_stream` would,
//!   without building the value. The flush walks the side file once and skips
//!   every key that is not new, so this symmetry is load-bearing.
//!
//! ## Variable-length encoding
//!
//! ```text
//! [len: unsigned LEB128][raw bytes ...]
//! ```
//!
//! Fixed-width integers are written little-endian.
//!
//! ## Example
//!
//! ```rust
//! use codec::{Serializer, StringSerializer};
//!
//! let mut buf = Vec::new();
//! StringSerializer.to_stream(&"hello".to_string(), &mut buf).unwrap();
//! let back = StringSerializer.from_stream(&mut &buf[..]).unwrap();
//! assert_eq!(back, "hello");
//! ```

mod varint;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use thiserror::Error;

pub use varint::{read_varint, write_varint};

#[cfg(test)]
use varint::varint_len;

/// Largest length prefix accepted when decoding (256 MiB).
///
/// Anything larger is treated as a corrupted stream rather than an allocation
/// request.
pub const MAX_ENCODED_LEN: u64 = 256 * 1024 * 1024;

/// Errors raised while encoding or decoding a stream.
#[derive(Debug, Error)]
pub enum CodecError {
    /// An underlying I/O error (including a truncated stream).
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A decoded value occupied a different number of bytes than its frame
    /// declared. Indicates a serializer/deserializer mismatch.
    #[error("length mismatch: expected {expected} bytes, consumed {actual}")]
    LengthMismatch {
        /// Bytes the writer said the value occupies.
        expected: u64,
        /// Bytes the reader actually consumed.
        actual: u64,
    },

    /// A length prefix exceeded [`MAX_ENCODED_LEN`] or overflowed.
    #[error("invalid length prefix: {0}")]
    InvalidLength(u64),

    /// The bytes were not valid UTF-8 for a string key.
    #[error("invalid utf-8 in string value")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Converts values of type `T` to and from a byte stream.
///
/// Serializers are stateless objects injected into the bucket and the new
/// flow, so they take `&self` and must be shareable across threads.
pub trait Serializer<T>: Send + Sync {
    /// Writes `value` to `out` in a self-delimiting encoding.
    fn to_stream(&self, value: &T, out: &mut dyn Write) -> Result<(), CodecError>;

    /// Reads back one value previously written by [`to_stream`](Serializer::to_stream).
    fn from_stream(&self, input: &mut dyn Read) -> Result<T, CodecError>;

    /// Advances `input` past one encoded value without materializing it.
    fn skip(&self, input: &mut dyn Read) -> Result<(), CodecError>;
}

/// Reads a length prefix and checks it against [`MAX_ENCODED_LEN`].
fn read_len(input: &mut dyn Read) -> Result<u64, CodecError> {
    let len = read_varint(input)?;
    if len > MAX_ENCODED_LEN {
        return Err(CodecError::InvalidLength(len));
    }
    Ok(len)
}

fn read_prefixed(input: &mut dyn Read) -> Result<Vec<u8>, CodecError> {
    let len = read_len(input)? as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    Ok(buf)
}

/// Discards exactly `len` bytes, failing if the stream ends first.
fn discard(input: &mut dyn Read, len: u64) -> Result<(), CodecError> {
    let copied = io::copy(&mut input.take(len), &mut io::sink())?;
    if copied != len {
        return Err(CodecError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("stream ended after {} of {} bytes", copied, len),
        )));
    }
    Ok(())
}

/// Raw byte strings: `[len: LEB128][bytes]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn to_stream(&self, value: &Vec<u8>, out: &mut dyn Write) -> Result<(), CodecError> {
        write_varint(out, value.len() as u64)?;
        out.write_all(value)?;
        Ok(())
    }

    fn from_stream(&self, input: &mut dyn Read) -> Result<Vec<u8>, CodecError> {
        read_prefixed(input)
    }

    fn skip(&self, input: &mut dyn Read) -> Result<(), CodecError> {
        let len = read_len(input)?;
        discard(input, len)
    }
}

/// UTF-8 strings, encoded like [`BytesSerializer`].
#[derive(Debug, Default, Clone, Copy)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn to_stream(&self, value: &String, out: &mut dyn Write) -> Result<(), CodecError> {
        write_varint(out, value.len() as u64)?;
        out.write_all(value.as_bytes())?;
        Ok(())
    }

    fn from_stream(&self, input: &mut dyn Read) -> Result<String, CodecError> {
        Ok(String::from_utf8(read_prefixed(input)?)?)
    }

    fn skip(&self, input: &mut dyn Read) -> Result<(), CodecError> {
        let len = read_len(input)?;
        discard(input, len)
    }
}

/// Fixed-width 8-byte little-endian integers.
#[derive(Debug, Default, Clone, Copy)]
pub struct U64Serializer;

impl Serializer<u64> for U64Serializer {
    fn to_stream(&self, value: &u64, out: &mut dyn Write) -> Result<(), CodecError> {
        out.write_u64::<LittleEndian>(*value)?;
        Ok(())
    }

    fn from_stream(&self, input: &mut dyn Read) -> Result<u64, CodecError> {
        Ok(input.read_u64::<LittleEndian>()?)
    }

    fn skip(&self, input: &mut dyn Read) -> Result<(), CodecError> {
        discard(input, 8)
    }
}

/// The unit value. Writes and reads nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct VoidSerializer;

impl Serializer<()> for VoidSerializer {
    fn to_stream(&self, _value: &(), _out: &mut dyn Write) -> Result<(), CodecError> {
        Ok(())
    }

    fn from_stream(&self, _input: &mut dyn Read) -> Result<(), CodecError> {
        Ok(())
    }

    fn skip(&self, _input: &mut dyn Read) -> Result<(), CodecError> {
        Ok(())
    }
}

/// Encodes `value` into a fresh buffer.
///
/// Used where the caller needs the encoded length up front (segment framing)
/// or wants to hash the serialized form.
pub fn to_bytes<T>(serializer: &dyn Serializer<T>, value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    serializer.to_stream(value, &mut buf)?;
    Ok(buf)
}

/// Decodes one value from `bytes` and checks that it spans the whole slice.
///
/// Returns [`CodecError::LengthMismatch`] if the serializer stopped early.
pub fn from_exact_bytes<T>(serializer: &dyn Serializer<T>, bytes: &[u8]) -> Result<T, CodecError> {
    let mut rest = bytes;
    let value = serializer.from_stream(&mut rest)?;
    if !rest.is_empty() {
        return Err(CodecError::LengthMismatch {
            expected: bytes.len() as u64,
            actual: (bytes.len() - rest.len()) as u64,
        });
    }
    Ok(value)
}
