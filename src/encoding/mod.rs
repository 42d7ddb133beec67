//! Deterministic binary encoding for on-disk part files.
//!
//! This module provides the [`Encode`] and [`Decode`] traits used for every
//! fixed-layout record stored in part files (TSIDs, block headers and
//! metaindex rows), together with zig-zag varints and zstd helpers.
//! Column payloads (timestamps and values) go through [`codec`], and the
//! float/decimal conversion lives in [`decimal`].
//!
//! # Wire format
//!
//! | Rust type          | Encoding                                     |
//! |--------------------|----------------------------------------------|
//! | `u8`               | 1 byte                                       |
//! | `u16` / `i16`      | 2 bytes, little-endian                       |
//! | `u32`              | 4 bytes, little-endian                       |
//! | `u64` / `i64`      | 8 bytes, little-endian                       |
//! | varint             | zig-zag + LEB128, 1..=10 bytes               |
//!
//! Decoders never panic on malformed input; they return [`EncodingError`].

pub(crate) mod codec;
pub(crate) mod decimal;

#[cfg(test)]
mod tests;

use thiserror::Error;

/// Maximum encoded length of a 64-bit varint.
const MAX_VARINT_LEN: usize = 10;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// An enum discriminant was not recognised.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag {
        /// The tag value that was read.
        tag: u32,
        /// The Rust type being decoded.
        type_name: &'static str,
    },

    /// Decoded data violates a structural invariant.
    #[error("corrupted data: {0}")]
    Corrupted(String),

    /// zstd compression or decompression failed.
    #[error("zstd error: {0}")]
    Zstd(#[source] std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// A fixed-layout record that can be appended to a byte buffer. Equal
/// values always encode to equal bytes.
pub trait Encode {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// The inverse of [`Encode`]: reads one value from the start of `buf` and
/// reports how many bytes it took.
pub trait Decode: Sized {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

// ------------------------------------------------------------------------------------------------
// Convenience functions
// ------------------------------------------------------------------------------------------------

pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

/// Fails with [`EncodingError::UnexpectedEof`] when `buf` is shorter than
/// `needed`.
#[inline]
pub(crate) fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Fixed-width integers
// ------------------------------------------------------------------------------------------------

macro_rules! impl_fixed_int {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Encode for $ty {
                #[inline]
                fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
                    buf.extend_from_slice(&self.to_le_bytes());
                    Ok(())
                }
            }

            impl Decode for $ty {
                #[inline]
                fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
                    const N: usize = std::mem::size_of::<$ty>();
                    require(buf, N)?;
                    let mut bytes = [0u8; N];
                    bytes.copy_from_slice(&buf[..N]);
                    Ok((<$ty>::from_le_bytes(bytes), N))
                }
            }
        )*
    };
}

impl_fixed_int!(u16, u32, u64, i16, i64);

impl Encode for u8 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(*self);
        Ok(())
    }
}

impl Decode for u8 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        Ok((buf[0], 1))
    }
}

// ------------------------------------------------------------------------------------------------
// Varints
// ------------------------------------------------------------------------------------------------

/// Append `v` as an unsigned LEB128 varint.
pub fn append_varint_u64(dst: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        dst.push((v as u8) | 0x80);
        v >>= 7;
    }
    dst.push(v as u8);
}

/// Read an unsigned LEB128 varint from the start of `src`.
pub fn read_varint_u64(src: &[u8]) -> Result<(u64, usize), EncodingError> {
    let mut v = 0u64;
    for (i, &b) in src.iter().enumerate().take(MAX_VARINT_LEN) {
        v |= u64::from(b & 0x7f) << (7 * i as u32);
        if b < 0x80 {
            if i == MAX_VARINT_LEN - 1 && b > 1 {
                return Err(EncodingError::Corrupted("varint overflows u64".into()));
            }
            return Ok((v, i + 1));
        }
    }
    if src.len() >= MAX_VARINT_LEN {
        return Err(EncodingError::Corrupted("varint is too long".into()));
    }
    Err(EncodingError::UnexpectedEof {
        needed: src.len() + 1,
        available: src.len(),
    })
}

/// Append `v` as a zig-zag encoded varint.
#[inline]
pub fn append_varint_i64(dst: &mut Vec<u8>, v: i64) {
    append_varint_u64(dst, ((v << 1) ^ (v >> 63)) as u64);
}

/// Read a zig-zag encoded varint from the start of `src`.
#[inline]
pub fn read_varint_i64(src: &[u8]) -> Result<(i64, usize), EncodingError> {
    let (u, n) = read_varint_u64(src)?;
    Ok((((u >> 1) as i64) ^ -((u & 1) as i64), n))
}

// ------------------------------------------------------------------------------------------------
// zstd
// ------------------------------------------------------------------------------------------------

/// Compress `src` with the given zstd level and append the frame to `dst`.
pub fn compress_zstd(dst: &mut Vec<u8>, src: &[u8], level: i32) -> Result<(), EncodingError> {
    let compressed = zstd::bulk::compress(src, level).map_err(EncodingError::Zstd)?;
    dst.extend_from_slice(&compressed);
    Ok(())
}

/// Decompress a single zstd frame.
pub fn decompress_zstd(src: &[u8]) -> Result<Vec<u8>, EncodingError> {
    zstd::stream::decode_all(src).map_err(EncodingError::Zstd)
}
