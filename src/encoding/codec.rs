//! Column codec for block timestamps and values.
//!
//! Both columns are arrays of `i64` (values are already in the scaled
//! decimal form produced by [`super::decimal`]). Each array is encoded
//! with the cheapest of several schemes and the chosen scheme is recorded
//! as a [`MarshalType`] tag in the block header:
//!
//! - constant arrays store no payload at all,
//! - arrays with a constant step store one varint,
//! - gauges use nearest-delta encoding, counters nearest-delta2,
//! - delta payloads of at least [`MIN_COMPRESSIBLE_BLOCK_SIZE`] bytes are zstd-compressed
//!   unless compression saves less than 10%.
//!
//! Precision below 64 bits is lossy: each item after the first is rounded
//! towards zero to `precision_bits` significant bits before delta encoding.

use super::{
    EncodingError, append_varint_i64, compress_zstd, decompress_zstd, read_varint_i64,
};

/// Delta payloads shorter than this are never compressed.
pub const MIN_COMPRESSIBLE_BLOCK_SIZE: usize = 128;

/// Encoding scheme of one column of a block.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MarshalType {
    /// zstd-compressed nearest-delta2 (counters).
    ZstdNearestDelta2 = 1,
    /// First value plus one constant step.
    DeltaConst = 2,
    /// A single repeated value, no payload.
    #[default]
    Const = 3,
    /// zstd-compressed nearest-delta (gauges).
    ZstdNearestDelta = 4,
    /// Plain nearest-delta2.
    NearestDelta2 = 5,
    /// Plain nearest-delta.
    NearestDelta = 6,
}

impl MarshalType {
    /// Parse an on-disk tag.
    pub fn from_u8(tag: u8) -> Result<Self, EncodingError> {
        Ok(match tag {
            1 => Self::ZstdNearestDelta2,
            2 => Self::DeltaConst,
            3 => Self::Const,
            4 => Self::ZstdNearestDelta,
            5 => Self::NearestDelta2,
            6 => Self::NearestDelta,
            _ => {
                return Err(EncodingError::InvalidTag {
                    tag: u32::from(tag),
                    type_name: "MarshalType",
                });
            }
        })
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Returns an error unless `precision_bits` is in `1..=64`.
pub fn check_precision_bits(precision_bits: u8) -> Result<(), EncodingError> {
    if !(1..=64).contains(&precision_bits) {
        return Err(EncodingError::Corrupted(format!(
            "precision bits must be in the range [1..64]; got {precision_bits}"
        )));
    }
    Ok(())
}

/// Marshal non-decreasing timestamps. Returns the scheme and the first item.
pub fn marshal_timestamps(dst: &mut Vec<u8>, timestamps: &[i64], precision_bits: u8) -> Result<(MarshalType, i64), EncodingError> {
    marshal_int64_array(dst, timestamps, precision_bits)
}

/// Marshal scaled values. Returns the scheme and the first item.
pub fn marshal_values(dst: &mut Vec<u8>, values: &[i64], precision_bits: u8) -> Result<(MarshalType, i64), EncodingError> {
    marshal_int64_array(dst, values, precision_bits)
}

/// Decode `items_count` timestamps from `src` and append them to `dst`.
pub fn unmarshal_timestamps(
    dst: &mut Vec<i64>,
    src: &[u8],
    mt: MarshalType,
    first: i64,
    items_count: usize,
) -> Result<(), EncodingError> {
    unmarshal_int64_array(dst, src, mt, first, items_count).map_err(|e| {
        EncodingError::Corrupted(format!(
            "cannot unmarshal {items_count} timestamps from {} bytes: {e}",
            src.len()
        ))
    })
}

/// Decode `items_count` values from `src` and append them to `dst`.
pub fn unmarshal_values(
    dst: &mut Vec<i64>,
    src: &[u8],
    mt: MarshalType,
    first: i64,
    items_count: usize,
) -> Result<(), EncodingError> {
    unmarshal_int64_array(dst, src, mt, first, items_count).map_err(|e| {
        EncodingError::Corrupted(format!(
            "cannot unmarshal {items_count} values from {} bytes: {e}",
            src.len()
        ))
    })
}

fn marshal_int64_array(dst: &mut Vec<u8>, a: &[i64], precision_bits: u8) -> Result<(MarshalType, i64), EncodingError> {
    assert!(!a.is_empty(), "BUG: cannot marshal an empty array");
    if is_const(a) {
        return Ok((MarshalType::Const, a[0]));
    }
    if is_delta_const(a) {
        append_varint_i64(dst, a[1].wrapping_sub(a[0]));
        return Ok((MarshalType::DeltaConst, a[0]));
    }

    let mut payload = Vec::with_capacity(a.len() * 2);
    let (zstd_mt, plain_mt) = if is_gauge(a) {
        // Gauges lose more from coarse precision than counters do.
        let pb = if precision_bits < 6 { precision_bits + 2 } else { precision_bits };
        marshal_nearest_delta(&mut payload, a, pb);
        (MarshalType::ZstdNearestDelta, MarshalType::NearestDelta)
    } else {
        marshal_nearest_delta2(&mut payload, a, precision_bits);
        (MarshalType::ZstdNearestDelta2, MarshalType::NearestDelta2)
    };

    if payload.len() >= MIN_COMPRESSIBLE_BLOCK_SIZE {
        let orig_len = dst.len();
        compress_zstd(dst, &payload, compress_level(a.len()))?;
        if (dst.len() - orig_len) as f64 <= 0.9 * payload.len() as f64 {
            return Ok((zstd_mt, a[0]));
        }
        dst.truncate(orig_len);
    }
    dst.extend_from_slice(&payload);
    Ok((plain_mt, a[0]))
}

fn unmarshal_int64_array(
    dst: &mut Vec<i64>,
    src: &[u8],
    mt: MarshalType,
    first: i64,
    items_count: usize,
) -> Result<(), EncodingError> {
    dst.reserve(items_count);
    match mt {
        MarshalType::ZstdNearestDelta => {
            let plain = decompress_zstd(src)?;
            unmarshal_nearest_delta(dst, &plain, first, items_count)
        }
        MarshalType::ZstdNearestDelta2 => {
            let plain = decompress_zstd(src)?;
            unmarshal_nearest_delta2(dst, &plain, first, items_count)
        }
        MarshalType::NearestDelta => unmarshal_nearest_delta(dst, src, first, items_count),
        MarshalType::NearestDelta2 => unmarshal_nearest_delta2(dst, src, first, items_count),
        MarshalType::Const => {
            if !src.is_empty() {
                return Err(EncodingError::Corrupted(format!(
                    "unexpected data left in const encoding: {} bytes",
                    src.len()
                )));
            }
            dst.extend(std::iter::repeat_n(first, items_count));
            Ok(())
        }
        MarshalType::DeltaConst => {
            let (d, n) = read_varint_i64(src)?;
            if n < src.len() {
                return Err(EncodingError::Corrupted(format!(
                    "unexpected trailing data after delta const (d={d}): {} bytes",
                    src.len() - n
                )));
            }
            let mut v = first;
            for _ in 0..items_count {
                dst.push(v);
                v = v.wrapping_add(d);
            }
            Ok(())
        }
    }
}

/// Round `v` towards zero so that it keeps at most `precision_bits`
/// significant bits.
#[inline]
pub fn quantize(v: i64, precision_bits: u8) -> i64 {
    if precision_bits >= 64 {
        return v;
    }
    let mag = v.unsigned_abs();
    let bits = 64 - mag.leading_zeros();
    if bits <= u32::from(precision_bits) {
        return v;
    }
    let shift = bits - u32::from(precision_bits);
    let q = (mag >> shift) << shift;
    if v < 0 { (q as i64).wrapping_neg() } else { q as i64 }
}

fn marshal_nearest_delta(dst: &mut Vec<u8>, a: &[i64], precision_bits: u8) {
    let mut prev = a[0];
    for &v in &a[1..] {
        let q = quantize(v, precision_bits);
        append_varint_i64(dst, q.wrapping_sub(prev));
        prev = q;
    }
}

fn unmarshal_nearest_delta(dst: &mut Vec<i64>, src: &[u8], first: i64, items_count: usize) -> Result<(), EncodingError> {
    if items_count == 0 {
        return Err(EncodingError::Corrupted("items count must be positive".into()));
    }
    let mut v = first;
    dst.push(v);
    let mut pos = 0;
    for _ in 1..items_count {
        let (d, n) = read_varint_i64(&src[pos..])?;
        pos += n;
        v = v.wrapping_add(d);
        dst.push(v);
    }
    if pos < src.len() {
        return Err(EncodingError::Corrupted(format!(
            "unexpected {} trailing bytes after nearest delta data",
            src.len() - pos
        )));
    }
    Ok(())
}

fn marshal_nearest_delta2(dst: &mut Vec<u8>, a: &[i64], precision_bits: u8) {
    let mut prev = quantize(a[1], precision_bits);
    let mut prev_delta = prev.wrapping_sub(a[0]);
    append_varint_i64(dst, prev_delta);
    for &v in &a[2..] {
        let q = quantize(v, precision_bits);
        let d = q.wrapping_sub(prev);
        append_varint_i64(dst, d.wrapping_sub(prev_delta));
        prev_delta = d;
        prev = q;
    }
}

fn unmarshal_nearest_delta2(dst: &mut Vec<i64>, src: &[u8], first: i64, items_count: usize) -> Result<(), EncodingError> {
    if items_count < 2 {
        return Err(EncodingError::Corrupted(format!(
            "nearest delta2 needs at least 2 items; got {items_count}"
        )));
    }
    dst.push(first);
    let (mut d, mut pos) = read_varint_i64(src)?;
    let mut v = first.wrapping_add(d);
    dst.push(v);
    for _ in 2..items_count {
        let (dd, n) = read_varint_i64(&src[pos..])?;
        pos += n;
        d = d.wrapping_add(dd);
        v = v.wrapping_add(d);
        dst.push(v);
    }
    if pos < src.len() {
        return Err(EncodingError::Corrupted(format!(
            "unexpected {} trailing bytes after nearest delta2 data",
            src.len() - pos
        )));
    }
    Ok(())
}

/// Makes `a[0] == v_min`, `a[last] == v_max` and `a` non-decreasing.
///
/// Lossy precision can reorder neighbouring timestamps; this repairs them
/// within the bounds recorded in the block header.
pub fn ensure_non_decreasing(a: &mut [i64], v_min: i64, v_max: i64) {
    assert!(v_min <= v_max, "BUG: v_max cannot be smaller than v_min; got {v_max} vs {v_min}");
    let Some(first) = a.first_mut() else {
        return;
    };
    *first = v_min;
    let mut prev = v_min;
    for v in a.iter_mut().skip(1) {
        if *v < prev {
            *v = prev;
        }
        prev = *v;
    }
    for v in a.iter_mut().rev() {
        if *v <= v_max {
            break;
        }
        *v = v_max;
    }
    if let Some(last) = a.last_mut() {
        *last = v_max;
    }
}

fn is_const(a: &[i64]) -> bool {
    a.iter().all(|&v| v == a[0])
}

fn is_delta_const(a: &[i64]) -> bool {
    if a.len() < 2 {
        return false;
    }
    let d = a[1].wrapping_sub(a[0]);
    a.windows(2).all(|w| w[1].wrapping_sub(w[0]) == d)
}

/// Counters never go negative and only drop on an occasional reset; anything
/// else is treated as a gauge.
fn is_gauge(a: &[i64]) -> bool {
    if a.len() < 2 {
        return false;
    }
    if a[0] < 0 {
        return true;
    }
    let mut resets = 0usize;
    let mut prev = a[0];
    for &v in &a[1..] {
        if v < prev {
            if v < 0 || v > (prev >> 3) {
                return true;
            }
            resets += 1;
        }
        prev = v;
    }
    if resets <= 2 {
        return false;
    }
    resets > (a.len() >> 3)
}

fn compress_level(items_count: usize) -> i32 {
    match items_count {
        0..=64 => 1,
        65..=256 => 2,
        257..=1024 => 3,
        1025..=4096 => 4,
        _ => 5,
    }
}
