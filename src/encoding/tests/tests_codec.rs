//! Tests for the timestamp/value column codec.

use crate::encoding::EncodingError;
use crate::encoding::codec::*;

fn roundtrip(a: &[i64], precision_bits: u8) -> (MarshalType, Vec<u8>, Vec<i64>) {
    let mut buf = Vec::new();
    let (mt, first) = marshal_values(&mut buf, a, precision_bits).unwrap();
    let mut out = Vec::new();
    unmarshal_values(&mut out, &buf, mt, first, a.len()).unwrap();
    (mt, buf, out)
}

// ------------------------------------------------------------------------------------------------
// Scheme selection
// ------------------------------------------------------------------------------------------------

#[test]
fn const_array_has_no_payload() {
    let (mt, buf, out) = roundtrip(&[5, 5, 5, 5], 64);
    assert_eq!(mt, MarshalType::Const);
    assert!(buf.is_empty());
    assert_eq!(out, [5, 5, 5, 5]);
}

#[test]
fn single_item_is_const() {
    let (mt, buf, out) = roundtrip(&[-17], 64);
    assert_eq!(mt, MarshalType::Const);
    assert!(buf.is_empty());
    assert_eq!(out, [-17]);
}

#[test]
fn delta_const_stores_one_varint() {
    let (mt, buf, out) = roundtrip(&[10, 20, 30, 40], 64);
    assert_eq!(mt, MarshalType::DeltaConst);
    assert_eq!(buf, [0x14]); // zig-zag(10)
    assert_eq!(out, [10, 20, 30, 40]);
}

#[test]
fn decreasing_values_are_gauges() {
    let a = [5, 3, 8, 1, 9];
    let (mt, _, out) = roundtrip(&a, 64);
    assert_eq!(mt, MarshalType::NearestDelta);
    assert_eq!(out, a);
}

#[test]
fn growing_values_are_counters() {
    let a = [1, 2, 4, 7, 11, 16];
    let (mt, _, out) = roundtrip(&a, 64);
    assert_eq!(mt, MarshalType::NearestDelta2);
    assert_eq!(out, a);
}

#[test]
fn repetitive_payload_is_compressed() {
    let a: Vec<i64> = (0..1000).map(|i| 1_700_000_000_000 + i * 10 + i % 3).collect();
    let (mt, buf, out) = roundtrip(&a, 64);
    assert_eq!(mt, MarshalType::ZstdNearestDelta2);
    assert!(buf.len() < 200, "payload was not compressed: {} bytes", buf.len());
    assert_eq!(out, a);
}

#[test]
fn random_gauge_roundtrip_lossless() {
    use rand::Rng;
    let mut rng = rand::rng();
    let a: Vec<i64> = (0..8192).map(|_| rng.random_range(-1_000_000..1_000_000)).collect();
    let (mt, _, out) = roundtrip(&a, 64);
    assert!(matches!(mt, MarshalType::ZstdNearestDelta | MarshalType::NearestDelta));
    assert_eq!(out, a);
}

#[test]
fn extreme_values_roundtrip() {
    let a = [i64::MIN, i64::MAX, 0, i64::MAX, i64::MIN + 1];
    let (_, _, out) = roundtrip(&a, 64);
    assert_eq!(out, a);
}

// ------------------------------------------------------------------------------------------------
// Lossy precision
// ------------------------------------------------------------------------------------------------

#[test]
fn quantize_keeps_significant_bits() {
    assert_eq!(quantize(0b1011_0111, 3), 0b1010_0000);
    assert_eq!(quantize(-0b1011_0111, 3), -0b1010_0000);
    assert_eq!(quantize(7, 3), 7);
    assert_eq!(quantize(12345, 64), 12345);
    assert_eq!(quantize(i64::MIN, 1), i64::MIN);
}

#[test]
fn lossy_counter_error_is_bounded() {
    let pb = 8;
    let a: Vec<i64> = (1..500).map(|i| i * 1000 + i % 7).collect();
    let (_, _, out) = roundtrip(&a, pb);
    assert_eq!(out[0], a[0]);
    for (orig, dec) in a.iter().zip(&out) {
        let err = (orig - dec).abs();
        assert!(err <= orig.abs() >> (pb - 1), "{orig} decoded as {dec}");
    }
}

#[test]
fn lossy_timestamps_repaired_to_non_decreasing() {
    let a: Vec<i64> = (0..300).map(|i| 1_000_000 + i * 3 + (i % 2)).collect();
    let mut buf = Vec::new();
    let (mt, first) = marshal_timestamps(&mut buf, &a, 4).unwrap();
    let mut out = Vec::new();
    unmarshal_timestamps(&mut out, &buf, mt, first, a.len()).unwrap();
    ensure_non_decreasing(&mut out, a[0], a[a.len() - 1]);
    assert_eq!(out[0], a[0]);
    assert_eq!(out[out.len() - 1], a[a.len() - 1]);
    assert!(out.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn ensure_non_decreasing_clamps_both_ends() {
    let mut a = [5, 3, 7, 6, 20];
    ensure_non_decreasing(&mut a, 4, 10);
    assert_eq!(a, [4, 4, 7, 7, 10]);
}

#[test]
#[should_panic(expected = "BUG")]
fn ensure_non_decreasing_rejects_inverted_bounds() {
    let mut a = [1, 2];
    ensure_non_decreasing(&mut a, 10, 4);
}

// ------------------------------------------------------------------------------------------------
// Corruption
// ------------------------------------------------------------------------------------------------

#[test]
fn unknown_marshal_type_rejected() {
    for tag in [0u8, 7, 255] {
        let err = MarshalType::from_u8(tag).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidTag { .. }));
    }
    assert_eq!(MarshalType::from_u8(4).unwrap(), MarshalType::ZstdNearestDelta);
}

#[test]
fn const_with_trailing_data_rejected() {
    let mut out = Vec::new();
    let err = unmarshal_values(&mut out, &[1], MarshalType::Const, 5, 3).unwrap_err();
    assert!(matches!(err, EncodingError::Corrupted(_)));
}

#[test]
fn truncated_delta_payload_rejected() {
    let a = [1, 2, 4, 7, 11, 16, 300, 7000];
    let mut buf = Vec::new();
    let (mt, first) = marshal_values(&mut buf, &a, 64).unwrap();
    buf.pop();
    let mut out = Vec::new();
    assert!(unmarshal_values(&mut out, &buf, mt, first, a.len()).is_err());
}

#[test]
fn item_count_mismatch_rejected() {
    let a = [1, 2, 4, 7, 11, 16];
    let mut buf = Vec::new();
    let (mt, first) = marshal_values(&mut buf, &a, 64).unwrap();
    let mut out = Vec::new();
    let err = unmarshal_values(&mut out, &buf, mt, first, a.len() - 2).unwrap_err();
    assert!(matches!(err, EncodingError::Corrupted(_)));
}

#[test]
fn precision_bits_range() {
    assert!(check_precision_bits(0).is_err());
    assert!(check_precision_bits(65).is_err());
    assert!(check_precision_bits(1).is_ok());
    assert!(check_precision_bits(64).is_ok());
}
