//! Tests for float <-> scaled decimal conversion.

use crate::encoding::decimal::*;

#[test]
fn from_float_minimizes_mantissa() {
    assert_eq!(from_float(0.0), (0, 0));
    assert_eq!(from_float(1.234), (1234, -3));
    assert_eq!(from_float(100.0), (1, 2));
    assert_eq!(from_float(-5.0), (-5, 0));
    assert_eq!(from_float(7.0), (7, 0));
}

#[test]
fn special_values_are_reserved() {
    assert_eq!(from_float(f64::INFINITY), (V_INF_POS, 0));
    assert_eq!(from_float(f64::NEG_INFINITY), (V_INF_NEG, 0));
    assert_eq!(from_float(stale_nan()), (V_STALE_NAN, 0));

    assert_eq!(to_float(V_INF_POS, 7), f64::INFINITY);
    assert_eq!(to_float(V_INF_NEG, -3), f64::NEG_INFINITY);
    assert!(is_stale_nan(to_float(V_STALE_NAN, 2)));
    assert!(!is_stale_nan(f64::NAN));
}

#[test]
fn float_roundtrip_relative_error() {
    for f in [0.1, 3.14159, -2.5e-7, 1e20, 123_456_789.0, -0.000_001_5, 42.42] {
        let (v, e) = from_float(f);
        let back = to_float(v, e);
        let rel = ((back - f) / f).abs();
        assert!(rel < 1e-12, "{f} -> ({v}, {e}) -> {back}");
    }
}

#[test]
fn append_float_to_decimal_shares_exponent() {
    let mut va = Vec::new();
    let scale = append_float_to_decimal(&mut va, &[1.5, 2.25, 10.0]);
    assert_eq!(scale, -2);
    assert_eq!(va, [150, 225, 1000]);

    let mut back = Vec::new();
    append_decimal_to_float(&mut back, &va, scale);
    assert_eq!(back, [1.5, 2.25, 10.0]);
}

#[test]
fn append_float_to_decimal_keeps_specials() {
    let mut va = Vec::new();
    let scale = append_float_to_decimal(&mut va, &[0.5, f64::INFINITY, stale_nan()]);
    assert_eq!(scale, -1);
    assert_eq!(va, [5, V_INF_POS, V_STALE_NAN]);

    let mut back = Vec::new();
    append_decimal_to_float(&mut back, &va, scale);
    assert_eq!(back[0], 0.5);
    assert_eq!(back[1], f64::INFINITY);
    assert!(is_stale_nan(back[2]));
}

#[test]
fn append_float_to_decimal_only_specials() {
    let mut va = Vec::new();
    let scale = append_float_to_decimal(&mut va, &[f64::NEG_INFINITY, stale_nan()]);
    assert_eq!(scale, 0);
    assert_eq!(va, [V_INF_NEG, V_STALE_NAN]);
}

#[test]
fn calibrate_scale_upscales_larger_exponent() {
    let mut a = vec![1, 2];
    let mut b = vec![5];
    let e = calibrate_scale(&mut a, 2, &mut b, 0);
    assert_eq!(e, 0);
    assert_eq!(a, [100, 200]);
    assert_eq!(b, [5]);
}

#[test]
fn calibrate_scale_is_symmetric() {
    let mut a = vec![5];
    let mut b = vec![1, 2];
    let e = calibrate_scale(&mut a, 0, &mut b, 2);
    assert_eq!(e, 0);
    assert_eq!(a, [5]);
    assert_eq!(b, [100, 200]);
}

#[test]
fn calibrate_scale_downscales_on_overflow() {
    let big = V_MAX / 2;
    let mut a = vec![big];
    let mut b = vec![7];
    let e = calibrate_scale(&mut a, 5, &mut b, 0);
    assert_eq!(e, 5);
    assert_eq!(a, [big]);
    assert_eq!(b, [0]);
}

#[test]
fn calibrate_scale_skips_specials() {
    let mut a = vec![3, V_STALE_NAN];
    let mut b = vec![1];
    let e = calibrate_scale(&mut a, 1, &mut b, 0);
    assert_eq!(e, 0);
    assert_eq!(a, [30, V_STALE_NAN]);
}

#[test]
fn max_up_exponent_bounds() {
    assert_eq!(max_up_exponent(0), 1024);
    assert_eq!(max_up_exponent(V_INF_POS), 1024);
    assert_eq!(max_up_exponent(1), 18);
    assert_eq!(max_up_exponent(-1), 18);
    assert_eq!(max_up_exponent(V_MAX), 0);
}
