//! Conversion between `f64` samples and scaled decimal integers.
//!
//! A block stores its values as `v * 10^scale` with one shared `scale`, which
//! makes the delta codecs effective for floats with few decimal digits.
//! Infinities and the Prometheus staleness marker are mapped to reserved
//! integers at both ends of the `i64` range and are never rescaled.

/// Reserved integer for `+Inf`.
pub const V_INF_POS: i64 = i64::MAX;
/// Reserved integer for `-Inf`.
pub const V_INF_NEG: i64 = i64::MIN;
/// Reserved integer for the staleness marker.
pub const V_STALE_NAN: i64 = i64::MAX - 1;
/// Largest ordinary value.
pub const V_MAX: i64 = i64::MAX - 2;
/// Smallest ordinary value.
pub const V_MIN: i64 = i64::MIN + 1;

/// Bit pattern of the Prometheus staleness marker.
pub const STALE_NAN_BITS: u64 = 0x7ff0_0000_0000_0002;

const CONVERSION_PRECISION: f64 = 1e12;

const DECIMAL_MULTIPLIERS: [i64; 19] = [
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
    10_000_000_000,
    100_000_000_000,
    1_000_000_000_000,
    10_000_000_000_000,
    100_000_000_000_000,
    1_000_000_000_000_000,
    10_000_000_000_000_000,
    100_000_000_000_000_000,
    1_000_000_000_000_000_000,
];

/// The staleness marker as a float.
#[inline]
pub fn stale_nan() -> f64 {
    f64::from_bits(STALE_NAN_BITS)
}

#[inline]
pub fn is_stale_nan(f: f64) -> bool {
    f.to_bits() == STALE_NAN_BITS
}

#[inline]
fn is_special_value(v: i64) -> bool {
    !(V_MIN..=V_MAX).contains(&v)
}

/// Returns `v * 10^e` as a float.
pub fn to_float(v: i64, e: i16) -> f64 {
    if is_special_value(v) {
        return special_to_float(v);
    }
    let f = v as f64;
    if e < 0 {
        f / 10f64.powi(-i32::from(e))
    } else {
        f * 10f64.powi(i32::from(e))
    }
}

fn special_to_float(v: i64) -> f64 {
    match v {
        V_INF_POS => f64::INFINITY,
        V_INF_NEG => f64::NEG_INFINITY,
        _ => stale_nan(),
    }
}

/// Appends `v * 10^e` for every `v` in `va` to `dst`.
pub fn append_decimal_to_float(dst: &mut Vec<f64>, va: &[i64], e: i16) {
    dst.reserve(va.len());
    if e == 0 {
        dst.extend(va.iter().map(|&v| if is_special_value(v) { special_to_float(v) } else { v as f64 }));
        return;
    }
    // Dividing by a positive power keeps more precision than multiplying
    // by a negative one.
    if e < 0 {
        let e10 = 10f64.powi(-i32::from(e));
        dst.extend(va.iter().map(|&v| if is_special_value(v) { special_to_float(v) } else { v as f64 / e10 }));
    } else {
        let e10 = 10f64.powi(i32::from(e));
        dst.extend(va.iter().map(|&v| if is_special_value(v) { special_to_float(v) } else { v as f64 * e10 }));
    }
}

/// Converts `src` to integers sharing one exponent, appends them to `dst`
/// and returns that exponent.
///
/// NaN values other than the staleness marker must be filtered out by the
/// caller.
pub fn append_float_to_decimal(dst: &mut Vec<i64>, src: &[f64]) -> i16 {
    if src.is_empty() {
        return 0;
    }
    if src.iter().all(|&f| f == 0.0) {
        dst.extend(std::iter::repeat_n(0, src.len()));
        return 0;
    }

    let mut va = Vec::with_capacity(src.len());
    let mut ea = Vec::with_capacity(src.len());
    let mut min_exp = i16::MAX;
    for &f in src {
        let (v, e) = from_float(f);
        va.push(v);
        ea.push(e);
        if e < min_exp && !is_special_value(v) {
            min_exp = e;
        }
    }

    if min_exp == i16::MAX {
        // Only special values.
        dst.extend_from_slice(&va);
        return 0;
    }

    // Every item must be up-scalable to the common exponent without overflow.
    let mut down_exp = 0i16;
    for (&v, &e) in va.iter().zip(&ea) {
        let up_exp = e.saturating_sub(min_exp);
        let overflow = up_exp.saturating_sub(max_up_exponent(v));
        if overflow > down_exp {
            down_exp = overflow;
        }
    }
    min_exp = min_exp.saturating_add(down_exp);

    dst.reserve(va.len());
    for (&v, &e) in va.iter().zip(&ea) {
        if is_special_value(v) {
            dst.push(v);
            continue;
        }
        let mut v = v;
        let mut adj = i32::from(e) - i32::from(min_exp);
        while adj > 0 {
            v *= 10;
            adj -= 1;
        }
        while adj < 0 && v != 0 {
            v /= 10;
            adj += 1;
        }
        dst.push(v);
    }
    min_exp
}

/// Brings `a` (exponent `ae`) and `b` (exponent `be`) to a common exponent
/// in place and returns it.
pub fn calibrate_scale(a: &mut [i64], ae: i16, b: &mut [i64], be: i16) -> i16 {
    if ae == be {
        return ae;
    }
    if a.is_empty() {
        return be;
    }
    if b.is_empty() {
        return ae;
    }
    let (a, ae, b, be) = if ae < be { (b, be, a, ae) } else { (a, ae, b, be) };

    let mut up_exp = ae.saturating_sub(be);
    let mut down_exp = 0i16;
    for &v in a.iter() {
        let overflow = up_exp.saturating_sub(max_up_exponent(v));
        if overflow > down_exp {
            down_exp = overflow;
        }
    }
    up_exp -= down_exp;

    if up_exp > 0 {
        let m = decimal_multiplier(up_exp);
        for v in a.iter_mut().filter(|v| !is_special_value(**v)) {
            *v = v.wrapping_mul(m);
        }
    }
    if down_exp > 0 {
        if down_exp > 18 {
            for v in b.iter_mut().filter(|v| !is_special_value(**v)) {
                *v = 0;
            }
        } else {
            let m = decimal_multiplier(down_exp);
            for v in b.iter_mut().filter(|v| !is_special_value(**v)) {
                *v /= m;
            }
        }
    }
    be + down_exp
}

fn decimal_multiplier(exp: i16) -> i64 {
    usize::try_from(exp)
        .ok()
        .and_then(|i| DECIMAL_MULTIPLIERS.get(i).copied())
        .unwrap_or(1)
}

/// Largest `k` such that `v * 10^k` fits into an ordinary value.
pub fn max_up_exponent(v: i64) -> i16 {
    if v == 0 || is_special_value(v) {
        return 1024;
    }
    let Some(v) = v.checked_abs() else {
        return 0;
    };
    for k in (1..=18i16).rev() {
        if v <= i64::MAX / DECIMAL_MULTIPLIERS[k as usize] {
            return k;
        }
    }
    0
}

/// Converts `f` to `(v, e)` with `f = v * 10^e`, minimizing `|v|`.
pub fn from_float(f: f64) -> (i64, i16) {
    if f == 0.0 {
        return (0, 0);
    }
    if is_stale_nan(f) {
        return (V_STALE_NAN, 0);
    }
    if f.is_infinite() {
        return if f > 0.0 { (V_INF_POS, 0) } else { (V_INF_NEG, 0) };
    }
    if f > 0.0 {
        let (v, e) = positive_float_to_decimal(f);
        return (v.min(V_MAX), e);
    }
    let (v, e) = positive_float_to_decimal(-f);
    ((-v).max(V_MIN), e)
}

fn positive_float_to_decimal(f: f64) -> (i64, i16) {
    let u = f as u64;
    if u as f64 != f {
        return positive_float_to_decimal_slow(f);
    }
    if u < (1 << 55) && u % 10 != 0 {
        return (u as i64, 0);
    }
    decimal_and_scale(u)
}

fn decimal_and_scale(mut u: u64) -> (i64, i16) {
    let mut scale = 0i16;
    // Only 53 significant bits survive the float conversion.
    while u >= (1 << 55) {
        u /= 10;
        scale += 1;
    }
    while u != 0 && u % 10 == 0 {
        u /= 10;
        scale += 1;
    }
    (u as i64, scale)
}

fn positive_float_to_decimal_slow(mut f: f64) -> (i64, i16) {
    let mut scale = 0i16;
    let mut prec = CONVERSION_PRECISION;
    if !(1e-6..=1e6).contains(&f) {
        if f > 1e6 {
            prec = 1e15;
        }
        let exp = frexp_exponent(f).clamp(-1022, 1023);
        scale = (f64::from(exp) * (std::f64::consts::LN_2 / std::f64::consts::LN_10)) as i16;
        f *= 10f64.powi(-i32::from(scale));
    }

    // Multiply by 100 until the fractional part is negligible.
    while f < prec {
        let x = f.trunc();
        let frac = f - x;
        if frac * prec < x {
            f = x;
            break;
        }
        if (1.0 - frac) * prec < x {
            f = x + 1.0;
            break;
        }
        f *= 100.0;
        scale -= 2;
    }
    let mut u = f as u64;
    if u % 10 != 0 {
        return (u as i64, scale);
    }
    u /= 10;
    scale += 1;
    (u as i64, scale)
}

/// Binary exponent `e` such that `f = m * 2^e` with `0.5 <= m < 1`.
fn frexp_exponent(f: f64) -> i32 {
    let bits = f.to_bits();
    let raw = ((bits >> 52) & 0x7ff) as i32;
    if raw == 0 {
        // Subnormal: normalize first.
        return frexp_exponent(f * 2f64.powi(54)) - 54;
    }
    raw - 1022
}
