//! Sample deduplication and age-based downsampling.
//!
//! Time is cut into fixed windows of `interval` milliseconds aligned to the
//! epoch (not to the first sample). Only the first sample observed in each
//! window survives.
//!
//! Downsampling generalizes this with a staircase of `(offset, interval)`
//! periods: samples older than `now - offset` are deduplicated with the
//! period's interval, so older data gets coarser.

use std::fmt;
use std::str::FromStr;

use super::Block;

/// Fast pre-scan: true if at least two neighbouring samples share a window.
pub fn needs_dedup(timestamps: &[i64], interval: i64) -> bool {
    if timestamps.len() < 2 || interval <= 0 {
        return false;
    }
    timestamps
        .windows(2)
        .any(|w| w[1] < bucket_end(w[0], interval))
}

#[inline]
fn bucket_end(ts: i64, interval: i64) -> i64 {
    ts.saturating_sub(ts.rem_euclid(interval)).saturating_add(interval)
}

/// Keep the first sample per window in place. Returns the number of removed
/// samples.
fn dedup_in_place<V: Copy>(timestamps: &mut Vec<i64>, values: &mut Vec<V>, interval: i64) -> usize {
    assert_eq!(
        timestamps.len(),
        values.len(),
        "BUG: timestamps and values must have equal lengths"
    );
    if !needs_dedup(timestamps, interval) {
        return 0;
    }
    let orig_len = timestamps.len();
    let mut ts_next = bucket_end(timestamps[0], interval);
    let mut dst = 1;
    for src in 1..orig_len {
        let ts = timestamps[src];
        if ts < ts_next {
            continue;
        }
        timestamps[dst] = ts;
        values[dst] = values[src];
        dst += 1;
        ts_next = ts_next.saturating_add(interval);
        if ts_next <= ts {
            // The sample jumped over one or more empty windows.
            ts_next = bucket_end(ts, interval);
        }
    }
    timestamps.truncate(dst);
    values.truncate(dst);
    orig_len - dst
}

/// Deduplicate float samples, keeping the first sample of every
/// `dedup_interval_ms` window.
///
/// `timestamps` must be sorted. Applying it twice changes nothing.
pub fn deduplicate_samples(timestamps: &mut Vec<i64>, values: &mut Vec<f64>, dedup_interval_ms: i64) -> usize {
    dedup_in_place(timestamps, values, dedup_interval_ms)
}

/// Same as [`deduplicate_samples`] for the scaled integer values blocks
/// carry while being merged.
pub fn deduplicate_samples_during_merge(timestamps: &mut Vec<i64>, values: &mut Vec<i64>, dedup_interval_ms: i64) -> usize {
    dedup_in_place(timestamps, values, dedup_interval_ms)
}

// ------------------------------------------------------------------------------------------------
// Downsampling periods
// ------------------------------------------------------------------------------------------------

/// Error returned when parsing or validating downsampling periods.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid downsampling period: {0}")]
pub struct DownsamplingError(pub String);

/// Samples older than `offset_ms` are thinned to one per `interval_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownsamplingPeriod {
    pub offset_ms: i64,
    pub interval_ms: i64,
}

impl DownsamplingPeriod {
    pub fn new(offset_ms: i64, interval_ms: i64) -> Self {
        Self {
            offset_ms,
            interval_ms,
        }
    }
}

impl fmt::Display for DownsamplingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms:{}ms", self.offset_ms, self.interval_ms)
    }
}

/// Parses `"<offset>:<interval>"`, e.g. `"30d:5m"`.
impl FromStr for DownsamplingPeriod {
    type Err = DownsamplingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (offset, interval) = s
            .split_once(':')
            .ok_or_else(|| DownsamplingError(format!("{s:?} must have the form offset:interval")))?;
        let offset_ms = parse_duration_ms(offset)?;
        let interval_ms = parse_duration_ms(interval)?;
        if interval_ms <= 0 {
            return Err(DownsamplingError(format!("interval in {s:?} must be positive")));
        }
        if offset_ms < 0 {
            return Err(DownsamplingError(format!("offset in {s:?} cannot be negative")));
        }
        Ok(Self::new(offset_ms, interval_ms))
    }
}

fn parse_duration_ms(s: &str) -> Result<i64, DownsamplingError> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| DownsamplingError(format!("duration {s:?} lacks a unit")))?;
    let (num, unit) = s.split_at(split);
    let n: i64 = num
        .parse()
        .map_err(|_| DownsamplingError(format!("cannot parse duration {s:?}")))?;
    let mult = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        "y" => 365 * 86_400_000,
        _ => return Err(DownsamplingError(format!("unknown duration unit {unit:?} in {s:?}"))),
    };
    n.checked_mul(mult)
        .ok_or_else(|| DownsamplingError(format!("duration {s:?} is too large")))
}

/// Sort periods by decreasing offset and check that they form a clean
/// staircase: unique offsets, and every newer interval strictly smaller
/// than and a divisor of the older one.
pub fn validate_downsampling_periods(periods: &mut [DownsamplingPeriod]) -> Result<(), DownsamplingError> {
    periods.sort_by(|a, b| b.offset_ms.cmp(&a.offset_ms));
    for w in periods.windows(2) {
        let (older, newer) = (w[0], w[1]);
        if older.offset_ms == newer.offset_ms {
            return Err(DownsamplingError(format!(
                "duplicate offset {}ms",
                older.offset_ms
            )));
        }
        if newer.interval_ms >= older.interval_ms {
            return Err(DownsamplingError(format!(
                "interval {newer} must be smaller than {older}"
            )));
        }
        if older.interval_ms % newer.interval_ms != 0 {
            return Err(DownsamplingError(format!(
                "interval of {newer} must divide the interval of {older}"
            )));
        }
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// DedupPolicy
// ------------------------------------------------------------------------------------------------

/// Effective deduplication settings of a storage.
#[derive(Debug, Clone, Default)]
pub struct DedupPolicy {
    /// Base interval applied to every sample; `0` disables it.
    pub dedup_interval_ms: i64,
    /// Periods sorted by decreasing offset.
    pub periods: Vec<DownsamplingPeriod>,
}

impl DedupPolicy {
    pub fn new(dedup_interval_ms: i64, periods: Vec<DownsamplingPeriod>) -> Self {
        Self {
            dedup_interval_ms,
            periods,
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.dedup_interval_ms > 0 || !self.periods.is_empty()
    }

    /// True if a block starting at `min_timestamp` reaches into a
    /// downsampling period, so a marshaled copy of it must be decoded.
    pub fn needs_downsampling(&self, min_timestamp: i64, now_ms: i64) -> bool {
        self.periods
            .last()
            .is_some_and(|p| min_timestamp < now_ms.saturating_sub(p.offset_ms))
    }

    /// Apply the staircase to sorted samples in place. Returns the number
    /// of removed samples.
    pub fn apply<V: Copy>(&self, timestamps: &mut Vec<i64>, values: &mut Vec<V>, now_ms: i64) -> usize {
        if self.periods.is_empty() {
            return dedup_in_place(timestamps, values, self.dedup_interval_ms);
        }
        let orig_len = timestamps.len();
        let mut out_ts = Vec::with_capacity(orig_len);
        let mut out_vals = Vec::with_capacity(orig_len);
        let mut start = 0;
        for p in &self.periods {
            let boundary = now_ms.saturating_sub(p.offset_ms);
            let end = start + timestamps[start..].partition_point(|&ts| ts < boundary);
            self.dedup_segment(timestamps, values, start..end, p.interval_ms, &mut out_ts, &mut out_vals);
            start = end;
        }
        let end = timestamps.len();
        self.dedup_segment(timestamps, values, start..end, 0, &mut out_ts, &mut out_vals);
        *timestamps = out_ts;
        *values = out_vals;
        orig_len - timestamps.len()
    }

    fn dedup_segment<V: Copy>(
        &self,
        timestamps: &[i64],
        values: &[V],
        range: std::ops::Range<usize>,
        interval: i64,
        out_ts: &mut Vec<i64>,
        out_vals: &mut Vec<V>,
    ) {
        if range.is_empty() {
            return;
        }
        let mut ts = timestamps[range.clone()].to_vec();
        let mut vals = values[range].to_vec();
        dedup_in_place(&mut ts, &mut vals, interval.max(self.dedup_interval_ms));
        out_ts.extend_from_slice(&ts);
        out_vals.extend_from_slice(&vals);
    }
}

impl Block {
    /// Apply `policy` to the unconsumed rows of a raw block. Marshaled
    /// blocks are left untouched. Returns the number of removed rows.
    pub fn deduplicate_samples_during_merge(&mut self, policy: &DedupPolicy, now_ms: i64) -> usize {
        if !policy.is_enabled() || self.is_marshaled() {
            return 0;
        }
        let mut timestamps = self.timestamps.split_off(self.next_idx);
        let mut values = self.values.split_off(self.next_idx);
        let removed = if policy.periods.is_empty() {
            deduplicate_samples_during_merge(&mut timestamps, &mut values, policy.dedup_interval_ms)
        } else {
            policy.apply(&mut timestamps, &mut values, now_ms)
        };
        self.timestamps.append(&mut timestamps);
        self.values.append(&mut values);
        if removed > 0 {
            self.fixup_timestamps();
        }
        removed
    }
}
