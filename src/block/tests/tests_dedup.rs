//! Tests for sample deduplication and downsampling.

use crate::block::dedup::*;
use crate::block::{Block, Tsid};

// ------------------------------------------------------------------------------------------------
// deduplicate_samples
// ------------------------------------------------------------------------------------------------

#[test]
fn dedup_keeps_first_sample_per_window() {
    let mut timestamps: Vec<i64> = (0..1000).collect();
    let mut values: Vec<f64> = (0..1000).map(|i| i as f64 * 0.5).collect();
    let removed = deduplicate_samples(&mut timestamps, &mut values, 100);
    assert_eq!(removed, 990);
    assert_eq!(timestamps, (0..10).map(|i| i * 100).collect::<Vec<_>>());
    assert_eq!(values, (0..10).map(|i| (i * 100) as f64 * 0.5).collect::<Vec<_>>());
}

#[test]
fn dedup_is_idempotent() {
    let mut timestamps: Vec<i64> = vec![3, 5, 99, 100, 101, 250, 251, 400, 999, 1000];
    let mut values: Vec<i64> = (0..10).collect();
    deduplicate_samples_during_merge(&mut timestamps, &mut values, 100);
    let (ts_once, vals_once) = (timestamps.clone(), values.clone());
    let removed = deduplicate_samples_during_merge(&mut timestamps, &mut values, 100);
    assert_eq!(removed, 0);
    assert_eq!(timestamps, ts_once);
    assert_eq!(values, vals_once);
    assert_eq!(ts_once, [3, 100, 250, 400, 999, 1000]);
}

#[test]
fn dedup_windows_are_aligned_to_epoch() {
    let mut timestamps = vec![-150, -120, -100, -50];
    let mut values = vec![1.0, 2.0, 3.0, 4.0];
    deduplicate_samples(&mut timestamps, &mut values, 100);
    assert_eq!(timestamps, [-150, -100]);
    assert_eq!(values, [1.0, 3.0]);
}

#[test]
fn dedup_handles_gaps() {
    let mut timestamps = vec![0, 5, 350, 360, 420];
    let mut values = vec![0.0, 1.0, 2.0, 3.0, 4.0];
    deduplicate_samples(&mut timestamps, &mut values, 100);
    assert_eq!(timestamps, [0, 350, 420]);
    assert_eq!(values, [0.0, 2.0, 4.0]);
}

#[test]
fn dedup_disabled_for_non_positive_interval() {
    let mut timestamps = vec![1, 1, 2];
    let mut values = vec![1.0, 2.0, 3.0];
    assert_eq!(deduplicate_samples(&mut timestamps, &mut values, 0), 0);
    assert_eq!(timestamps.len(), 3);
}

#[test]
fn needs_dedup_cases() {
    assert!(!needs_dedup(&[], 10));
    assert!(!needs_dedup(&[1], 10));
    assert!(!needs_dedup(&[1, 2], 0));
    assert!(needs_dedup(&[1, 2], 10));
    assert!(!needs_dedup(&[9, 11], 10));
    assert!(!needs_dedup(&[0, 10, 20], 10));
    assert!(needs_dedup(&[0, 10, 19], 10));
    assert!(needs_dedup(&[1000, 1000], 1000));
}

// ------------------------------------------------------------------------------------------------
// Downsampling periods
// ------------------------------------------------------------------------------------------------

#[test]
fn parse_downsampling_period() {
    let p: DownsamplingPeriod = "30d:5m".parse().unwrap();
    assert_eq!(p.offset_ms, 30 * 86_400_000);
    assert_eq!(p.interval_ms, 300_000);

    let p: DownsamplingPeriod = "0s:500ms".parse().unwrap();
    assert_eq!(p, DownsamplingPeriod::new(0, 500));

    assert!("30d".parse::<DownsamplingPeriod>().is_err());
    assert!("30x:5m".parse::<DownsamplingPeriod>().is_err());
    assert!("1d:0s".parse::<DownsamplingPeriod>().is_err());
    assert!("d:5m".parse::<DownsamplingPeriod>().is_err());
}

#[test]
fn validate_sorts_by_decreasing_offset() {
    let mut periods = vec![DownsamplingPeriod::new(1_000, 10), DownsamplingPeriod::new(30_000, 50)];
    validate_downsampling_periods(&mut periods).unwrap();
    assert_eq!(periods[0].offset_ms, 30_000);
    assert_eq!(periods[1].offset_ms, 1_000);
}

#[test]
fn validate_rejects_bad_staircases() {
    let mut dup = vec![DownsamplingPeriod::new(1_000, 10), DownsamplingPeriod::new(1_000, 5)];
    assert!(validate_downsampling_periods(&mut dup).is_err());

    let mut growing = vec![DownsamplingPeriod::new(1_000, 50), DownsamplingPeriod::new(30_000, 10)];
    assert!(validate_downsampling_periods(&mut growing).is_err());

    let mut not_dividing = vec![DownsamplingPeriod::new(1_000, 20), DownsamplingPeriod::new(30_000, 50)];
    assert!(validate_downsampling_periods(&mut not_dividing).is_err());
}

// ------------------------------------------------------------------------------------------------
// DedupPolicy
// ------------------------------------------------------------------------------------------------

#[test]
fn policy_applies_staircase_by_age() {
    let policy = DedupPolicy::new(0, vec![DownsamplingPeriod::new(50_000, 10_000)]);
    let now = 100_000;
    let mut timestamps: Vec<i64> = (0..100).map(|i| i * 1000).collect();
    let mut values: Vec<i64> = (0..100).collect();
    let removed = policy.apply(&mut timestamps, &mut values, now);
    assert_eq!(removed, 45);
    assert_eq!(&timestamps[..5], &[0, 10_000, 20_000, 30_000, 40_000]);
    assert_eq!(timestamps[5], 50_000);
    assert_eq!(timestamps.len(), 55);
    assert_eq!(values[1], 10);
}

#[test]
fn policy_base_interval_applies_to_recent_samples() {
    let policy = DedupPolicy::new(2_000, vec![DownsamplingPeriod::new(50_000, 10_000)]);
    let mut timestamps: Vec<i64> = (0..100).map(|i| i * 1000).collect();
    let mut values: Vec<f64> = (0..100).map(f64::from).collect();
    policy.apply(&mut timestamps, &mut values, 100_000);
    assert_eq!(timestamps.len(), 5 + 25);
    assert_eq!(timestamps[5..7], [50_000, 52_000]);
}

#[test]
fn policy_needs_downsampling_only_for_old_blocks() {
    let policy = DedupPolicy::new(0, vec![DownsamplingPeriod::new(1_000, 100)]);
    assert!(policy.needs_downsampling(500, 10_000));
    assert!(!policy.needs_downsampling(9_500, 10_000));
    assert!(!DedupPolicy::default().needs_downsampling(0, 10_000));
}

#[test]
fn block_dedup_updates_time_range() {
    let mut b = Block::new(Tsid::from_metric_id(7), vec![0, 10, 20, 150], vec![1, 2, 3, 4], 0, 64);
    let removed = b.deduplicate_samples_during_merge(&DedupPolicy::new(100, Vec::new()), 0);
    assert_eq!(removed, 2);
    assert_eq!(b.timestamps(), &[0, 150]);
    assert_eq!(b.values(), &[1, 4]);
    assert_eq!(b.header().max_timestamp, 150);
}

#[test]
fn block_dedup_skips_marshaled_blocks() {
    let mut b = Block::new(Tsid::from_metric_id(7), vec![0, 10, 20], vec![1, 2, 3], 0, 64);
    b.marshal_data(0, 0).unwrap();
    let removed = b.deduplicate_samples_during_merge(&DedupPolicy::new(100, Vec::new()), 0);
    assert_eq!(removed, 0);
    assert_eq!(b.rows_count(), 3);
}
