use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use crate::block::{RawRow, TimeRange, Tsid};
use crate::fsutil;
use crate::part::cache::IndexBlockCache;
use crate::part::stream::BlockStreamReader;
use crate::partition::txn::{TMP_DIRNAME, TXN_DIRNAME};
use crate::partition::{EngineSettings, Partition, PartitionMetrics};

/// 2024-05-01T00:00:00Z, the first millisecond of partition `2024_05`.
pub const BASE_TS: i64 = 1_714_521_600_000;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Settings with every background worker effectively idle, so tests drive
/// flushes and merges by hand.
pub fn manual_settings() -> EngineSettings {
    init_tracing();
    EngineSettings {
        // A century, so test data from 2024 never expires.
        retention_ms: 100 * 365 * 24 * 3600 * 1000,
        raw_rows_shards: 1,
        max_raw_rows_per_shard: 10_000,
        raw_rows_flush_interval: Duration::from_secs(3600),
        inmemory_parts_flush_interval: Duration::from_secs(3600),
        small_merge_workers: 0,
        big_merge_workers: 0,
        final_merge_delay: Duration::ZERO,
        index_cache: Arc::new(IndexBlockCache::new(1 << 20)),
        ..EngineSettings::default()
    }
}

pub fn row(metric_id: u64, timestamp: i64, value: f64) -> RawRow {
    RawRow {
        tsid: Tsid::from_metric_id(metric_id),
        timestamp,
        value,
        precision_bits: 64,
    }
}

/// `n` rows per metric for `metrics` metrics, one second apart from
/// `start`.
pub fn rows(metrics: u64, n: i64, start: i64) -> Vec<RawRow> {
    (0..metrics)
        .flat_map(|m| (0..n).map(move |i| row(m, start + i * 1000, (m * 1000) as f64 + i as f64)))
        .collect()
}

pub fn create_partition(root: &Path, settings: EngineSettings) -> Arc<Partition> {
    let (small, big) = roots(root);
    std::fs::create_dir_all(&small).unwrap();
    std::fs::create_dir_all(&big).unwrap();
    Partition::create(&small, &big, BASE_TS, Arc::new(settings)).unwrap()
}

pub fn open_partition(root: &Path, settings: EngineSettings) -> Arc<Partition> {
    let (small, big) = roots(root);
    Partition::open(&small, &big, "2024_05", Arc::new(settings)).unwrap()
}

pub fn roots(root: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    (root.join("small"), root.join("big"))
}

/// Every row of the partition as `(metric_id, timestamp, value)`, sorted.
pub fn read_rows(pt: &Partition) -> Vec<(u64, i64, f64)> {
    let mut out = Vec::new();
    for part in pt.parts().unwrap() {
        let mut bsr = BlockStreamReader::new(part);
        while bsr.next_block().unwrap() {
            let mut b = bsr.take_block();
            b.unmarshal_data().unwrap();
            let mut timestamps = Vec::new();
            let mut values = Vec::new();
            b.append_rows_with_time_range_filter(&mut timestamps, &mut values, TimeRange::all());
            let metric_id = b.tsid().metric_id;
            out.extend(timestamps.into_iter().zip(values).map(|(ts, v)| (metric_id, ts, v)));
        }
    }
    out.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    out
}

pub fn expected(rows: &[RawRow]) -> Vec<(u64, i64, f64)> {
    let mut out: Vec<_> = rows.iter().map(|r| (r.tsid.metric_id, r.timestamp, r.value)).collect();
    out.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    out
}

pub fn metrics(pt: &Partition) -> PartitionMetrics {
    let mut m = PartitionMetrics::default();
    pt.update_metrics(&mut m).unwrap();
    m
}

/// Part directories under `dir`, ignoring `txn/` and `tmp/`.
pub fn part_dirs(dir: &Path) -> Vec<String> {
    fsutil::read_dir_names(dir)
        .unwrap()
        .into_iter()
        .filter(|n| n != TXN_DIRNAME && n != TMP_DIRNAME)
        .collect()
}

/// Poll `cond` every 10ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
