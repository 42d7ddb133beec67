//! # metricstore
//!
//! An embeddable time-series storage engine. Samples are keyed by a
//! time-series id ([`Tsid`]), stored column-wise in immutable **parts**
//! grouped into monthly **partitions**, and compacted in the background by
//! an LSM-style merge scheduler.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use metricstore::{MetricRow, Storage, StorageConfig, TimeRange, Tsid};
//!
//! let storage = Storage::open("/tmp/my_metrics", StorageConfig::default()).unwrap();
//!
//! let tsid = Tsid::from_metric_id(7);
//! let now = std::time::SystemTime::now()
//!     .duration_since(std::time::UNIX_EPOCH)
//!     .unwrap()
//!     .as_millis() as i64;
//! let rows: Vec<MetricRow> = (0..100)
//!     .map(|i| MetricRow { tsid, timestamp: now + i * 1000, value: i as f64 })
//!     .collect();
//! storage.add_rows(&rows).unwrap();
//!
//! // Buffered rows become searchable after a flush.
//! storage.force_flush().unwrap();
//! for block in storage.search(&[tsid], TimeRange::new(now, now + 10_000)).unwrap() {
//!     let block = block.unwrap();
//!     assert_eq!(block.timestamps.len(), block.values.len());
//! }
//!
//! storage.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Columnar blocks** with delta, delta-of-delta and zstd encodings.
//! - **Background compaction** choosing merges that bound write amplification.
//! - **Crash-safe commits** through transaction files replayed on open.
//! - **Deduplication and downsampling** applied while merging.
//! - **Retention** of whole partitions and of samples during merges.
//! - **Snapshots** built from hard links.

#![allow(dead_code)]

pub(crate) mod block;
pub(crate) mod encoding;
pub(crate) mod fsutil;
pub(crate) mod merge;
pub(crate) mod part;
pub(crate) mod partition;
pub(crate) mod table;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};

use block::RawRow;
use block::dedup::{DedupPolicy, validate_downsampling_periods};
use encoding::decimal::is_stale_nan;
use part::cache::IndexBlockCache;
use partition::EngineSettings;
use table::search::TableSearch;
use table::{Table, TableError};

pub use block::dedup::DownsamplingPeriod;
pub use block::{TimeRange, Tsid};
pub use encoding::decimal::stale_nan;
pub use part::cache::CacheStats;
pub use partition::PartitionMetrics;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Storage`] instance.
///
/// All fields have defaults via [`StorageConfig::default()`]. The
/// configuration is validated when passed to [`Storage::open`].
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Samples older than this are dropped on ingestion, removed during
    /// merges, and whole partitions past it are deleted.
    ///
    /// Default: 31 days. Must be > 0.
    pub retention_ms: i64,

    /// Significant bits kept per stored value. 64 is lossless.
    ///
    /// Default: 64. Must be in `1..=64`.
    pub precision_bits: u8,

    /// Keep one sample per series per interval. `0` disables
    /// deduplication.
    ///
    /// Default: 0. Must be >= 0.
    pub dedup_interval_ms: i64,

    /// Coarser intervals for older samples.
    ///
    /// Default: none.
    pub downsampling_periods: Vec<DownsamplingPeriod>,

    /// Number of raw-rows buffers. More shards mean less contention
    /// between concurrent writers.
    ///
    /// Default: `(cpus + 7) / 8`. Must be >= 1.
    pub raw_rows_shards: usize,

    /// Rows a shard buffers before they are packed into a part.
    ///
    /// Default: 100 000. Must be >= 1.
    pub max_raw_rows_per_shard: usize,

    /// How long rows may stay buffered before becoming searchable.
    ///
    /// Default: 1s.
    pub raw_rows_flush_interval: Duration,

    /// How long packed rows may stay in memory before reaching disk.
    ///
    /// Default: 5s.
    pub inmemory_parts_flush_interval: Duration,

    /// Background merge threads per partition for small parts.
    ///
    /// Default: `max(cpus / 2, 1)`. Must be >= 1.
    pub small_merge_workers: usize,

    /// Background merge threads per partition for big parts.
    ///
    /// Default: `max(cpus / 2, 1)`. Must be >= 1.
    pub big_merge_workers: usize,

    /// Above this many in-memory and small parts, inserting threads merge
    /// before returning.
    ///
    /// Default: 256. Must be >= 2.
    pub max_small_parts_per_partition: usize,

    /// Merges producing more rows write a big part.
    ///
    /// Default: 10 000 000. Must be >= 1.
    pub max_rows_per_small_part: u64,

    /// Capacity of the index block cache. `0` disables it.
    ///
    /// Default: 64 MiB.
    pub index_cache_size_bytes: usize,

    /// How often expired partitions are looked for.
    ///
    /// Default: 60s.
    pub retention_check_interval: Duration,

    /// Idle time after which merge workers collapse even small groups of
    /// parts.
    ///
    /// Default: 30s.
    pub final_merge_delay: Duration,
}

fn available_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

impl Default for StorageConfig {
    fn default() -> Self {
        let cpus = available_cpus();
        Self {
            retention_ms: 31 * 24 * 3600 * 1000,
            precision_bits: 64,
            dedup_interval_ms: 0,
            downsampling_periods: Vec::new(),
            raw_rows_shards: cpus.div_ceil(8),
            max_raw_rows_per_shard: 100_000,
            raw_rows_flush_interval: Duration::from_secs(1),
            inmemory_parts_flush_interval: Duration::from_secs(5),
            small_merge_workers: (cpus / 2).max(1),
            big_merge_workers: (cpus / 2).max(1),
            max_small_parts_per_partition: 256,
            max_rows_per_small_part: 10_000_000,
            index_cache_size_bytes: 64 << 20,
            retention_check_interval: Duration::from_secs(60),
            final_merge_delay: Duration::from_secs(30),
        }
    }
}

impl StorageConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), StorageError> {
        let invalid = |msg: &str| Err(StorageError::InvalidConfig(msg.into()));
        if self.retention_ms <= 0 {
            return invalid("retention_ms must be > 0");
        }
        if !(1..=64).contains(&self.precision_bits) {
            return invalid("precision_bits must be in 1..=64");
        }
        if self.dedup_interval_ms < 0 {
            return invalid("dedup_interval_ms must be >= 0");
        }
        if self.raw_rows_shards < 1 {
            return invalid("raw_rows_shards must be >= 1");
        }
        if self.max_raw_rows_per_shard < 1 {
            return invalid("max_raw_rows_per_shard must be >= 1");
        }
        if self.small_merge_workers < 1 || self.big_merge_workers < 1 {
            return invalid("merge worker counts must be >= 1");
        }
        if self.max_small_parts_per_partition < 2 {
            return invalid("max_small_parts_per_partition must be >= 2");
        }
        if self.max_rows_per_small_part < 1 {
            return invalid("max_rows_per_small_part must be >= 1");
        }
        if self.retention_check_interval.is_zero() {
            return invalid("retention_check_interval must be > 0");
        }
        let mut periods = self.downsampling_periods.clone();
        validate_downsampling_periods(&mut periods).map_err(|e| StorageError::InvalidConfig(e.to_string()))?;
        Ok(())
    }

    /// Converts to the settings shared by the engine internals.
    fn to_engine_settings(&self) -> EngineSettings {
        let mut periods = self.downsampling_periods.clone();
        // Sorts by decreasing offset; already validated.
        let _ = validate_downsampling_periods(&mut periods);
        EngineSettings {
            retention_ms: self.retention_ms,
            dedup: DedupPolicy::new(self.dedup_interval_ms, periods),
            raw_rows_shards: self.raw_rows_shards,
            max_raw_rows_per_shard: self.max_raw_rows_per_shard,
            raw_rows_flush_interval: self.raw_rows_flush_interval,
            inmemory_parts_flush_interval: self.inmemory_parts_flush_interval,
            small_merge_workers: self.small_merge_workers,
            big_merge_workers: self.big_merge_workers,
            max_small_parts_per_partition: self.max_small_parts_per_partition,
            max_rows_per_small_part: self.max_rows_per_small_part,
            final_merge_delay: self.final_merge_delay,
            retention_check_interval: self.retention_check_interval,
            index_cache: Arc::new(IndexBlockCache::new(self.index_cache_size_bytes)),
            ..EngineSettings::default()
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Storage`] operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The storage has been closed.
    #[error("storage is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Argument constraint violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A table-internal error occurred.
    #[error("{0}")]
    Table(#[from] TableError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<part::PartError> for StorageError {
    fn from(e: part::PartError) -> Self {
        Self::Table(TableError::from(e))
    }
}

// ------------------------------------------------------------------------------------------------
// Rows, blocks and metrics
// ------------------------------------------------------------------------------------------------

/// One sample to store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricRow {
    pub tsid: Tsid,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub value: f64,
}

/// One stored block, filtered to the searched time range.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricBlock {
    pub tsid: Tsid,
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
}

/// Point-in-time counters of a [`Storage`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageMetrics {
    pub partitions: u64,
    pub parts: PartitionMetrics,
    pub index_cache: CacheStats,
}

// ------------------------------------------------------------------------------------------------
// Search
// ------------------------------------------------------------------------------------------------

/// Iterator over the blocks matching a search, in `(tsid, min_timestamp)`
/// order. Blocks with no rows inside the time range are skipped.
pub struct Search {
    inner: TableSearch,
    tr: TimeRange,
    done: bool,
}

impl Search {
    fn next_block(&mut self) -> Result<Option<MetricBlock>, StorageError> {
        while let Some(br) = self.inner.next_block()? {
            let b = br.read_block()?;
            let mut timestamps = Vec::new();
            let mut values = Vec::new();
            b.append_rows_with_time_range_filter(&mut timestamps, &mut values, self.tr);
            if timestamps.is_empty() {
                continue;
            }
            return Ok(Some(MetricBlock {
                tsid: b.tsid(),
                timestamps,
                values,
            }));
        }
        Ok(None)
    }
}

impl Iterator for Search {
    type Item = Result<MetricBlock, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_block() {
            Ok(Some(b)) => Some(Ok(b)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Storage handle
// ------------------------------------------------------------------------------------------------

/// The main storage handle.
///
/// # Thread safety
///
/// `Storage` is `Send + Sync`; share it across threads via `Arc<Storage>`.
///
/// # Visibility
///
/// Added rows are buffered. They become searchable once the raw-rows flush
/// interval passes or after [`Storage::force_flush`], and durable once the
/// in-memory flush interval passes, a snapshot is taken, or the storage is
/// closed.
///
/// # Shutdown
///
/// Call [`Storage::close`] for a graceful shutdown. If the handle is dropped
/// without calling `close`, the destructor closes it and logs errors.
pub struct Storage {
    path: PathBuf,
    table: Arc<Table>,
    precision_bits: u8,
    closed: AtomicBool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.path)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// Opens (or creates) a storage at the given directory.
    ///
    /// Pending merge transactions are replayed and unfinished merge output
    /// is discarded before any part is opened.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidConfig`] if any configuration
    /// parameter is out of range.
    pub fn open(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self, StorageError> {
        config.validate()?;
        fsutil::mkdir_all_sync(path.as_ref())?;
        let path = path.as_ref().canonicalize()?;

        let settings = Arc::new(config.to_engine_settings());
        let table = Table::open(&path, settings)?;
        info!(path = %path.display(), "storage opened");
        Ok(Self {
            path,
            table,
            precision_bits: config.precision_bits,
            closed: AtomicBool::new(false),
        })
    }

    /// Gracefully shuts down the storage: stops background work and writes
    /// every buffered row to disk.
    ///
    /// Subsequent operations return [`StorageError::Closed`]. Calling
    /// `close` more than once is harmless.
    pub fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.table.close()?;
        info!(path = %self.path.display(), "storage closed");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Buffers `rows` and returns how many were accepted.
    ///
    /// NaN values other than the staleness marker are skipped. Rows older
    /// than the retention or more than two days in the future are dropped.
    ///
    /// Rows accepted before a concurrent [`Storage::close`] are persisted by
    /// it; calls racing it past that point return [`StorageError::Closed`].
    pub fn add_rows(&self, rows: &[MetricRow]) -> Result<usize, StorageError> {
        self.check_open()?;
        let raw: Vec<RawRow> = rows
            .iter()
            .filter(|r| !r.value.is_nan() || is_stale_nan(r.value))
            .map(|r| RawRow {
                tsid: r.tsid,
                timestamp: r.timestamp,
                value: r.value,
                precision_bits: self.precision_bits,
            })
            .collect();
        self.table.add_rows(&raw).map_err(|e| {
            if e.is_closed() {
                StorageError::Closed
            } else {
                StorageError::Table(e)
            }
        })
    }

    /// Marks every series with one of `metric_ids` as deleted. Their
    /// samples disappear from searches at once and from disk on the next
    /// merge.
    pub fn delete_series(&self, metric_ids: &[u64]) -> Result<(), StorageError> {
        self.check_open()?;
        Ok(self.table.delete_series(metric_ids)?)
    }

    /// Makes every buffered row searchable.
    pub fn force_flush(&self) -> Result<(), StorageError> {
        self.check_open()?;
        Ok(self.table.force_flush()?)
    }

    /// Merges all parts of every partition whose `YYYY_MM` name starts with
    /// `prefix`. An empty prefix selects every partition.
    pub fn force_merge_partitions(&self, prefix: &str) -> Result<(), StorageError> {
        self.check_open()?;
        Ok(self.table.force_merge_partitions(prefix)?)
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Searches the blocks of `tsids` intersecting `tr`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidArgument`] if `tr` is empty.
    pub fn search(&self, tsids: &[Tsid], tr: TimeRange) -> Result<Search, StorageError> {
        self.check_open()?;
        if tr.min_timestamp > tr.max_timestamp {
            return Err(StorageError::InvalidArgument(format!("empty time range {tr}")));
        }
        Ok(Search {
            inner: TableSearch::new(&self.table, tsids, tr)?,
            tr,
            done: false,
        })
    }

    pub fn metrics(&self) -> Result<StorageMetrics, StorageError> {
        self.check_open()?;
        let mut parts = PartitionMetrics::default();
        let partitions = self.table.update_metrics(&mut parts)?;
        Ok(StorageMetrics {
            partitions: partitions as u64,
            parts,
            index_cache: self.table.settings().index_cache.stats(),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Snapshots
    // --------------------------------------------------------------------------------------------

    /// Flushes everything to disk and hard-links the current parts into a
    /// new snapshot. Returns its name.
    pub fn create_snapshot(&self) -> Result<String, StorageError> {
        self.check_open()?;
        Ok(self.table.create_snapshot()?)
    }

    pub fn list_snapshots(&self) -> Result<Vec<String>, StorageError> {
        self.check_open()?;
        Ok(self.table.list_snapshots()?)
    }

    pub fn delete_snapshot(&self, name: &str) -> Result<(), StorageError> {
        self.check_open()?;
        Ok(self.table.delete_snapshot(name)?)
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(StorageError::Closed)` if the storage has been closed.
    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(path = %self.path.display(), error = %e, "closing storage on drop failed");
        }
    }
}
