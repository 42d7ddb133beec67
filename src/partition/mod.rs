//! # Partitions
//!
//! A partition owns every sample of one calendar month (UTC). Its data moves
//! through three stages:
//!
//! 1. **Raw rows**: ingested rows buffered in [`raw_rows::RawRowsShards`].
//!    They are not searchable yet.
//! 2. **In-memory parts**: packed, searchable, but lost on a crash. Raw
//!    rows become in-memory parts when a shard fills up or its flush
//!    interval elapses.
//! 3. **File parts**: durable parts under `small/<YYYY_MM>/` or
//!    `big/<YYYY_MM>/`. In-memory parts are written out once they are older
//!    than the in-memory flush interval.
//!
//! ## Merges
//!
//! Small and big parts are compacted by separate background worker pools
//! (see [`workers`]). A merge writes its output into `tmp/` and commits it
//! through a transaction file (see [`txn`]), so a crash leaves either the
//! inputs or the output, never both and never neither. Commits hold the
//! snapshot lock shared; snapshots hold it exclusively.
//!
//! When the number of in-memory and small parts exceeds the configured
//! limit, the inserting thread performs one merge itself before returning.
//!
//! ## Concurrency
//!
//! The part lists live behind one mutex and are only read as copies
//! (`Vec<Arc<..>>`), so searches and merges never observe a list changing
//! under them. A part is freed when the last copy referencing it is dropped.

pub(crate) mod raw_rows;
pub(crate) mod txn;
mod workers;

#[cfg(test)]
pub(crate) mod tests;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, NaiveDate};
use crossbeam::channel::{self, Receiver};
use thiserror::Error;
use tracing::{debug, info};

use crate::block::dedup::DedupPolicy;
use crate::block::{RawRow, TimeRange};
use crate::fsutil;
use crate::merge::selection::{self, MergeCandidate};
use crate::merge::{DeletedMetricIds, MergeError, MergeStats, merge_block_streams};
use crate::part::cache::IndexBlockCache;
use crate::part::stream::{BlockStreamReader, BlockStreamWriter, compress_level_for};
use crate::part::{InmemoryPart, MAX_ROWS_PER_BIG_PART, Part, PartError, PartHeader, next_part_suffix};
use raw_rows::RawRowsShards;
use txn::{TMP_DIRNAME, TXN_DIRNAME, Transaction};
use workers::Workers;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PartitionError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Opening or reading a part failed.
    #[error("Part error: {0}")]
    Part(#[from] PartError),

    /// A merge failed or was stopped.
    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    /// A transaction file is malformed or names a path outside the
    /// partition.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// The partition is closed and takes no more rows.
    #[error("partition is closed")]
    Closed,

    /// Internal invariant violation (poisoned lock, unexpected state, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PartitionError {
    /// True if the error only reports that a stop signal interrupted a
    /// merge.
    pub fn is_forcibly_stopped(&self) -> bool {
        matches!(self, Self::Merge(MergeError::ForciblyStopped))
    }
}

// ------------------------------------------------------------------------------------------------
// Settings
// ------------------------------------------------------------------------------------------------

/// Engine-wide settings shared by the table, every partition and their
/// background workers.
#[derive(Debug)]
pub struct EngineSettings {
    pub retention_ms: i64,
    pub dedup: DedupPolicy,
    pub raw_rows_shards: usize,
    pub max_raw_rows_per_shard: usize,
    pub raw_rows_flush_interval: Duration,
    pub inmemory_parts_flush_interval: Duration,
    /// `0` disables the background small-part mergers.
    pub small_merge_workers: usize,
    /// `0` disables the background big-part mergers.
    pub big_merge_workers: usize,
    pub max_small_parts_per_partition: usize,
    /// Merges producing more rows write a big part.
    pub max_rows_per_small_part: u64,
    /// Idle time after which merge workers switch to final merges. Zero
    /// disables final merges.
    pub final_merge_delay: Duration,
    pub retention_check_interval: Duration,
    pub index_cache: Arc<IndexBlockCache>,
    pub deleted_metric_ids: DeletedMetricIds,
    /// Merge commits hold it shared; snapshot creation exclusively.
    pub snapshot_lock: RwLock<()>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retention_ms: 31 * 24 * 3600 * 1000,
            dedup: DedupPolicy::default(),
            raw_rows_shards: 1,
            max_raw_rows_per_shard: 100_000,
            raw_rows_flush_interval: Duration::from_secs(1),
            inmemory_parts_flush_interval: Duration::from_secs(5),
            small_merge_workers: 1,
            big_merge_workers: 1,
            max_small_parts_per_partition: 256,
            max_rows_per_small_part: 10_000_000,
            final_merge_delay: Duration::from_secs(30),
            retention_check_interval: Duration::from_secs(60),
            index_cache: Arc::new(IndexBlockCache::new(64 << 20)),
            deleted_metric_ids: DeletedMetricIds::default(),
            snapshot_lock: RwLock::new(()),
        }
    }
}

/// Current Unix time in milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ------------------------------------------------------------------------------------------------
// Partition naming
// ------------------------------------------------------------------------------------------------

/// Time range covered by the partition `name` (`YYYY_MM`), or `None` if the
/// name is malformed.
pub fn partition_time_range(name: &str) -> Option<TimeRange> {
    let (year, month) = name.split_once('_')?;
    if year.len() != 4 || month.len() != 2 {
        return None;
    }
    let year: i32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    let start = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let min = start.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis();
    let max = next.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis() - 1;
    Some(TimeRange::new(min, max))
}

/// Name of the partition holding `timestamp`.
pub fn partition_name(timestamp: i64) -> Option<String> {
    let dt = DateTime::from_timestamp_millis(timestamp)?;
    if !(0..=9999).contains(&dt.year()) {
        return None;
    }
    Some(format!("{:04}_{:02}", dt.year(), dt.month()))
}

// ------------------------------------------------------------------------------------------------
// PartWrapper
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartKind {
    Inmemory = 0,
    Small = 1,
    Big = 2,
}

/// A part registered in a partition.
pub struct PartWrapper {
    part: Arc<Part>,
    kind: PartKind,
    /// Set while the part is the input of a running merge. Only set under
    /// the parts lock.
    in_merge: AtomicBool,
    /// When an in-memory part is due to be written to disk.
    flush_deadline: Instant,
}

impl PartWrapper {
    fn new(part: Part, kind: PartKind, flush_deadline: Instant) -> Arc<Self> {
        Arc::new(Self {
            part: Arc::new(part),
            kind,
            in_merge: AtomicBool::new(false),
            flush_deadline,
        })
    }

    pub fn part(&self) -> &Arc<Part> {
        &self.part
    }

    pub fn kind(&self) -> PartKind {
        self.kind
    }

    fn is_in_merge(&self) -> bool {
        self.in_merge.load(Ordering::Acquire)
    }
}

impl MergeCandidate for Arc<PartWrapper> {
    fn rows_count(&self) -> u64 {
        self.part.header().rows_count
    }

    fn min_timestamp(&self) -> i64 {
        self.part.header().min_timestamp
    }
}

impl std::fmt::Debug for PartWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartWrapper")
            .field("kind", &self.kind)
            .field("part", &self.part)
            .field("in_merge", &self.is_in_merge())
            .finish_non_exhaustive()
    }
}

/// Inputs shared by both merge destinations.
struct MergeContext<'a> {
    compress_level: i32,
    now_ms: i64,
    retention_deadline: i64,
    deleted: Arc<HashSet<u64>>,
    stop: Option<&'a Receiver<()>>,
}

fn readers_of(pws: &[Arc<PartWrapper>]) -> Vec<BlockStreamReader> {
    pws.iter().map(|pw| BlockStreamReader::new(Arc::clone(&pw.part))).collect()
}

/// Clears the in-merge flag of the merge inputs when the merge ends.
struct InMergeGuard<'a> {
    pws: &'a [Arc<PartWrapper>],
}

impl<'a> InMergeGuard<'a> {
    fn new(pws: &'a [Arc<PartWrapper>]) -> Self {
        for pw in pws {
            assert!(pw.is_in_merge(), "BUG: merge input {:?} is not marked as in merge", pw.part);
        }
        Self { pws }
    }
}

impl Drop for InMergeGuard<'_> {
    fn drop(&mut self) {
        for pw in self.pws {
            pw.in_merge.store(false, Ordering::Release);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Metrics
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MergeCounters {
    merges: AtomicU64,
    rows_merged: AtomicU64,
    rows_deleted: AtomicU64,
    rows_deduped: AtomicU64,
}

impl MergeCounters {
    fn record(&self, stats: &MergeStats) {
        self.merges.fetch_add(1, Ordering::Relaxed);
        self.rows_merged.fetch_add(stats.rows_merged, Ordering::Relaxed);
        self.rows_deleted.fetch_add(stats.rows_deleted, Ordering::Relaxed);
        self.rows_deduped.fetch_add(stats.rows_deduped, Ordering::Relaxed);
    }
}

/// Counters of one or more partitions. Merge counters are keyed by the
/// kind of the part a merge produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionMetrics {
    pub pending_rows: u64,

    pub inmemory_parts: u64,
    pub small_parts: u64,
    pub big_parts: u64,

    pub inmemory_rows: u64,
    pub small_rows: u64,
    pub big_rows: u64,

    pub inmemory_size_bytes: u64,
    pub small_size_bytes: u64,
    pub big_size_bytes: u64,

    pub inmemory_merges: u64,
    pub small_merges: u64,
    pub big_merges: u64,

    pub inmemory_rows_merged: u64,
    pub small_rows_merged: u64,
    pub big_rows_merged: u64,

    pub inmemory_rows_deleted: u64,
    pub small_rows_deleted: u64,
    pub big_rows_deleted: u64,

    pub inmemory_rows_deduped: u64,
    pub small_rows_deduped: u64,
    pub big_rows_deduped: u64,

    pub active_merges: u64,
    pub assisted_merges: u64,
}

// ------------------------------------------------------------------------------------------------
// Partition
// ------------------------------------------------------------------------------------------------

#[derive(Default)]
struct PartSet {
    inmemory: Vec<Arc<PartWrapper>>,
    small: Vec<Arc<PartWrapper>>,
    big: Vec<Arc<PartWrapper>>,
}

impl PartSet {
    fn list_mut(&mut self, kind: PartKind) -> &mut Vec<Arc<PartWrapper>> {
        match kind {
            PartKind::Inmemory => &mut self.inmemory,
            PartKind::Small => &mut self.small,
            PartKind::Big => &mut self.big,
        }
    }

    fn all(&self) -> impl Iterator<Item = &Arc<PartWrapper>> {
        self.inmemory.iter().chain(&self.small).chain(&self.big)
    }
}

pub struct Partition {
    name: String,
    tr: TimeRange,
    small_path: PathBuf,
    big_path: PathBuf,
    settings: Arc<EngineSettings>,

    raw_rows: RawRowsShards,
    parts: Mutex<PartSet>,
    /// Held shared by `add_rows`; `close` takes it exclusively once to wait
    /// for in-flight writers.
    writers: RwLock<()>,

    counters: [MergeCounters; 3],
    active_merges: AtomicU64,
    assisted_merges: AtomicU64,

    /// Disconnected once the partition starts closing.
    stop: Receiver<()>,
    workers: Mutex<Option<Workers>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("name", &self.name)
            .field("small_path", &self.small_path)
            .field("big_path", &self.big_path)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Partition {
    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Create the partition holding `timestamp` under `small_root` and
    /// `big_root`. Its directories must not exist yet.
    pub fn create(
        small_root: &Path,
        big_root: &Path,
        timestamp: i64,
        settings: Arc<EngineSettings>,
    ) -> Result<Arc<Self>, PartitionError> {
        let name = partition_name(timestamp)
            .ok_or_else(|| PartitionError::Internal(format!("timestamp {timestamp} is out of range")))?;
        let small_path = small_root.join(&name);
        let big_path = big_root.join(&name);
        for path in [&small_path, &big_path] {
            fsutil::mkdir_fail_if_exists(path)?;
            fsutil::mkdir_all_sync(&path.join(TXN_DIRNAME))?;
            fsutil::mkdir_all_sync(&path.join(TMP_DIRNAME))?;
        }
        let pt = Self::new(name, small_path, big_path, settings, PartSet::default())?;
        info!(partition = %pt.name, path = %pt.small_path.display(), "partition created");
        Ok(pt)
    }

    /// Open the existing partition `name`: replay pending transactions,
    /// discard unfinished merge output, then open every part.
    pub fn open(
        small_root: &Path,
        big_root: &Path,
        name: &str,
        settings: Arc<EngineSettings>,
    ) -> Result<Arc<Self>, PartitionError> {
        let small_path = small_root.join(name);
        let big_path = big_root.join(name);
        for path in [&small_path, &big_path] {
            fsutil::mkdir_all_sync(&path.join(TXN_DIRNAME))?;
            fsutil::mkdir_all_sync(&path.join(TMP_DIRNAME))?;
        }
        let replayed = txn::replay_transactions(&[&small_path, &big_path])?;
        if replayed > 0 {
            info!(partition = name, replayed, "replayed pending transactions");
        }
        fsutil::clear_dir(&small_path.join(TMP_DIRNAME))?;
        fsutil::clear_dir(&big_path.join(TMP_DIRNAME))?;

        let parts = PartSet {
            inmemory: Vec::new(),
            small: open_parts(&small_path, PartKind::Small, &settings)?,
            big: open_parts(&big_path, PartKind::Big, &settings)?,
        };
        let (small, big) = (parts.small.len(), parts.big.len());
        let pt = Self::new(name.to_string(), small_path, big_path, settings, parts)?;
        info!(partition = name, small, big, "partition opened");
        Ok(pt)
    }

    fn new(
        name: String,
        small_path: PathBuf,
        big_path: PathBuf,
        settings: Arc<EngineSettings>,
        parts: PartSet,
    ) -> Result<Arc<Self>, PartitionError> {
        let tr = partition_time_range(&name)
            .ok_or_else(|| PartitionError::Internal(format!("invalid partition name {name:?}")))?;
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let pt = Arc::new(Self {
            name,
            tr,
            small_path,
            big_path,
            raw_rows: RawRowsShards::new(settings.raw_rows_shards, settings.max_raw_rows_per_shard),
            settings,
            parts: Mutex::new(parts),
            writers: RwLock::new(()),
            counters: Default::default(),
            active_merges: AtomicU64::new(0),
            assisted_merges: AtomicU64::new(0),
            stop: stop_rx,
            workers: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let workers = Workers::start(&pt, stop_tx)?;
        *pt.workers_lock()? = Some(workers);
        Ok(pt)
    }

    /// Stop the background workers, then write every buffered row and
    /// in-memory part to disk. Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), PartitionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Writers that got in before `closed` was set finish first; later
        // ones see it and fail.
        drop(
            self.writers
                .write()
                .map_err(|_| PartitionError::Internal("writers lock poisoned".into()))?,
        );
        let workers = self.workers_lock()?.take();
        if let Some(workers) = workers {
            workers.stop();
        }

        self.flush_raw_rows(true)?;
        self.flush_inmemory_parts(true, None)?;

        let mut parts = self.parts_lock()?;
        assert!(
            parts.inmemory.is_empty(),
            "BUG: in-memory parts must be flushed on close; {} left",
            parts.inmemory.len()
        );
        let pending = self.raw_rows.len();
        assert!(pending == 0, "BUG: raw rows must be flushed on close; {pending} left");
        parts.small.clear();
        parts.big.clear();
        info!(partition = %self.name, "partition closed");
        Ok(())
    }

    /// Delete the partition directories. Must be called after `close`.
    pub fn drop_data(&self) -> Result<(), PartitionError> {
        assert!(self.closed.load(Ordering::Acquire), "BUG: dropping an open partition");
        fsutil::remove_dir_all_if_exists(&self.small_path)?;
        fsutil::remove_dir_all_if_exists(&self.big_path)?;
        info!(partition = %self.name, "partition dropped");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn time_range(&self) -> TimeRange {
        self.tr
    }

    pub fn has_timestamp(&self, timestamp: i64) -> bool {
        self.tr.contains(timestamp)
    }

    pub fn small_path(&self) -> &Path {
        &self.small_path
    }

    pub fn big_path(&self) -> &Path {
        &self.big_path
    }

    pub(crate) fn settings(&self) -> &Arc<EngineSettings> {
        &self.settings
    }

    fn dir_for(&self, kind: PartKind) -> &Path {
        match kind {
            PartKind::Big => &self.big_path,
            PartKind::Inmemory | PartKind::Small => &self.small_path,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    fn parts_lock(&self) -> Result<MutexGuard<'_, PartSet>, PartitionError> {
        self.parts
            .lock()
            .map_err(|_| PartitionError::Internal("parts mutex poisoned".into()))
    }

    fn workers_lock(&self) -> Result<MutexGuard<'_, Option<Workers>>, PartitionError> {
        self.workers
            .lock()
            .map_err(|_| PartitionError::Internal("workers mutex poisoned".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Ingestion
    // --------------------------------------------------------------------------------------------

    /// Buffer `rows`. Every row must belong to this partition's month.
    ///
    /// Returns [`PartitionError::Closed`] once `close` has started; rows
    /// accepted before that are flushed by `close`.
    ///
    /// # Panics
    ///
    /// If a row lies outside the partition's time range or has an invalid
    /// precision.
    pub fn add_rows(&self, rows: &[RawRow]) -> Result<(), PartitionError> {
        if rows.is_empty() {
            return Ok(());
        }
        let _writer = self
            .writers
            .read()
            .map_err(|_| PartitionError::Internal("writers lock poisoned".into()))?;
        if self.closed.load(Ordering::Acquire) {
            return Err(PartitionError::Closed);
        }
        for r in rows {
            assert!(
                self.tr.contains(r.timestamp),
                "BUG: row timestamp {} is outside partition {} {}",
                r.timestamp,
                self.name,
                self.tr
            );
            assert!(
                (1..=64).contains(&r.precision_bits),
                "BUG: precision_bits must be in 1..=64; got {}",
                r.precision_bits
            );
        }
        let deadline = now_ms().saturating_add(duration_ms(self.settings.raw_rows_flush_interval));
        for batch in self.raw_rows.add_rows(rows, deadline) {
            self.add_inmemory_part(batch)?;
        }
        self.assist_merge_if_needed()
    }

    /// Pack buffered rows into in-memory parts. Only shards whose flush
    /// interval elapsed are drained unless `is_final` is set.
    pub fn flush_raw_rows(&self, is_final: bool) -> Result<(), PartitionError> {
        for batch in self.raw_rows.take_rows_to_flush(now_ms(), is_final) {
            self.add_inmemory_part(batch)?;
        }
        Ok(())
    }

    fn add_inmemory_part(&self, mut rows: Vec<RawRow>) -> Result<(), PartitionError> {
        if rows.is_empty() {
            return Ok(());
        }
        let now = now_ms();
        let mp = InmemoryPart::from_raw_rows(&mut rows, &self.settings.dedup, now)?;
        let ph = mp.header;
        assert!(
            self.tr.contains(ph.min_timestamp) && self.tr.contains(ph.max_timestamp),
            "BUG: part {ph} does not fit partition {} {}",
            self.name,
            self.tr
        );
        let part = Part::from_inmemory(mp, Arc::clone(&self.settings.index_cache))?;
        let deadline = Instant::now() + self.settings.inmemory_parts_flush_interval;
        let pw = PartWrapper::new(part, PartKind::Inmemory, deadline);
        self.parts_lock()?.inmemory.push(pw);
        Ok(())
    }

    /// Merge once in the caller's thread when small parts pile up faster
    /// than the background workers merge them.
    fn assist_merge_if_needed(&self) -> Result<(), PartitionError> {
        {
            let parts = self.parts_lock()?;
            if parts.inmemory.len() + parts.small.len() <= self.settings.max_small_parts_per_partition {
                return Ok(());
            }
        }
        self.assisted_merges.fetch_add(1, Ordering::Relaxed);
        match self.merge_next(PartKind::Small, false, Some(&self.stop)) {
            Err(e) if e.is_forcibly_stopped() => Ok(()),
            res => res.map(|_| ()),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Search snapshot
    // --------------------------------------------------------------------------------------------

    /// Every searchable part at this instant.
    pub fn parts(&self) -> Result<Vec<Arc<Part>>, PartitionError> {
        let parts = self.parts_lock()?;
        Ok(parts.all().map(|pw| Arc::clone(&pw.part)).collect())
    }

    pub(crate) fn part_wrappers(&self) -> Result<Vec<Arc<PartWrapper>>, PartitionError> {
        let parts = self.parts_lock()?;
        Ok(parts.all().cloned().collect())
    }

    // --------------------------------------------------------------------------------------------
    // Merges
    // --------------------------------------------------------------------------------------------

    /// Pick and mark the next parts to merge. Small merges draw from
    /// in-memory and small parts, big merges from big parts.
    fn select_parts_to_merge(&self, kind: PartKind, is_final: bool) -> Result<Vec<Arc<PartWrapper>>, PartitionError> {
        let parts = self.parts_lock()?;
        let idle = |pw: &&Arc<PartWrapper>| !pw.is_in_merge();
        let candidates: Vec<Arc<PartWrapper>> = match kind {
            PartKind::Big => parts.big.iter().filter(idle).cloned().collect(),
            PartKind::Inmemory | PartKind::Small => {
                parts.inmemory.iter().chain(&parts.small).filter(idle).cloned().collect()
            }
        };
        let pws = selection::parts_to_merge(&candidates, MAX_ROWS_PER_BIG_PART, is_final);
        for pw in &pws {
            pw.in_merge.store(true, Ordering::Release);
        }
        Ok(pws)
    }

    /// Run one merge of `kind` parts. Returns `false` if nothing qualified.
    pub(crate) fn merge_next(
        &self,
        kind: PartKind,
        is_final: bool,
        stop: Option<&Receiver<()>>,
    ) -> Result<bool, PartitionError> {
        let pws = self.select_parts_to_merge(kind, is_final)?;
        if pws.is_empty() {
            return Ok(false);
        }
        self.merge_parts(&pws, stop, false)?;
        Ok(true)
    }

    fn dst_part_kind(&self, pws: &[Arc<PartWrapper>], rows: u64, is_final: bool) -> PartKind {
        if rows > self.settings.max_rows_per_small_part {
            return PartKind::Big;
        }
        if is_final || pws.iter().any(|pw| pw.kind != PartKind::Inmemory) {
            // Output built from file parts must be durable too.
            return PartKind::Small;
        }
        PartKind::Inmemory
    }

    /// Merge `pws` into a single part and swap it in. Every input must be
    /// marked as in merge; the marks are cleared on return.
    ///
    /// With `is_final` the output always goes to disk.
    pub(crate) fn merge_parts(
        &self,
        pws: &[Arc<PartWrapper>],
        stop: Option<&Receiver<()>>,
        is_final: bool,
    ) -> Result<(), PartitionError> {
        assert!(!pws.is_empty(), "BUG: empty parts list passed to merge");
        let _guard = InMergeGuard::new(pws);
        let start = Instant::now();

        let src_rows: u64 = pws.iter().map(|pw| pw.part.header().rows_count).sum();
        let src_blocks: u64 = pws.iter().map(|pw| pw.part.header().blocks_count).sum();
        let dst_kind = self.dst_part_kind(pws, src_rows, is_final);
        let now = now_ms();
        let ctx = MergeContext {
            compress_level: compress_level_for(src_rows, src_blocks),
            now_ms: now,
            retention_deadline: now.saturating_sub(self.settings.retention_ms),
            deleted: self.settings.deleted_metric_ids.snapshot(),
            stop,
        };

        let mut ph = PartHeader::default();
        let mut stats = MergeStats::default();
        self.active_merges.fetch_add(1, Ordering::Relaxed);
        let res = if dst_kind == PartKind::Inmemory {
            self.merge_to_memory(pws, &ctx, &mut ph, &mut stats)
        } else {
            self.merge_to_file(pws, dst_kind, &ctx, &mut ph, &mut stats)
        };
        self.active_merges.fetch_sub(1, Ordering::Relaxed);
        res?;

        self.counters[dst_kind as usize].record(&stats);
        debug!(
            partition = %self.name,
            parts = pws.len(),
            rows = src_rows,
            dst_rows = ph.rows_count,
            dst = ?dst_kind,
            duration_ms = start.elapsed().as_millis() as u64,
            "merged parts"
        );
        Ok(())
    }

    fn merge_to_memory(
        &self,
        pws: &[Arc<PartWrapper>],
        ctx: &MergeContext<'_>,
        ph: &mut PartHeader,
        stats: &mut MergeStats,
    ) -> Result<(), PartitionError> {
        let mut bsw = BlockStreamWriter::in_memory(ctx.compress_level, self.settings.dedup.clone(), ctx.now_ms);
        merge_block_streams(ph, &mut bsw, readers_of(pws), ctx.stop, &ctx.deleted, ctx.retention_deadline, stats)?;
        let mut mp = bsw.finish_in_memory()?;
        mp.header = *ph;
        let new_pw = if ph.rows_count > 0 {
            let deadline = pws
                .iter()
                .map(|pw| pw.flush_deadline)
                .min()
                .unwrap_or_else(|| Instant::now() + self.settings.inmemory_parts_flush_interval);
            let part = Part::from_inmemory(mp, Arc::clone(&self.settings.index_cache))?;
            Some(PartWrapper::new(part, PartKind::Inmemory, deadline))
        } else {
            None
        };
        self.swap_parts(pws, new_pw)
    }

    /// Merge into `tmp/`, then commit through a transaction file.
    fn merge_to_file(
        &self,
        pws: &[Arc<PartWrapper>],
        dst_kind: PartKind,
        ctx: &MergeContext<'_>,
        ph: &mut PartHeader,
        stats: &mut MergeStats,
    ) -> Result<(), PartitionError> {
        let dir = self.dir_for(dst_kind);
        let suffix = next_part_suffix();
        let tmp_path = dir.join(TMP_DIRNAME).join(txn::scratch_name(suffix));

        let merged = BlockStreamWriter::create(&tmp_path, ctx.compress_level, self.settings.dedup.clone(), ctx.now_ms)
            .map_err(PartitionError::from)
            .and_then(|mut bsw| {
                merge_block_streams(ph, &mut bsw, readers_of(pws), ctx.stop, &ctx.deleted, ctx.retention_deadline, stats)?;
                bsw.finish()?;
                Ok(())
            });
        if let Err(e) = merged {
            fsutil::remove_dir_all_if_exists(&tmp_path)?;
            return Err(e);
        }

        let txn = Transaction {
            remove: pws
                .iter()
                .filter_map(|pw| pw.part.path().map(Path::to_path_buf))
                .collect(),
            src: tmp_path,
            dst: (ph.rows_count > 0).then(|| dir.join(ph.dir_name(suffix))),
        };
        let txn_path = txn::write_transaction(&dir.join(TXN_DIRNAME), suffix, &txn)?;

        let _snapshot = self
            .settings
            .snapshot_lock
            .read()
            .map_err(|_| PartitionError::Internal("snapshot lock poisoned".into()))?;
        txn::run_transaction(&txn_path, &[&self.small_path, &self.big_path])?;
        let new_pw = match &txn.dst {
            Some(dst) => {
                let part = Part::open(dst, Arc::clone(&self.settings.index_cache), dst_kind == PartKind::Big)?;
                Some(PartWrapper::new(part, dst_kind, Instant::now()))
            }
            None => None,
        };
        self.swap_parts(pws, new_pw)
    }

    /// Atomically replace `pws` with `new_pw` in the part lists.
    fn swap_parts(&self, pws: &[Arc<PartWrapper>], new_pw: Option<Arc<PartWrapper>>) -> Result<(), PartitionError> {
        let mut guard = self.parts_lock()?;
        let parts = &mut *guard;
        let mut removed = 0;
        for list in [&mut parts.inmemory, &mut parts.small, &mut parts.big] {
            let before = list.len();
            list.retain(|pw| !pws.iter().any(|src| Arc::ptr_eq(src, pw)));
            removed += before - list.len();
        }
        assert_eq!(
            removed,
            pws.len(),
            "BUG: unexpected number of parts removed from partition {}",
            self.name
        );
        if let Some(pw) = new_pw {
            parts.list_mut(pw.kind).push(pw);
        }
        Ok(())
    }

    /// Split `pws` into the next group to merge and the rest. The group is
    /// the best selection if one exists, otherwise everything.
    fn split_for_merge(mut pws: Vec<Arc<PartWrapper>>) -> (Vec<Arc<PartWrapper>>, Vec<Arc<PartWrapper>>) {
        let group = selection::parts_to_merge(&pws, MAX_ROWS_PER_BIG_PART, false);
        if group.is_empty() {
            return (pws, Vec::new());
        }
        pws.retain(|pw| !group.iter().any(|g| Arc::ptr_eq(g, pw)));
        (group, pws)
    }

    /// Merge marked parts into file parts, group by group.
    fn merge_parts_to_files(
        &self,
        mut pws: Vec<Arc<PartWrapper>>,
        stop: Option<&Receiver<()>>,
    ) -> Result<(), PartitionError> {
        while !pws.is_empty() {
            let (group, rest) = Self::split_for_merge(pws);
            pws = rest;
            if let Err(e) = self.merge_parts(&group, stop, true) {
                // Release the marks of the groups that will not run.
                drop(InMergeGuard::new(&pws));
                return Err(e);
            }
        }
        Ok(())
    }

    /// Write in-memory parts to disk: those past their flush deadline, or
    /// all of them when `is_final` is set.
    pub fn flush_inmemory_parts(&self, is_final: bool, stop: Option<&Receiver<()>>) -> Result<(), PartitionError> {
        let now = Instant::now();
        let pws: Vec<Arc<PartWrapper>> = {
            let parts = self.parts_lock()?;
            parts
                .inmemory
                .iter()
                .filter(|pw| !pw.is_in_merge() && (is_final || pw.flush_deadline <= now))
                .inspect(|pw| pw.in_merge.store(true, Ordering::Release))
                .cloned()
                .collect()
        };
        if pws.is_empty() {
            return Ok(());
        }
        self.merge_parts_to_files(pws, stop)
    }

    /// Merge every part into as few parts as the size limits allow. Parts
    /// in a running merge are left out.
    pub fn force_merge(&self) -> Result<(), PartitionError> {
        let mut prev_count = usize::MAX;
        loop {
            let pws: Vec<Arc<PartWrapper>> = {
                let parts = self.parts_lock()?;
                parts
                    .all()
                    .filter(|pw| !pw.is_in_merge())
                    .inspect(|pw| pw.in_merge.store(true, Ordering::Release))
                    .cloned()
                    .collect()
            };
            // A single part is still rewritten once to apply deletions,
            // retention and dedup.
            let done = pws.is_empty() || (pws.len() == 1 && prev_count != usize::MAX) || pws.len() >= prev_count;
            if done {
                drop(InMergeGuard::new(&pws));
                return Ok(());
            }
            prev_count = pws.len();
            self.merge_parts_to_files(pws, Some(&self.stop))?;
        }
    }

    // --------------------------------------------------------------------------------------------
    // Retention
    // --------------------------------------------------------------------------------------------

    /// Drop every part whose newest sample is older than the retention
    /// deadline, without waiting for a merge to rewrite it. Parts in a
    /// running merge are left for the next call. Returns the number of
    /// parts removed.
    ///
    /// File parts are removed through a transaction, so a crash midway is
    /// finished on the next open.
    pub fn remove_stale_parts(&self) -> Result<usize, PartitionError> {
        let deadline = now_ms().saturating_sub(self.settings.retention_ms);
        let pws: Vec<Arc<PartWrapper>> = {
            let parts = self.parts_lock()?;
            parts
                .all()
                .filter(|pw| !pw.is_in_merge() && pw.part.header().max_timestamp < deadline)
                .inspect(|pw| pw.in_merge.store(true, Ordering::Release))
                .cloned()
                .collect()
        };
        if pws.is_empty() {
            return Ok(0);
        }
        let _guard = InMergeGuard::new(&pws);

        let remove: Vec<PathBuf> = pws
            .iter()
            .filter_map(|pw| pw.part.path().map(Path::to_path_buf))
            .collect();
        if remove.is_empty() {
            self.swap_parts(&pws, None)?;
        } else {
            let suffix = next_part_suffix();
            let txn = Transaction {
                remove,
                src: self.small_path.join(TMP_DIRNAME).join(txn::scratch_name(suffix)),
                dst: None,
            };
            let txn_path = txn::write_transaction(&self.small_path.join(TXN_DIRNAME), suffix, &txn)?;
            let _snapshot = self
                .settings
                .snapshot_lock
                .read()
                .map_err(|_| PartitionError::Internal("snapshot lock poisoned".into()))?;
            txn::run_transaction(&txn_path, &[&self.small_path, &self.big_path])?;
            self.swap_parts(&pws, None)?;
        }

        let mut rows = 0;
        for pw in &pws {
            let n = pw.part.header().rows_count;
            self.counters[pw.kind as usize].rows_deleted.fetch_add(n, Ordering::Relaxed);
            rows += n;
        }
        info!(partition = %self.name, parts = pws.len(), rows, "removed parts past retention");
        Ok(pws.len())
    }

    // --------------------------------------------------------------------------------------------
    // Snapshots
    // --------------------------------------------------------------------------------------------

    /// Hard-link every file part into `small_dst` and `big_dst`. The caller
    /// holds the snapshot lock exclusively and flushed the partition first.
    pub fn create_snapshot_at(&self, small_dst: &Path, big_dst: &Path) -> Result<(), PartitionError> {
        let pws = self.part_wrappers()?;
        fsutil::mkdir_fail_if_exists(small_dst)?;
        fsutil::mkdir_fail_if_exists(big_dst)?;
        for pw in &pws {
            let (Some(src), Some(name)) = (pw.part.path(), pw.part.path().and_then(Path::file_name)) else {
                continue;
            };
            let dst_dir = if pw.kind == PartKind::Big { big_dst } else { small_dst };
            fsutil::hard_link_tree(src, &dst_dir.join(name))?;
        }
        fsutil::sync_dir(small_dst)?;
        fsutil::sync_dir(big_dst)?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Metrics
    // --------------------------------------------------------------------------------------------

    pub fn update_metrics(&self, m: &mut PartitionMetrics) -> Result<(), PartitionError> {
        m.pending_rows += self.raw_rows.len() as u64;
        {
            let parts = self.parts_lock()?;
            for pw in parts.all() {
                let ph = pw.part.header();
                let size = pw.part.size_bytes();
                let (count, rows, bytes) = match pw.kind {
                    PartKind::Inmemory => (&mut m.inmemory_parts, &mut m.inmemory_rows, &mut m.inmemory_size_bytes),
                    PartKind::Small => (&mut m.small_parts, &mut m.small_rows, &mut m.small_size_bytes),
                    PartKind::Big => (&mut m.big_parts, &mut m.big_rows, &mut m.big_size_bytes),
                };
                *count += 1;
                *rows += ph.rows_count;
                *bytes += size;
            }
        }

        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let [inmemory, small, big] = &self.counters;
        m.inmemory_merges += load(&inmemory.merges);
        m.small_merges += load(&small.merges);
        m.big_merges += load(&big.merges);
        m.inmemory_rows_merged += load(&inmemory.rows_merged);
        m.small_rows_merged += load(&small.rows_merged);
        m.big_rows_merged += load(&big.rows_merged);
        m.inmemory_rows_deleted += load(&inmemory.rows_deleted);
        m.small_rows_deleted += load(&small.rows_deleted);
        m.big_rows_deleted += load(&big.rows_deleted);
        m.inmemory_rows_deduped += load(&inmemory.rows_deduped);
        m.small_rows_deduped += load(&small.rows_deduped);
        m.big_rows_deduped += load(&big.rows_deduped);
        m.active_merges += load(&self.active_merges);
        m.assisted_merges += load(&self.assisted_merges);
        Ok(())
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Open every part directory under `dir`.
fn open_parts(dir: &Path, kind: PartKind, settings: &EngineSettings) -> Result<Vec<Arc<PartWrapper>>, PartitionError> {
    let mut pws = Vec::new();
    for name in fsutil::read_dir_names(dir)? {
        if name == TXN_DIRNAME || name == TMP_DIRNAME {
            continue;
        }
        let part = Part::open(&dir.join(&name), Arc::clone(&settings.index_cache), kind == PartKind::Big)?;
        pws.push(PartWrapper::new(part, kind, Instant::now()));
    }
    Ok(pws)
}
