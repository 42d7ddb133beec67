//! # Table
//!
//! Routes rows and searches across monthly partitions.
//!
//! ## On-disk layout
//!
//! ```text
//! <root>/
//!   data/
//!     small/<YYYY_MM>/...        small parts, txn/ and tmp/
//!     small/snapshots/<name>/<YYYY_MM>/<part>
//!     big/<YYYY_MM>/...
//!     big/snapshots/<name>/<YYYY_MM>/<part>
//!   metadata/deleted_metric_ids  u64 little-endian metric ids
//! ```
//!
//! ## Partition lifetime
//!
//! Partitions are shared as `Arc<PartitionWrapper>` between the table and
//! running searches. The retention watcher only unlinks expired partitions
//! from the table and marks them; the last holder closes the partition and
//! deletes its data when the wrapper drops.

pub(crate) mod search;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::block::{RawRow, TimeRange};
use crate::fsutil;
use crate::part::next_part_suffix;
use crate::partition::{
    EngineSettings, Partition, PartitionError, PartitionMetrics, now_ms, partition_name, partition_time_range,
};

pub const DATA_DIRNAME: &str = "data";
pub const SMALL_DIRNAME: &str = "small";
pub const BIG_DIRNAME: &str = "big";
pub const SNAPSHOTS_DIRNAME: &str = "snapshots";
pub const METADATA_DIRNAME: &str = "metadata";
pub const DELETED_METRIC_IDS_FILENAME: &str = "deleted_metric_ids";

/// Rows further in the future are dropped on ingestion.
const MAX_FUTURE_MS: i64 = 2 * 24 * 3600 * 1000;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A partition operation failed.
    #[error("Partition error: {0}")]
    Partition(#[from] PartitionError),

    /// A directory under `data/` is neither a partition nor `snapshots`.
    #[error("invalid partition directory name: {0:?}")]
    InvalidPartitionName(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("invalid snapshot name: {0:?}")]
    InvalidSnapshotName(String),

    /// The table is closed and takes no more rows.
    #[error("table is closed")]
    Closed,

    /// Internal invariant violation (poisoned lock, unexpected state, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TableError {
    /// True if the error reports that the table or one of its partitions
    /// was closed during the call.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed | Self::Partition(PartitionError::Closed))
    }
}

impl From<crate::part::PartError> for TableError {
    fn from(e: crate::part::PartError) -> Self {
        Self::Partition(PartitionError::Part(e))
    }
}

// ------------------------------------------------------------------------------------------------
// PartitionWrapper
// ------------------------------------------------------------------------------------------------

/// A partition shared by the table and searches.
pub struct PartitionWrapper {
    partition: Arc<Partition>,
    /// Set by the retention watcher; the data is deleted on drop.
    must_drop: AtomicBool,
}

impl PartitionWrapper {
    fn new(partition: Arc<Partition>) -> Arc<Self> {
        Arc::new(Self {
            partition,
            must_drop: AtomicBool::new(false),
        })
    }

    pub fn partition(&self) -> &Arc<Partition> {
        &self.partition
    }
}

impl Drop for PartitionWrapper {
    fn drop(&mut self) {
        if let Err(e) = self.partition.close() {
            error!(partition = %self.partition.name(), error = %e, "closing partition failed");
            return;
        }
        if self.must_drop.load(Ordering::Acquire) {
            if let Err(e) = self.partition.drop_data() {
                warn!(partition = %self.partition.name(), error = %e, "removing partition data failed");
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Table
// ------------------------------------------------------------------------------------------------

struct RetentionWatcher {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Table {
    path: PathBuf,
    small_path: PathBuf,
    big_path: PathBuf,
    settings: Arc<EngineSettings>,
    partitions: Mutex<Vec<Arc<PartitionWrapper>>>,
    retention_watcher: Mutex<Option<RetentionWatcher>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("path", &self.path)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Table {
    /// Open the table at `path`, creating its directories on first use.
    pub fn open(path: &Path, settings: Arc<EngineSettings>) -> Result<Arc<Self>, TableError> {
        let data = path.join(DATA_DIRNAME);
        let small_path = data.join(SMALL_DIRNAME);
        let big_path = data.join(BIG_DIRNAME);
        fsutil::mkdir_all_sync(&small_path.join(SNAPSHOTS_DIRNAME))?;
        fsutil::mkdir_all_sync(&big_path.join(SNAPSHOTS_DIRNAME))?;
        fsutil::mkdir_all_sync(&path.join(METADATA_DIRNAME))?;

        let deleted = read_deleted_metric_ids(&path.join(METADATA_DIRNAME).join(DELETED_METRIC_IDS_FILENAME))?;
        if !deleted.is_empty() {
            settings.deleted_metric_ids.add(&deleted);
        }

        let mut names = fsutil::read_dir_names(&small_path)?;
        names.extend(fsutil::read_dir_names(&big_path)?);
        names.retain(|n| n != SNAPSHOTS_DIRNAME);
        names.sort();
        names.dedup();

        let mut partitions = Vec::with_capacity(names.len());
        for name in &names {
            if partition_time_range(name).is_none() {
                return Err(TableError::InvalidPartitionName(name.clone()));
            }
            let pt = Partition::open(&small_path, &big_path, name, Arc::clone(&settings))?;
            partitions.push(PartitionWrapper::new(pt));
        }

        let table = Arc::new(Self {
            path: path.to_path_buf(),
            small_path,
            big_path,
            settings,
            partitions: Mutex::new(partitions),
            retention_watcher: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let watcher = start_retention_watcher(&table)?;
        *table.watcher_lock()? = Some(watcher);

        info!(path = %table.path.display(), partitions = names.len(), deleted_series = deleted.len(), "table opened");
        Ok(table)
    }

    /// Stop the retention watcher and close every partition. Calling
    /// `close` more than once is harmless.
    pub fn close(&self) -> Result<(), TableError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let watcher = self.watcher_lock()?.take();
        if let Some(w) = watcher {
            drop(w.stop);
            if w.handle.join().is_err() {
                error!("retention watcher panicked");
            }
        }

        let partitions = std::mem::take(&mut *self.partitions_lock()?);
        let mut first_err = None;
        for ptw in &partitions {
            if let Err(e) = ptw.partition.close() {
                error!(partition = %ptw.partition.name(), error = %e, "closing partition failed");
                first_err.get_or_insert(e);
            }
        }
        drop(partitions);
        info!(path = %self.path.display(), "table closed");
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn settings(&self) -> &Arc<EngineSettings> {
        &self.settings
    }

    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    fn partitions_lock(&self) -> Result<MutexGuard<'_, Vec<Arc<PartitionWrapper>>>, TableError> {
        self.partitions
            .lock()
            .map_err(|_| TableError::Internal("partitions mutex poisoned".into()))
    }

    fn watcher_lock(&self) -> Result<MutexGuard<'_, Option<RetentionWatcher>>, TableError> {
        self.retention_watcher
            .lock()
            .map_err(|_| TableError::Internal("retention watcher mutex poisoned".into()))
    }

    /// The partitions at this instant.
    pub fn partitions(&self) -> Result<Vec<Arc<PartitionWrapper>>, TableError> {
        Ok(self.partitions_lock()?.clone())
    }

    // --------------------------------------------------------------------------------------------
    // Ingestion
    // --------------------------------------------------------------------------------------------

    /// Rows outside `[now - retention, now + 2d]` would be deleted by the
    /// next retention pass and are dropped right away.
    fn accepted_time_range(&self) -> TimeRange {
        let now = now_ms();
        TimeRange::new(
            now.saturating_sub(self.settings.retention_ms),
            now.saturating_add(MAX_FUTURE_MS),
        )
    }

    /// Route `rows` to their partitions, creating missing ones. Returns the
    /// number of rows accepted, or an error for which
    /// [`TableError::is_closed`] holds once `close` has started.
    pub fn add_rows(&self, rows: &[RawRow]) -> Result<usize, TableError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let window = self.accepted_time_range();
        let kept: Vec<RawRow>;
        let rows = if rows.iter().all(|r| window.contains(r.timestamp)) {
            rows
        } else {
            kept = rows.iter().copied().filter(|r| window.contains(r.timestamp)).collect();
            debug!(dropped = rows.len() - kept.len(), window = %window, "dropped rows outside the retention window");
            &kept
        };
        if rows.is_empty() {
            return Ok(0);
        }

        // Common case: every row belongs to one existing partition.
        let single = {
            let partitions = self.partitions_lock()?;
            partitions
                .iter()
                .find(|ptw| rows.iter().all(|r| ptw.partition.has_timestamp(r.timestamp)))
                .cloned()
        };
        if let Some(ptw) = single {
            ptw.partition.add_rows(rows)?;
            return Ok(rows.len());
        }

        let mut by_name: BTreeMap<String, Vec<RawRow>> = BTreeMap::new();
        for r in rows {
            let name = partition_name(r.timestamp)
                .ok_or_else(|| TableError::Internal(format!("no partition for timestamp {}", r.timestamp)))?;
            by_name.entry(name).or_default().push(*r);
        }
        let mut batches = Vec::with_capacity(by_name.len());
        {
            let mut partitions = self.partitions_lock()?;
            // `close` sets the flag before taking the list, so no partition
            // created here can escape it.
            if self.closed.load(Ordering::Acquire) {
                return Err(TableError::Closed);
            }
            for (name, batch) in by_name {
                let existing = partitions.iter().find(|ptw| ptw.partition.name() == name).cloned();
                let ptw = match existing {
                    Some(ptw) => ptw,
                    None => {
                        let pt = Partition::create(
                            &self.small_path,
                            &self.big_path,
                            batch[0].timestamp,
                            Arc::clone(&self.settings),
                        )?;
                        let ptw = PartitionWrapper::new(pt);
                        partitions.push(Arc::clone(&ptw));
                        ptw
                    }
                };
                batches.push((ptw, batch));
            }
        }
        for (ptw, batch) in &batches {
            ptw.partition.add_rows(batch)?;
        }
        Ok(rows.len())
    }

    // --------------------------------------------------------------------------------------------
    // Flush and merge
    // --------------------------------------------------------------------------------------------

    /// Make every buffered row searchable.
    pub fn force_flush(&self) -> Result<(), TableError> {
        for ptw in self.partitions()? {
            ptw.partition.flush_raw_rows(true)?;
        }
        Ok(())
    }

    /// Write every buffered row and in-memory part to disk.
    fn flush_to_disk(&self) -> Result<(), TableError> {
        for ptw in self.partitions()? {
            ptw.partition.flush_raw_rows(true)?;
            ptw.partition.flush_inmemory_parts(true, None)?;
        }
        Ok(())
    }

    /// Force-merge every partition whose name starts with `prefix`.
    pub fn force_merge_partitions(&self, prefix: &str) -> Result<(), TableError> {
        for ptw in self.partitions()? {
            if !ptw.partition.name().starts_with(prefix) {
                continue;
            }
            info!(partition = %ptw.partition.name(), "force merging partition");
            ptw.partition.force_merge()?;
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Retention
    // --------------------------------------------------------------------------------------------

    /// Unlink every partition entirely older than the retention window.
    /// Returns the number of partitions dropped.
    pub fn drop_stale_partitions(&self) -> Result<usize, TableError> {
        let deadline = now_ms().saturating_sub(self.settings.retention_ms);
        let stale: Vec<Arc<PartitionWrapper>> = {
            let mut partitions = self.partitions_lock()?;
            let (stale, live) = std::mem::take(&mut *partitions)
                .into_iter()
                .partition(|ptw| ptw.partition.time_range().max_timestamp < deadline);
            *partitions = live;
            stale
        };
        for ptw in &stale {
            info!(partition = %ptw.partition.name(), "dropping partition outside the retention window");
            ptw.must_drop.store(true, Ordering::Release);
        }
        Ok(stale.len())
    }

    // --------------------------------------------------------------------------------------------
    // Snapshots
    // --------------------------------------------------------------------------------------------

    /// Hard-link every part into a new snapshot and return its name.
    pub fn create_snapshot(&self) -> Result<String, TableError> {
        let start = std::time::Instant::now();
        self.flush_to_disk()?;

        let name = format!(
            "{}-{:016X}",
            chrono::Utc::now().format("%Y%m%d%H%M%S"),
            next_part_suffix()
        );
        let small_dst = self.small_path.join(SNAPSHOTS_DIRNAME).join(&name);
        let big_dst = self.big_path.join(SNAPSHOTS_DIRNAME).join(&name);

        let res = self.link_snapshot(&small_dst, &big_dst);
        if let Err(e) = res {
            fsutil::remove_dir_all_if_exists(&small_dst)?;
            fsutil::remove_dir_all_if_exists(&big_dst)?;
            return Err(e);
        }
        info!(snapshot = %name, duration_ms = start.elapsed().as_millis() as u64, "snapshot created");
        Ok(name)
    }

    fn link_snapshot(&self, small_dst: &Path, big_dst: &Path) -> Result<(), TableError> {
        fsutil::mkdir_fail_if_exists(small_dst)?;
        fsutil::mkdir_fail_if_exists(big_dst)?;
        let _exclusive = self
            .settings
            .snapshot_lock
            .write()
            .map_err(|_| TableError::Internal("snapshot lock poisoned".into()))?;
        for ptw in self.partitions()? {
            let name = ptw.partition.name();
            ptw.partition.create_snapshot_at(&small_dst.join(name), &big_dst.join(name))?;
        }
        fsutil::sync_dir(small_dst)?;
        fsutil::sync_dir(big_dst)?;
        Ok(())
    }

    /// Names of existing snapshots, sorted.
    pub fn list_snapshots(&self) -> Result<Vec<String>, TableError> {
        let mut names = fsutil::read_dir_names(&self.small_path.join(SNAPSHOTS_DIRNAME))?;
        names.retain(|n| is_valid_snapshot_name(n));
        Ok(names)
    }

    pub fn delete_snapshot(&self, name: &str) -> Result<(), TableError> {
        if !is_valid_snapshot_name(name) {
            return Err(TableError::InvalidSnapshotName(name.to_string()));
        }
        let small = self.small_path.join(SNAPSHOTS_DIRNAME).join(name);
        let big = self.big_path.join(SNAPSHOTS_DIRNAME).join(name);
        if !small.exists() && !big.exists() {
            return Err(TableError::SnapshotNotFound(name.to_string()));
        }
        fsutil::remove_dir_all_if_exists(&small)?;
        fsutil::remove_dir_all_if_exists(&big)?;
        info!(snapshot = name, "snapshot deleted");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Deleted series
    // --------------------------------------------------------------------------------------------

    /// Mark `metric_ids` as deleted and persist the whole set.
    pub fn delete_series(&self, metric_ids: &[u64]) -> Result<(), TableError> {
        let ids = self.settings.deleted_metric_ids.add(metric_ids);
        let mut sorted: Vec<u64> = ids.iter().copied().collect();
        sorted.sort_unstable();
        write_deleted_metric_ids(
            &self.path.join(METADATA_DIRNAME).join(DELETED_METRIC_IDS_FILENAME),
            &sorted,
        )?;
        info!(added = metric_ids.len(), total = sorted.len(), "series deleted");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Metrics
    // --------------------------------------------------------------------------------------------

    /// Sum the metrics of every partition. Returns the partitions count.
    pub fn update_metrics(&self, m: &mut PartitionMetrics) -> Result<usize, TableError> {
        let partitions = self.partitions()?;
        for ptw in &partitions {
            ptw.partition.update_metrics(m)?;
        }
        Ok(partitions.len())
    }
}

// ------------------------------------------------------------------------------------------------
// Retention watcher
// ------------------------------------------------------------------------------------------------

fn start_retention_watcher(table: &Arc<Table>) -> std::io::Result<RetentionWatcher> {
    let (stop, stop_rx) = channel::bounded::<()>(1);
    let weak = Arc::downgrade(table);
    let interval = table.settings.retention_check_interval;
    let handle = thread::Builder::new()
        .name("retention-watcher".into())
        .spawn(move || run_retention_watcher(&weak, &stop_rx, interval))?;
    Ok(RetentionWatcher { stop, handle })
}

fn run_retention_watcher(weak: &Weak<Table>, stop: &Receiver<()>, interval: Duration) {
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
        let Some(table) = weak.upgrade() else {
            return;
        };
        if let Err(e) = table.drop_stale_partitions() {
            error!(error = %e, "retention check failed");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// `YYYYMMDDhhmmss-XXXXXXXXXXXXXXXX`
pub fn is_valid_snapshot_name(name: &str) -> bool {
    let Some((ts, suffix)) = name.split_once('-') else {
        return false;
    };
    ts.len() == 14
        && ts.bytes().all(|b| b.is_ascii_digit())
        && suffix.len() == 16
        && suffix.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

fn read_deleted_metric_ids(path: &Path) -> Result<Vec<u64>, TableError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    if data.len() % 8 != 0 {
        return Err(TableError::Internal(format!(
            "{} has {} bytes; want a multiple of 8",
            path.display(),
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(8)
        .map(|c| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(c);
            u64::from_le_bytes(buf)
        })
        .collect())
}

fn write_deleted_metric_ids(path: &Path, ids: &[u64]) -> Result<(), TableError> {
    let mut data = Vec::with_capacity(ids.len() * 8);
    for id in ids {
        data.extend_from_slice(&id.to_le_bytes());
    }
    fsutil::write_file_atomically(path, &data)?;
    Ok(())
}
