//! Immutable parts.
//!
//! A part is a sorted run of [`Block`]s stored as four byte streams:
//!
//! ```text
//! timestamps.bin   marshaled timestamp columns, back to back
//! values.bin       marshaled value columns, back to back
//! index.bin        zstd-compressed index blocks, each a run of 81-byte BlockHeaders
//! metaindex.bin    one zstd frame holding a MetaindexRow per index block
//! ```
//!
//! The streams live either in memory ([`InmemoryPart`]) or as four files in a
//! directory whose name encodes the [`PartHeader`]:
//!
//! ```text
//! {rows}_{blocks}_{min_ts}_{max_ts}_{suffix:016X}
//! ```
//!
//! with timestamps rendered as `YYYYmmddHHMMSS.mmm` UTC. Lookups go
//! metaindex → index block (cached in [`cache::IndexBlockCache`]) →
//! block header → column data.
//!
//! # Sub-modules
//!
//! - [`cache`]: process-wide LRU of decompressed index blocks.
//! - [`stream`]: sequential [`stream::BlockStreamWriter`] / [`stream::BlockStreamReader`].
//! - [`search`]: [`search::PartSearch`], TSID and time-range lookups.

pub(crate) mod cache;
pub(crate) mod search;
pub(crate) mod stream;

#[cfg(test)]
mod tests;

use std::fmt;
use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, NaiveDateTime};
use memmap2::Mmap;
use thiserror::Error;

use crate::block::dedup::DedupPolicy;
use crate::block::{Block, BlockHeader, MAX_BLOCK_SIZE, MAX_ROWS_PER_BLOCK, RawRow, Tsid};
use crate::encoding::decimal;
use crate::encoding::{Decode, Encode, EncodingError, decompress_zstd, require};
use cache::IndexBlockCache;
use stream::{BlockStreamWriter, MergeStats};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub const TIMESTAMPS_FILENAME: &str = "timestamps.bin";
pub const VALUES_FILENAME: &str = "values.bin";
pub const INDEX_FILENAME: &str = "index.bin";
pub const METAINDEX_FILENAME: &str = "metaindex.bin";

/// Upper bound on the rows of any part.
pub const MAX_ROWS_PER_BIG_PART: u64 = 1_000_000_000_000;

/// Uncompressed index blocks are flushed once they reach this size.
pub const MAX_INDEX_BLOCK_SIZE: usize = 64 * 1024;

/// Size of an encoded [`MetaindexRow`].
pub const METAINDEX_ROW_SIZE: usize = 56;

const DIR_NAME_TIME_FORMAT: &str = "%Y%m%d%H%M%S%.3f";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned while building, opening or reading parts.
#[derive(Debug, Error)]
pub enum PartError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// On-disk data violates a structural invariant.
    #[error("Corrupted part: {0}")]
    Corrupted(String),
}

// ------------------------------------------------------------------------------------------------
// Part naming
// ------------------------------------------------------------------------------------------------

static NEXT_PART_SUFFIX: LazyLock<AtomicU64> = LazyLock::new(|| {
    let seed = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    AtomicU64::new(seed as u64)
});

static NEXT_PART_ID: AtomicU64 = AtomicU64::new(1);

/// Unique suffix for a new part directory or txn file.
pub fn next_part_suffix() -> u64 {
    NEXT_PART_SUFFIX.fetch_add(1, Ordering::Relaxed)
}

fn format_dir_timestamp(ts: i64) -> String {
    match DateTime::from_timestamp_millis(ts) {
        Some(dt) => dt.format(DIR_NAME_TIME_FORMAT).to_string(),
        None => ts.to_string(),
    }
}

fn parse_dir_timestamp(s: &str) -> Option<i64> {
    if s.contains('.') {
        NaiveDateTime::parse_from_str(s, DIR_NAME_TIME_FORMAT)
            .ok()
            .map(|dt| dt.and_utc().timestamp_millis())
    } else {
        s.parse().ok()
    }
}

// ------------------------------------------------------------------------------------------------
// PartHeader
// ------------------------------------------------------------------------------------------------

/// Row and block counts plus the time range of a part.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartHeader {
    pub rows_count: u64,
    pub blocks_count: u64,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

impl PartHeader {
    /// Account for one more block written to the part.
    pub fn update_from_block(&mut self, bh: &BlockHeader) {
        if self.blocks_count == 0 {
            self.min_timestamp = bh.min_timestamp;
            self.max_timestamp = bh.max_timestamp;
        } else {
            self.min_timestamp = self.min_timestamp.min(bh.min_timestamp);
            self.max_timestamp = self.max_timestamp.max(bh.max_timestamp);
        }
        self.rows_count += u64::from(bh.rows_count);
        self.blocks_count += 1;
    }

    pub fn validate(&self) -> Result<(), PartError> {
        if self.rows_count == 0 {
            return Err(PartError::Corrupted("part cannot be empty".into()));
        }
        if self.blocks_count == 0 || self.blocks_count > self.rows_count {
            return Err(PartError::Corrupted(format!(
                "blocks count must be in [1..{}]; got {}",
                self.rows_count, self.blocks_count
            )));
        }
        if self.rows_count > MAX_ROWS_PER_BIG_PART {
            return Err(PartError::Corrupted(format!(
                "too many rows in a part: {}; cannot exceed {MAX_ROWS_PER_BIG_PART}",
                self.rows_count
            )));
        }
        if self.min_timestamp > self.max_timestamp {
            return Err(PartError::Corrupted(format!(
                "min timestamp {} exceeds max timestamp {}",
                self.min_timestamp, self.max_timestamp
            )));
        }
        Ok(())
    }

    /// Directory name for a part with this header.
    pub fn dir_name(&self, suffix: u64) -> String {
        format!(
            "{}_{}_{}_{}_{suffix:016X}",
            self.rows_count,
            self.blocks_count,
            format_dir_timestamp(self.min_timestamp),
            format_dir_timestamp(self.max_timestamp),
        )
    }

    /// Inverse of [`PartHeader::dir_name`].
    pub fn parse_dir_name(name: &str) -> Result<Self, PartError> {
        let bad = || PartError::Corrupted(format!("invalid part directory name {name:?}"));
        let fields: Vec<&str> = name.split('_').collect();
        if fields.len() != 5 {
            return Err(bad());
        }
        u64::from_str_radix(fields[4], 16).map_err(|_| bad())?;
        let ph = Self {
            rows_count: fields[0].parse().map_err(|_| bad())?,
            blocks_count: fields[1].parse().map_err(|_| bad())?,
            min_timestamp: parse_dir_timestamp(fields[2]).ok_or_else(bad)?,
            max_timestamp: parse_dir_timestamp(fields[3]).ok_or_else(bad)?,
        };
        ph.validate()?;
        Ok(ph)
    }
}

impl fmt::Display for PartHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rows in {} blocks [{}..{}]",
            self.rows_count, self.blocks_count, self.min_timestamp, self.max_timestamp
        )
    }
}

// ------------------------------------------------------------------------------------------------
// MetaindexRow
// ------------------------------------------------------------------------------------------------

/// Summary of one compressed index block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaindexRow {
    /// TSID of the first block header in the index block.
    pub tsid: Tsid,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub block_headers_count: u32,
    pub index_block_offset: u64,
    pub index_block_size: u32,
}

impl MetaindexRow {
    pub fn register_block_header(&mut self, bh: &BlockHeader) {
        if self.block_headers_count == 0 {
            self.tsid = bh.tsid;
            self.min_timestamp = bh.min_timestamp;
            self.max_timestamp = bh.max_timestamp;
        } else {
            self.min_timestamp = self.min_timestamp.min(bh.min_timestamp);
            self.max_timestamp = self.max_timestamp.max(bh.max_timestamp);
        }
        self.block_headers_count += 1;
    }
}

impl Encode for MetaindexRow {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.tsid.encode_to(buf)?;
        self.min_timestamp.encode_to(buf)?;
        self.max_timestamp.encode_to(buf)?;
        self.block_headers_count.encode_to(buf)?;
        self.index_block_offset.encode_to(buf)?;
        self.index_block_size.encode_to(buf)
    }
}

impl Decode for MetaindexRow {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, METAINDEX_ROW_SIZE)?;
        let (tsid, mut off) = Tsid::decode_from(buf)?;
        let (min_timestamp, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (max_timestamp, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (block_headers_count, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (index_block_offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (index_block_size, n) = u32::decode_from(&buf[off..])?;
        off += n;

        if block_headers_count == 0 {
            return Err(EncodingError::Corrupted(
                "metaindex row must reference at least one block header".into(),
            ));
        }
        if index_block_size as usize > 2 * MAX_BLOCK_SIZE {
            return Err(EncodingError::Corrupted(format!(
                "too big index block: {index_block_size} bytes; cannot exceed {}",
                2 * MAX_BLOCK_SIZE
            )));
        }
        Ok((
            Self {
                tsid,
                min_timestamp,
                max_timestamp,
                block_headers_count,
                index_block_offset,
                index_block_size,
            },
            off,
        ))
    }
}

/// Decompress and decode a `metaindex.bin` payload.
pub fn decode_metaindex(compressed: &[u8]) -> Result<Vec<MetaindexRow>, PartError> {
    if compressed.is_empty() {
        return Ok(Vec::new());
    }
    let data = decompress_zstd(compressed)?;
    if data.len() % METAINDEX_ROW_SIZE != 0 {
        return Err(PartError::Corrupted(format!(
            "metaindex size {} is not a multiple of {METAINDEX_ROW_SIZE}",
            data.len()
        )));
    }
    let mut rows = Vec::with_capacity(data.len() / METAINDEX_ROW_SIZE);
    for chunk in data.chunks_exact(METAINDEX_ROW_SIZE) {
        let (mr, _) = MetaindexRow::decode_from(chunk)?;
        if let Some(prev) = rows.last().map(|r: &MetaindexRow| r.tsid) {
            if mr.tsid < prev {
                return Err(PartError::Corrupted(format!(
                    "metaindex rows are not sorted by TSID: {} follows {prev}",
                    mr.tsid
                )));
            }
        }
        rows.push(mr);
    }
    Ok(rows)
}

// ------------------------------------------------------------------------------------------------
// InmemoryPart
// ------------------------------------------------------------------------------------------------

/// A freshly built part whose streams live in memory.
#[derive(Debug, Default)]
pub struct InmemoryPart {
    pub header: PartHeader,
    pub timestamps_data: Vec<u8>,
    pub values_data: Vec<u8>,
    pub index_data: Vec<u8>,
    pub metaindex_data: Vec<u8>,
}

impl InmemoryPart {
    /// Pack raw rows into per-series blocks of at most [`MAX_ROWS_PER_BLOCK`]
    /// rows. `rows` is sorted in place by `(tsid, timestamp)`; rows with
    /// equal keys keep their insertion order. A change of precision within
    /// a series starts a new block.
    pub fn from_raw_rows(rows: &mut [RawRow], policy: &DedupPolicy, now_ms: i64) -> Result<Self, PartError> {
        rows.sort_by(|a, b| a.tsid.cmp(&b.tsid).then(a.timestamp.cmp(&b.timestamp)));

        let mut ph = PartHeader::default();
        let mut stats = MergeStats::default();
        let mut bsw = BlockStreamWriter::in_memory(-5, policy.clone(), now_ms);
        let mut floats = Vec::with_capacity(MAX_ROWS_PER_BLOCK);
        for run in rows.chunk_by(|a, b| a.tsid == b.tsid && a.precision_bits == b.precision_bits) {
            for chunk in run.chunks(MAX_ROWS_PER_BLOCK) {
                let first = &chunk[0];
                let timestamps: Vec<i64> = chunk.iter().map(|r| r.timestamp).collect();
                floats.clear();
                floats.extend(chunk.iter().map(|r| r.value));
                let mut values = Vec::with_capacity(chunk.len());
                let scale = decimal::append_float_to_decimal(&mut values, &floats);
                let mut block = Block::new(first.tsid, timestamps, values, scale, first.precision_bits);
                bsw.write_external_block(&mut block, &mut ph, &mut stats)?;
            }
        }
        let mut mp = bsw.finish_in_memory()?;
        mp.header = ph;
        Ok(mp)
    }
}

// ------------------------------------------------------------------------------------------------
// Data sources
// ------------------------------------------------------------------------------------------------

/// Backing storage of one part stream.
enum DataSource {
    Memory(Vec<u8>),
    Mapped(Mmap),
    /// Positioned reads without mapping, used for big parts.
    File { file: File, len: u64 },
}

impl DataSource {
    fn open(path: &Path, uncached: bool) -> Result<Self, PartError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if uncached {
            return Ok(Self::File { file, len });
        }
        if len == 0 {
            return Ok(Self::Memory(Vec::new()));
        }
        // SAFETY: part files are immutable once their directory is renamed
        // into place, and are only removed after the last reader is gone.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self::Mapped(mmap))
    }

    fn len(&self) -> u64 {
        match self {
            Self::Memory(v) => v.len() as u64,
            Self::Mapped(m) => m.len() as u64,
            Self::File { len, .. } => *len,
        }
    }

    fn read_at(&self, offset: u64, size: u32, what: &str, part: &str) -> Result<Vec<u8>, PartError> {
        let end = offset.checked_add(u64::from(size));
        if end.is_none_or(|end| end > self.len()) {
            return Err(PartError::Corrupted(format!(
                "{part}: cannot read {size} bytes at offset {offset} from {what} of {} bytes",
                self.len()
            )));
        }
        let (start, end) = (offset as usize, offset as usize + size as usize);
        match self {
            Self::Memory(v) => Ok(v[start..end].to_vec()),
            Self::Mapped(m) => Ok(m[start..end].to_vec()),
            Self::File { file, .. } => {
                let mut buf = vec![0u8; size as usize];
                file.read_exact_at(&mut buf, offset)?;
                Ok(buf)
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Part
// ------------------------------------------------------------------------------------------------

/// An opened, immutable part.
///
/// Shared as `Arc<Part>` between its owning partition, searches and merges.
/// Dropping the last reference evicts its index blocks from the cache.
pub struct Part {
    /// Process-unique id, used as the cache key.
    id: u64,
    header: PartHeader,
    path: Option<PathBuf>,
    metaindex: Vec<MetaindexRow>,
    timestamps: DataSource,
    values: DataSource,
    index: DataSource,
    size_bytes: u64,
    cache: Arc<IndexBlockCache>,
}

impl Part {
    /// Open a part directory. Big parts pass `uncached = true` and are read
    /// with positioned reads instead of memory maps.
    pub fn open(path: &Path, cache: Arc<IndexBlockCache>, uncached: bool) -> Result<Self, PartError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PartError::Corrupted(format!("invalid part path {}", path.display())))?;
        let header = PartHeader::parse_dir_name(name)?;
        let metaindex_data = fs::read(path.join(METAINDEX_FILENAME))?;
        let metaindex = decode_metaindex(&metaindex_data)?;
        let timestamps = DataSource::open(&path.join(TIMESTAMPS_FILENAME), uncached)?;
        let values = DataSource::open(&path.join(VALUES_FILENAME), uncached)?;
        let index = DataSource::open(&path.join(INDEX_FILENAME), uncached)?;
        Self::new(
            header,
            Some(path.to_path_buf()),
            metaindex,
            metaindex_data.len() as u64,
            [timestamps, values, index],
            cache,
        )
    }

    /// Wrap an in-memory part.
    pub fn from_inmemory(mp: InmemoryPart, cache: Arc<IndexBlockCache>) -> Result<Self, PartError> {
        let metaindex = decode_metaindex(&mp.metaindex_data)?;
        Self::new(
            mp.header,
            None,
            metaindex,
            mp.metaindex_data.len() as u64,
            [
                DataSource::Memory(mp.timestamps_data),
                DataSource::Memory(mp.values_data),
                DataSource::Memory(mp.index_data),
            ],
            cache,
        )
    }

    fn new(
        header: PartHeader,
        path: Option<PathBuf>,
        metaindex: Vec<MetaindexRow>,
        metaindex_size: u64,
        [timestamps, values, index]: [DataSource; 3],
        cache: Arc<IndexBlockCache>,
    ) -> Result<Self, PartError> {
        header.validate()?;
        let blocks: u64 = metaindex.iter().map(|mr| u64::from(mr.block_headers_count)).sum();
        if blocks != header.blocks_count {
            return Err(PartError::Corrupted(format!(
                "metaindex references {blocks} blocks; part header says {}",
                header.blocks_count
            )));
        }
        let size_bytes = timestamps.len() + values.len() + index.len() + metaindex_size;
        Ok(Self {
            id: NEXT_PART_ID.fetch_add(1, Ordering::Relaxed),
            header,
            path,
            metaindex,
            timestamps,
            values,
            index,
            size_bytes,
            cache,
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn header(&self) -> &PartHeader {
        &self.header
    }

    /// Directory of a file part; `None` for in-memory parts.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn metaindex(&self) -> &[MetaindexRow] {
        &self.metaindex
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    fn describe(&self) -> String {
        match &self.path {
            Some(p) => p.display().to_string(),
            None => "inmemory part".to_string(),
        }
    }

    /// Block headers of the index block described by `mr`, through the cache.
    pub fn read_index_block(&self, mr: &MetaindexRow) -> Result<Arc<Vec<BlockHeader>>, PartError> {
        if let Some(bhs) = self.cache.get(self.id, mr.index_block_offset) {
            return Ok(bhs);
        }
        let bhs = Arc::new(self.read_index_block_uncached(mr)?);
        self.cache.insert(self.id, mr.index_block_offset, Arc::clone(&bhs));
        Ok(bhs)
    }

    /// Block headers of the index block described by `mr`, bypassing the cache.
    pub fn read_index_block_uncached(&self, mr: &MetaindexRow) -> Result<Vec<BlockHeader>, PartError> {
        let compressed = self.index.read_at(
            mr.index_block_offset,
            mr.index_block_size,
            INDEX_FILENAME,
            &self.describe(),
        )?;
        let data = decompress_zstd(&compressed).map_err(|e| {
            PartError::Corrupted(format!(
                "{}: cannot decompress index block at offset {}: {e}",
                self.describe(),
                mr.index_block_offset
            ))
        })?;
        crate::block::decode_block_headers(&data, mr.block_headers_count as usize).map_err(|e| {
            PartError::Corrupted(format!(
                "{}: cannot decode index block at offset {}: {e}",
                self.describe(),
                mr.index_block_offset
            ))
        })
    }

    /// Read the marshaled block described by `bh`.
    pub fn read_block(&self, bh: &BlockHeader) -> Result<Block, PartError> {
        let (timestamps, values) = self.read_block_data(bh)?;
        Ok(Block::from_marshaled(*bh, timestamps, values))
    }

    fn read_block_data(&self, bh: &BlockHeader) -> Result<(Vec<u8>, Vec<u8>), PartError> {
        let part = self.describe();
        let timestamps = self.timestamps.read_at(
            bh.timestamps_block_offset,
            bh.timestamps_block_size,
            TIMESTAMPS_FILENAME,
            &part,
        )?;
        let values = self
            .values
            .read_at(bh.values_block_offset, bh.values_block_size, VALUES_FILENAME, &part)?;
        Ok((timestamps, values))
    }

    fn read_values_at(&self, offset: u64, size: u32) -> Result<Vec<u8>, PartError> {
        self.values.read_at(offset, size, VALUES_FILENAME, &self.describe())
    }

    fn read_timestamps_at(&self, offset: u64, size: u32) -> Result<Vec<u8>, PartError> {
        self.timestamps
            .read_at(offset, size, TIMESTAMPS_FILENAME, &self.describe())
    }
}

impl Drop for Part {
    fn drop(&mut self) {
        self.cache.remove_part(self.id);
    }
}

impl fmt::Debug for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Part")
            .field("id", &self.id)
            .field("header", &self.header)
            .field("path", &self.path)
            .field("size_bytes", &self.size_bytes)
            .finish_non_exhaustive()
    }
}
