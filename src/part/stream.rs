//! Sequential block streams.
//!
//! [`BlockStreamWriter`] appends blocks in `(tsid, min_timestamp)` order and
//! builds the index and metaindex as it goes. [`BlockStreamReader`] walks an
//! existing part block by block and cross-checks every offset and count it
//! sees against the part header, so corruption is reported before a merge
//! copies bad data into a new part.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{
    INDEX_FILENAME, InmemoryPart, MAX_INDEX_BLOCK_SIZE, METAINDEX_FILENAME, MetaindexRow, Part,
    PartError, PartHeader, TIMESTAMPS_FILENAME, VALUES_FILENAME,
};
use crate::block::dedup::DedupPolicy;
use crate::block::{Block, BlockHeader, MAX_BLOCK_SIZE, Tsid};
use crate::encoding::{Encode, compress_zstd};
use crate::fsutil;

// ------------------------------------------------------------------------------------------------
// Merge statistics
// ------------------------------------------------------------------------------------------------

/// Row counters collected while writing or merging a part.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Rows handed to the writer.
    pub rows_merged: u64,
    /// Rows dropped because their series was deleted or they fell out of
    /// retention.
    pub rows_deleted: u64,
    /// Rows removed by deduplication or downsampling.
    pub rows_deduped: u64,
}

/// zstd level for index data, chosen from the average rows per block of the
/// data being written. Sparse series compress poorly, so they get a cheap
/// level.
pub fn compress_level_for(rows_count: u64, blocks_count: u64) -> i32 {
    if blocks_count == 0 {
        return 1;
    }
    match rows_count / blocks_count {
        0..=10 => -5,
        11..=50 => -2,
        51..=200 => -1,
        201..=500 => 1,
        501..=1000 => 2,
        _ => 3,
    }
}

// ------------------------------------------------------------------------------------------------
// Sinks
// ------------------------------------------------------------------------------------------------

enum Sink {
    Memory(Vec<u8>),
    File(BufWriter<File>),
}

impl Sink {
    fn create(path: &Path) -> io::Result<Self> {
        let f = OpenOptions::new().create_new(true).write(true).open(path)?;
        Ok(Self::File(BufWriter::new(f)))
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Memory(v) => {
                v.extend_from_slice(data);
                Ok(())
            }
            Self::File(w) => w.write_all(data),
        }
    }

    /// Flush and fsync a file sink; return the buffer of a memory sink.
    fn finish(self) -> io::Result<Vec<u8>> {
        match self {
            Self::Memory(v) => Ok(v),
            Self::File(mut w) => {
                w.flush()?;
                w.get_ref().sync_all()?;
                Ok(Vec::new())
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// BlockStreamWriter
// ------------------------------------------------------------------------------------------------

/// Writes blocks into a new part, in memory or in a directory.
pub struct BlockStreamWriter {
    dir: Option<PathBuf>,
    compress_level: i32,
    policy: DedupPolicy,
    now_ms: i64,

    timestamps: Sink,
    values: Sink,
    index: Sink,
    metaindex: Sink,

    timestamps_offset: u64,
    values_offset: u64,
    index_offset: u64,

    /// Encoded headers of the index block being built.
    index_data: Vec<u8>,
    mr: MetaindexRow,
    metaindex_data: Vec<u8>,

    prev_tsid: Option<Tsid>,
    /// Location and bytes of the last written timestamps column; a block
    /// with identical timestamps points at it instead of writing a copy.
    prev_timestamps_offset: u64,
    prev_timestamps_data: Vec<u8>,
}

impl BlockStreamWriter {
    pub fn in_memory(compress_level: i32, policy: DedupPolicy, now_ms: i64) -> Self {
        Self::with_sinks(
            None,
            compress_level,
            policy,
            now_ms,
            [
                Sink::Memory(Vec::new()),
                Sink::Memory(Vec::new()),
                Sink::Memory(Vec::new()),
                Sink::Memory(Vec::new()),
            ],
        )
    }

    /// Create `dir` (it must not exist) and the four part files in it.
    pub fn create(dir: &Path, compress_level: i32, policy: DedupPolicy, now_ms: i64) -> Result<Self, PartError> {
        fsutil::mkdir_fail_if_exists(dir)?;
        let sinks = [
            Sink::create(&dir.join(TIMESTAMPS_FILENAME))?,
            Sink::create(&dir.join(VALUES_FILENAME))?,
            Sink::create(&dir.join(INDEX_FILENAME))?,
            Sink::create(&dir.join(METAINDEX_FILENAME))?,
        ];
        Ok(Self::with_sinks(
            Some(dir.to_path_buf()),
            compress_level,
            policy,
            now_ms,
            sinks,
        ))
    }

    fn with_sinks(
        dir: Option<PathBuf>,
        compress_level: i32,
        policy: DedupPolicy,
        now_ms: i64,
        [timestamps, values, index, metaindex]: [Sink; 4],
    ) -> Self {
        Self {
            dir,
            compress_level,
            policy,
            now_ms,
            timestamps,
            values,
            index,
            metaindex,
            timestamps_offset: 0,
            values_offset: 0,
            index_offset: 0,
            index_data: Vec::with_capacity(MAX_INDEX_BLOCK_SIZE),
            mr: MetaindexRow::default(),
            metaindex_data: Vec::new(),
            prev_tsid: None,
            prev_timestamps_offset: 0,
            prev_timestamps_data: Vec::new(),
        }
    }

    /// Deduplicate, marshal and append `b`, updating `ph` and `stats`.
    ///
    /// # Panics
    ///
    /// If `b` belongs to a series smaller than the previously written one.
    pub fn write_external_block(
        &mut self,
        b: &mut Block,
        ph: &mut PartHeader,
        stats: &mut MergeStats,
    ) -> Result<(), PartError> {
        stats.rows_merged += b.rows_count() as u64;
        if b.is_marshaled() && self.policy.needs_downsampling(b.header().min_timestamp, self.now_ms) {
            b.unmarshal_data()?;
        }
        stats.rows_deduped += b.deduplicate_samples_during_merge(&self.policy, self.now_ms) as u64;

        b.marshal_data(self.timestamps_offset, self.values_offset)?;
        // Readers reject blocks above this size as corrupted.
        assert!(
            b.timestamps_data().len() <= 2 * MAX_BLOCK_SIZE && b.values_data().len() <= 2 * MAX_BLOCK_SIZE,
            "BUG: marshaled block of {} exceeds {} bytes: timestamps {}, values {}",
            b.tsid(),
            2 * MAX_BLOCK_SIZE,
            b.timestamps_data().len(),
            b.values_data().len()
        );
        let shared_timestamps =
            !self.prev_timestamps_data.is_empty() && b.timestamps_data() == self.prev_timestamps_data.as_slice();
        if shared_timestamps {
            b.header.timestamps_block_offset = self.prev_timestamps_offset;
        } else {
            self.timestamps.write_all(b.timestamps_data())?;
            self.prev_timestamps_offset = self.timestamps_offset;
            self.prev_timestamps_data.clear();
            self.prev_timestamps_data.extend_from_slice(b.timestamps_data());
            self.timestamps_offset += b.timestamps_data().len() as u64;
        }
        self.values.write_all(b.values_data())?;
        self.values_offset += b.values_data().len() as u64;

        let bh = b.header;
        if let Some(prev) = self.prev_tsid {
            assert!(
                bh.tsid >= prev,
                "BUG: blocks must be written in TSID order; {} follows {prev}",
                bh.tsid
            );
        }
        self.prev_tsid = Some(bh.tsid);

        bh.encode_to(&mut self.index_data)?;
        self.mr.register_block_header(&bh);
        ph.update_from_block(&bh);
        if self.index_data.len() >= MAX_INDEX_BLOCK_SIZE {
            self.flush_index_data()?;
        }
        Ok(())
    }

    fn flush_index_data(&mut self) -> Result<(), PartError> {
        if self.index_data.is_empty() {
            return Ok(());
        }
        let mut compressed = Vec::new();
        compress_zstd(&mut compressed, &self.index_data, self.compress_level)?;
        self.index.write_all(&compressed)?;

        self.mr.index_block_offset = self.index_offset;
        self.mr.index_block_size = compressed.len() as u32;
        self.index_offset += compressed.len() as u64;
        self.mr.encode_to(&mut self.metaindex_data)?;

        self.mr = MetaindexRow::default();
        self.index_data.clear();
        Ok(())
    }

    fn finish_streams(mut self) -> Result<(Option<PathBuf>, [Vec<u8>; 4]), PartError> {
        self.flush_index_data()?;
        let mut metaindex_compressed = Vec::new();
        if !self.metaindex_data.is_empty() {
            compress_zstd(&mut metaindex_compressed, &self.metaindex_data, self.compress_level)?;
        }
        self.metaindex.write_all(&metaindex_compressed)?;
        let streams = [
            self.timestamps.finish()?,
            self.values.finish()?,
            self.index.finish()?,
            self.metaindex.finish()?,
        ];
        Ok((self.dir, streams))
    }

    /// Flush and fsync a directory-backed writer.
    pub fn finish(self) -> Result<(), PartError> {
        let (dir, _) = self.finish_streams()?;
        if let Some(dir) = dir {
            fsutil::sync_dir(&dir)?;
        }
        Ok(())
    }

    /// Finish an in-memory writer. The caller fills in the header.
    pub fn finish_in_memory(self) -> Result<InmemoryPart, PartError> {
        let (_, [timestamps_data, values_data, index_data, metaindex_data]) = self.finish_streams()?;
        Ok(InmemoryPart {
            header: PartHeader::default(),
            timestamps_data,
            values_data,
            index_data,
            metaindex_data,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// BlockStreamReader
// ------------------------------------------------------------------------------------------------

/// Reads every block of a part in storage order.
pub struct BlockStreamReader {
    part: Arc<Part>,
    block: Block,

    mr_idx: usize,
    headers: Vec<BlockHeader>,
    header_idx: usize,

    blocks_count: u64,
    rows_count: u64,
    timestamps_offset: u64,
    values_offset: u64,
    index_offset: u64,

    prev_timestamps_offset: u64,
    prev_timestamps_data: Vec<u8>,
    prev_tsid: Option<Tsid>,
}

impl BlockStreamReader {
    pub fn new(part: Arc<Part>) -> Self {
        Self {
            part,
            block: Block::default(),
            mr_idx: 0,
            headers: Vec::new(),
            header_idx: 0,
            blocks_count: 0,
            rows_count: 0,
            timestamps_offset: 0,
            values_offset: 0,
            index_offset: 0,
            prev_timestamps_offset: 0,
            prev_timestamps_data: Vec::new(),
            prev_tsid: None,
        }
    }

    pub fn part(&self) -> &Arc<Part> {
        &self.part
    }

    /// The block loaded by the last successful [`Self::next_block`].
    pub fn block(&self) -> &Block {
        &self.block
    }

    /// Move the current block out. The reader must be advanced before the
    /// block is accessed again.
    pub fn take_block(&mut self) -> Block {
        std::mem::take(&mut self.block)
    }

    fn corrupted(&self, msg: String) -> PartError {
        PartError::Corrupted(format!("{}: {msg}", self.part.describe()))
    }

    /// Load the next block. Returns `false` once the part is exhausted.
    pub fn next_block(&mut self) -> Result<bool, PartError> {
        if self.header_idx >= self.headers.len() && !self.read_next_index_block()? {
            let ph = *self.part.header();
            if self.blocks_count != ph.blocks_count {
                return Err(self.corrupted(format!(
                    "read {} blocks; part header says {}",
                    self.blocks_count, ph.blocks_count
                )));
            }
            if self.rows_count != ph.rows_count {
                return Err(self.corrupted(format!(
                    "read {} rows; part header says {}",
                    self.rows_count, ph.rows_count
                )));
            }
            return Ok(false);
        }
        let bh = self.headers[self.header_idx];
        self.header_idx += 1;
        self.check_block_header(&bh)?;

        let timestamps = if !self.prev_timestamps_data.is_empty()
            && bh.timestamps_block_offset == self.prev_timestamps_offset
        {
            if bh.timestamps_block_size as usize != self.prev_timestamps_data.len() {
                return Err(self.corrupted(format!(
                    "shared timestamps block at offset {} has size {}; expected {}",
                    bh.timestamps_block_offset,
                    bh.timestamps_block_size,
                    self.prev_timestamps_data.len()
                )));
            }
            self.prev_timestamps_data.clone()
        } else {
            if bh.timestamps_block_offset != self.timestamps_offset {
                return Err(self.corrupted(format!(
                    "unexpected timestamps block offset {}; expected {}",
                    bh.timestamps_block_offset, self.timestamps_offset
                )));
            }
            let data = self
                .part
                .read_timestamps_at(bh.timestamps_block_offset, bh.timestamps_block_size)?;
            self.prev_timestamps_offset = bh.timestamps_block_offset;
            self.prev_timestamps_data.clone_from(&data);
            self.timestamps_offset += u64::from(bh.timestamps_block_size);
            data
        };

        if bh.values_block_offset != self.values_offset {
            return Err(self.corrupted(format!(
                "unexpected values block offset {}; expected {}",
                bh.values_block_offset, self.values_offset
            )));
        }
        let values = self.part.read_values_at(bh.values_block_offset, bh.values_block_size)?;
        self.values_offset += u64::from(bh.values_block_size);

        self.block = Block::from_marshaled(bh, timestamps, values);
        Ok(true)
    }

    fn check_block_header(&mut self, bh: &BlockHeader) -> Result<(), PartError> {
        let ph = *self.part.header();
        self.blocks_count += 1;
        if self.blocks_count > ph.blocks_count {
            return Err(self.corrupted(format!(
                "too many blocks; part header says {}",
                ph.blocks_count
            )));
        }
        self.rows_count += u64::from(bh.rows_count);
        if self.rows_count > ph.rows_count {
            return Err(self.corrupted(format!(
                "too many rows; part header says {}",
                ph.rows_count
            )));
        }
        if bh.min_timestamp < ph.min_timestamp || bh.max_timestamp > ph.max_timestamp {
            return Err(self.corrupted(format!(
                "block time range [{}..{}] is outside the part range [{}..{}]",
                bh.min_timestamp, bh.max_timestamp, ph.min_timestamp, ph.max_timestamp
            )));
        }
        if let Some(prev) = self.prev_tsid {
            if bh.tsid < prev {
                return Err(self.corrupted(format!(
                    "blocks are not sorted by TSID: {} follows {prev}",
                    bh.tsid
                )));
            }
        }
        self.prev_tsid = Some(bh.tsid);
        Ok(())
    }

    fn read_next_index_block(&mut self) -> Result<bool, PartError> {
        let Some(mr) = self.part.metaindex().get(self.mr_idx).copied() else {
            return Ok(false);
        };
        self.mr_idx += 1;
        if mr.index_block_offset != self.index_offset {
            return Err(self.corrupted(format!(
                "unexpected index block offset {}; expected {}",
                mr.index_block_offset, self.index_offset
            )));
        }
        let ph = *self.part.header();
        if mr.min_timestamp < ph.min_timestamp || mr.max_timestamp > ph.max_timestamp {
            return Err(self.corrupted(format!(
                "index block time range [{}..{}] is outside the part range [{}..{}]",
                mr.min_timestamp, mr.max_timestamp, ph.min_timestamp, ph.max_timestamp
            )));
        }
        self.headers = self.part.read_index_block_uncached(&mr)?;
        self.header_idx = 0;
        self.index_offset += u64::from(mr.index_block_size);
        Ok(true)
    }
}
