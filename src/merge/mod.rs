//! K-way merge of block streams.
//!
//! Both compaction and search consume several sorted block streams and need
//! one stream ordered by `(tsid, min_timestamp)`. [`BlockStreamHeap`] does
//! that for any [`BlockStream`], and nests: a heap of heaps is again a
//! stream.
//!
//! [`merge_block_streams`] drives a heap of part readers into a
//! [`BlockStreamWriter`]:
//!
//! - blocks of deleted series, and blocks entirely older than the retention
//!   deadline, are dropped and counted as deleted;
//! - consecutive blocks of one series are merged sample by sample into
//!   blocks of at most [`MAX_ROWS_PER_BLOCK`] rows, except that a full
//!   pending block which does not overlap the next one is written as is;
//! - the writer deduplicates every decoded block before marshaling it.
//!
//! The merge polls an optional stop channel between blocks and aborts with
//! [`MergeError::ForciblyStopped`]; the caller discards the partial output.

pub(crate) mod selection;

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use crossbeam::channel::{Receiver, TryRecvError};
use thiserror::Error;

use crate::block::{Block, BlockHeader, MAX_ROWS_PER_BLOCK};
use crate::encoding::decimal;
use crate::part::search::PartSearch;
use crate::part::stream::{BlockStreamReader, BlockStreamWriter};
use crate::part::{PartError, PartHeader};

pub use crate::part::stream::MergeStats;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MergeError {
    /// Reading a source part or writing the destination failed.
    #[error("Part error: {0}")]
    Part(#[from] PartError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stop channel fired while merging.
    #[error("merge was forcibly stopped")]
    ForciblyStopped,

    /// No parts qualify for a merge. Only used as a scheduler signal.
    #[error("nothing to merge")]
    NothingToMerge,
}

// ------------------------------------------------------------------------------------------------
// Deleted series
// ------------------------------------------------------------------------------------------------

/// Copy-on-write set of deleted metric ids, shared by the table and every
/// partition.
#[derive(Debug, Default)]
pub struct DeletedMetricIds {
    ids: RwLock<Arc<HashSet<u64>>>,
}

impl DeletedMetricIds {
    pub fn new(ids: HashSet<u64>) -> Self {
        Self {
            ids: RwLock::new(Arc::new(ids)),
        }
    }

    /// The current set. Later additions do not affect the returned value.
    pub fn snapshot(&self) -> Arc<HashSet<u64>> {
        Arc::clone(&self.ids.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Add `ids` and return the resulting set.
    pub fn add(&self, ids: &[u64]) -> Arc<HashSet<u64>> {
        let mut guard = self.ids.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = HashSet::clone(&guard);
        next.extend(ids.iter().copied());
        *guard = Arc::new(next);
        Arc::clone(&guard)
    }
}

// ------------------------------------------------------------------------------------------------
// Block streams
// ------------------------------------------------------------------------------------------------

/// A cursor over blocks sorted by `(tsid, min_timestamp)`.
pub trait BlockStream {
    /// Header of the current block. Only valid after `advance` returned
    /// `true`.
    fn header(&self) -> &BlockHeader;

    /// Move to the next block. Returns `false` when exhausted.
    fn advance(&mut self) -> Result<bool, PartError>;
}

impl BlockStream for BlockStreamReader {
    fn header(&self) -> &BlockHeader {
        self.block().header()
    }

    fn advance(&mut self) -> Result<bool, PartError> {
        self.next_block()
    }
}

impl BlockStream for PartSearch {
    fn header(&self) -> &BlockHeader {
        PartSearch::header(self)
    }

    fn advance(&mut self) -> Result<bool, PartError> {
        self.next_block()
    }
}

struct HeapItem<S> {
    /// Position of the stream in the input; the earlier stream wins ties.
    seq: usize,
    stream: S,
}

impl<S: BlockStream> PartialEq for HeapItem<S> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<S: BlockStream> Eq for HeapItem<S> {}

impl<S: BlockStream> PartialOrd for HeapItem<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S: BlockStream> Ord for HeapItem<S> {
    // Reversed: BinaryHeap is a max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .stream
            .header()
            .cmp_position(self.stream.header())
            .then(other.seq.cmp(&self.seq))
    }
}

/// Min-heap of block streams yielding their union in
/// `(tsid, min_timestamp)` order.
pub struct BlockStreamHeap<S> {
    heap: BinaryHeap<HeapItem<S>>,
    current: Option<HeapItem<S>>,
}

impl<S: BlockStream> BlockStreamHeap<S> {
    /// Prime every stream and keep the non-empty ones.
    pub fn new(streams: Vec<S>) -> Result<Self, PartError> {
        let mut heap = BinaryHeap::with_capacity(streams.len());
        for (seq, mut stream) in streams.into_iter().enumerate() {
            if stream.advance()? {
                heap.push(HeapItem { seq, stream });
            }
        }
        Ok(Self { heap, current: None })
    }

    /// Stream holding the current block.
    pub fn current(&self) -> Option<&S> {
        self.current.as_ref().map(|item| &item.stream)
    }

    pub fn current_mut(&mut self) -> Option<&mut S> {
        self.current.as_mut().map(|item| &mut item.stream)
    }
}

impl<S: BlockStream> BlockStream for BlockStreamHeap<S> {
    fn header(&self) -> &BlockHeader {
        match &self.current {
            Some(item) => item.stream.header(),
            None => panic!("BUG: block stream heap has no current block"),
        }
    }

    fn advance(&mut self) -> Result<bool, PartError> {
        if let Some(mut item) = self.current.take() {
            if item.stream.advance()? {
                self.heap.push(item);
            }
        }
        self.current = self.heap.pop();
        Ok(self.current.is_some())
    }
}

// ------------------------------------------------------------------------------------------------
// Merge
// ------------------------------------------------------------------------------------------------

fn check_stop(stop: Option<&Receiver<()>>) -> Result<(), MergeError> {
    match stop.map(Receiver::try_recv) {
        None | Some(Err(TryRecvError::Empty)) => Ok(()),
        // A message or a dropped sender both mean stop.
        Some(_) => Err(MergeError::ForciblyStopped),
    }
}

/// Merge the blocks of `readers` into `bsw`, accumulating the output header
/// into `ph`.
///
/// Samples older than `retention_deadline` and series in
/// `deleted_metric_ids` are dropped.
pub fn merge_block_streams(
    ph: &mut PartHeader,
    bsw: &mut BlockStreamWriter,
    readers: Vec<BlockStreamReader>,
    stop: Option<&Receiver<()>>,
    deleted_metric_ids: &HashSet<u64>,
    retention_deadline: i64,
    stats: &mut MergeStats,
) -> Result<(), MergeError> {
    let mut bsm = BlockStreamHeap::new(readers)?;
    let mut pending: Option<Block> = None;

    while bsm.advance()? {
        check_stop(stop)?;
        let Some(reader) = bsm.current_mut() else {
            break;
        };
        let bh = *reader.block().header();
        if deleted_metric_ids.contains(&bh.tsid.metric_id) || bh.max_timestamp < retention_deadline {
            stats.rows_deleted += u64::from(bh.rows_count);
            continue;
        }
        let mut b = reader.take_block();

        let Some(mut pb) = pending.take() else {
            pending = Some(b);
            continue;
        };
        if pb.tsid() != b.tsid() {
            assert!(
                b.tsid() > pb.tsid(),
                "BUG: the next TSID {} is smaller than the current TSID {}",
                b.tsid(),
                pb.tsid()
            );
            bsw.write_external_block(&mut pb, ph, stats)?;
            pending = Some(b);
            continue;
        }
        if pb.too_big() && pb.header().max_timestamp <= b.header().min_timestamp {
            bsw.write_external_block(&mut pb, ph, stats)?;
            pending = Some(b);
            continue;
        }

        unmarshal_and_calibrate_scale(&mut pb, &mut b)?;
        let mut merged = merge_blocks(&mut pb, &mut b, retention_deadline, stats);
        if merged.rows_count() <= MAX_ROWS_PER_BLOCK {
            if merged.rows_count() > 0 {
                pending = Some(merged);
            }
            continue;
        }

        // Write the first MAX_ROWS_PER_BLOCK rows, keep the rest pending.
        let rest = Block::new(
            merged.tsid(),
            merged.timestamps.split_off(MAX_ROWS_PER_BLOCK),
            merged.values.split_off(MAX_ROWS_PER_BLOCK),
            merged.header().scale,
            merged.header().precision_bits,
        );
        merged.fixup_timestamps();
        bsw.write_external_block(&mut merged, ph, stats)?;
        pending = Some(rest);
    }

    if let Some(mut pb) = pending {
        bsw.write_external_block(&mut pb, ph, stats)?;
    }
    Ok(())
}

fn unmarshal_and_calibrate_scale(b1: &mut Block, b2: &mut Block) -> Result<(), PartError> {
    b1.unmarshal_data()?;
    b2.unmarshal_data()?;
    let scale = decimal::calibrate_scale(
        &mut b1.values[b1.next_idx..],
        b1.header.scale,
        &mut b2.values[b2.next_idx..],
        b2.header.scale,
    );
    b1.header.scale = scale;
    b2.header.scale = scale;
    Ok(())
}

fn skip_samples_outside_retention(b: &mut Block, retention_deadline: i64, stats: &mut MergeStats) {
    let skipped = b.timestamps().partition_point(|&ts| ts < retention_deadline);
    if skipped > 0 {
        b.next_idx += skipped;
        stats.rows_deleted += skipped as u64;
    }
}

/// Merge the unconsumed rows of two raw blocks of one series by timestamp.
/// On equal timestamps the row of `ib1` comes first.
fn merge_blocks(ib1: &mut Block, ib2: &mut Block, retention_deadline: i64, stats: &mut MergeStats) -> Block {
    ib1.assert_mergeable(ib2);
    skip_samples_outside_retention(ib1, retention_deadline, stats);
    skip_samples_outside_retention(ib2, retention_deadline, stats);

    let (ts1, vs1) = (ib1.timestamps(), ib1.values());
    let (ts2, vs2) = (ib2.timestamps(), ib2.values());
    let mut timestamps = Vec::with_capacity(ts1.len() + ts2.len());
    let mut values = Vec::with_capacity(ts1.len() + ts2.len());
    let (mut i, mut j) = (0, 0);
    while i < ts1.len() && j < ts2.len() {
        if ts2[j] < ts1[i] {
            timestamps.push(ts2[j]);
            values.push(vs2[j]);
            j += 1;
        } else {
            timestamps.push(ts1[i]);
            values.push(vs1[i]);
            i += 1;
        }
    }
    timestamps.extend_from_slice(&ts1[i..]);
    values.extend_from_slice(&vs1[i..]);
    timestamps.extend_from_slice(&ts2[j..]);
    values.extend_from_slice(&vs2[j..]);

    let precision_bits = ib1.header().precision_bits.min(ib2.header().precision_bits);
    let mut ob = Block::default();
    if timestamps.is_empty() {
        return ob;
    }
    ob.init(ib1.tsid(), timestamps, values, ib1.header().scale, precision_bits);
    ob
}
