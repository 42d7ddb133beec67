//! Searching a table.
//!
//! A [`TableSearch`] is a heap of [`PartitionSearch`]es, each itself a heap
//! of [`PartSearch`]es, so blocks come out in global `(tsid, min_timestamp)`
//! order without materializing results. The search holds the partitions and
//! parts it started with; concurrent merges and retention do not affect it.

use std::sync::Arc;

use super::{PartitionWrapper, Table, TableError};
use crate::block::{BlockHeader, TimeRange, Tsid};
use crate::merge::{BlockStream, BlockStreamHeap};
use crate::part::search::{BlockRef, PartSearch};
use crate::part::{Part, PartError};

/// Blocks of one partition.
pub struct PartitionSearch {
    heap: BlockStreamHeap<PartSearch>,
}

impl PartitionSearch {
    pub fn new(parts: Vec<Arc<Part>>, tsids: &Arc<[Tsid]>, tr: TimeRange) -> Result<Self, PartError> {
        let searches = parts
            .into_iter()
            .filter(|p| tr.overlaps(p.header().min_timestamp, p.header().max_timestamp))
            .map(|p| PartSearch::new(p, Arc::clone(tsids), tr))
            .collect();
        Ok(Self {
            heap: BlockStreamHeap::new(searches)?,
        })
    }

    pub fn block_ref(&self) -> Option<BlockRef> {
        self.heap.current().map(PartSearch::block_ref)
    }
}

impl BlockStream for PartitionSearch {
    fn header(&self) -> &BlockHeader {
        self.heap.header()
    }

    fn advance(&mut self) -> Result<bool, PartError> {
        self.heap.advance()
    }
}

/// Blocks of the whole table.
pub struct TableSearch {
    heap: BlockStreamHeap<PartitionSearch>,
    /// Keeps the searched partitions alive.
    _partitions: Vec<Arc<PartitionWrapper>>,
}

impl TableSearch {
    /// Search `tsids` within `tr`. The TSIDs may come in any order;
    /// duplicates and deleted series are ignored.
    pub fn new(table: &Table, tsids: &[Tsid], tr: TimeRange) -> Result<Self, TableError> {
        let deleted = table.settings().deleted_metric_ids.snapshot();
        let mut tsids: Vec<Tsid> = tsids
            .iter()
            .copied()
            .filter(|t| !deleted.contains(&t.metric_id))
            .collect();
        tsids.sort_unstable();
        tsids.dedup();
        let tsids: Arc<[Tsid]> = tsids.into();

        let partitions: Vec<Arc<PartitionWrapper>> = if tsids.is_empty() {
            Vec::new()
        } else {
            table
                .partitions()?
                .into_iter()
                .filter(|ptw| {
                    let ptr = ptw.partition().time_range();
                    tr.overlaps(ptr.min_timestamp, ptr.max_timestamp)
                })
                .collect()
        };
        let mut searches = Vec::with_capacity(partitions.len());
        for ptw in &partitions {
            searches.push(PartitionSearch::new(ptw.partition().parts()?, &tsids, tr)?);
        }
        Ok(Self {
            heap: BlockStreamHeap::new(searches)?,
            _partitions: partitions,
        })
    }

    /// The next matching block, or `None` once exhausted.
    pub fn next_block(&mut self) -> Result<Option<BlockRef>, TableError> {
        if !self.heap.advance()? {
            return Ok(None);
        }
        Ok(self.heap.current().and_then(PartitionSearch::block_ref))
    }
}
