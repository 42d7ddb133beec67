//! Lookup of blocks by TSID set and time range within one part.

use std::sync::Arc;

use super::{Part, PartError};
use crate::block::{Block, BlockHeader, TimeRange, Tsid};

/// A block located by a search, not yet read.
#[derive(Debug, Clone)]
pub struct BlockRef {
    pub part: Arc<Part>,
    pub header: BlockHeader,
}

impl BlockRef {
    /// Read and decode the referenced block.
    pub fn read_block(&self) -> Result<Block, PartError> {
        let mut b = self.part.read_block(&self.header)?;
        b.unmarshal_data()?;
        Ok(b)
    }
}

/// Iterates the blocks of one part whose series is in a sorted TSID list
/// and whose time range intersects the requested one.
///
/// The TSID cursor and the block cursor advance together like a merge of
/// two sorted lists. Blocks of the matched series are scanned linearly since
/// same-series blocks may overlap in time.
pub struct PartSearch {
    part: Arc<Part>,
    tsids: Arc<[Tsid]>,
    tsid_idx: usize,
    tr: TimeRange,

    metaindex_idx: usize,
    bhs: Arc<Vec<BlockHeader>>,
    bh_idx: usize,

    current: Option<BlockHeader>,
    exhausted: bool,
}

impl PartSearch {
    /// # Panics
    ///
    /// If `tsids` is not sorted.
    pub fn new(part: Arc<Part>, tsids: Arc<[Tsid]>, tr: TimeRange) -> Self {
        assert!(
            tsids.windows(2).all(|w| w[0] <= w[1]),
            "BUG: tsids must be sorted"
        );
        let ph = *part.header();
        let exhausted = tsids.is_empty() || !tr.overlaps(ph.min_timestamp, ph.max_timestamp);
        Self {
            part,
            tsids,
            tsid_idx: 0,
            tr,
            metaindex_idx: 0,
            bhs: Arc::new(Vec::new()),
            bh_idx: 0,
            current: None,
            exhausted,
        }
    }

    pub fn part(&self) -> &Arc<Part> {
        &self.part
    }

    /// Header of the block found by the last successful [`Self::next_block`].
    ///
    /// # Panics
    ///
    /// If no block has been found yet.
    pub fn header(&self) -> &BlockHeader {
        self.current
            .as_ref()
            .unwrap_or_else(|| panic!("BUG: part search has no current block"))
    }

    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            part: Arc::clone(&self.part),
            header: *self.header(),
        }
    }

    /// Advance to the next matching block.
    pub fn next_block(&mut self) -> Result<bool, PartError> {
        while !self.exhausted {
            if self.bh_idx >= self.bhs.len() && !self.next_index_block()? {
                self.exhausted = true;
                break;
            }
            if self.search_index_block() {
                return Ok(true);
            }
        }
        self.current = None;
        Ok(false)
    }

    /// Load the next index block that may hold the current TSID and
    /// intersects the time range.
    fn next_index_block(&mut self) -> Result<bool, PartError> {
        let metaindex = self.part.metaindex();
        while self.metaindex_idx < metaindex.len() {
            let rest = &metaindex[self.metaindex_idx..];
            // Skip TSIDs that sort before every remaining index block.
            while self.tsids[self.tsid_idx] < rest[0].tsid {
                self.tsid_idx += 1;
                if self.tsid_idx >= self.tsids.len() {
                    return Ok(false);
                }
            }
            // The previous block of the first one starting at or after the
            // TSID may still hold it at its tail.
            let tsid = self.tsids[self.tsid_idx];
            let n = rest.partition_point(|mr| mr.tsid < tsid);
            self.metaindex_idx += n.saturating_sub(1);

            let mr = metaindex[self.metaindex_idx];
            self.metaindex_idx += 1;
            if !self.tr.overlaps(mr.min_timestamp, mr.max_timestamp) {
                continue;
            }
            self.bhs = self.part.read_index_block(&mr)?;
            self.bh_idx = 0;
            return Ok(true);
        }
        Ok(false)
    }

    /// Scan the loaded index block for the next match.
    fn search_index_block(&mut self) -> bool {
        while self.bh_idx < self.bhs.len() {
            let bh = self.bhs[self.bh_idx];
            loop {
                let tsid = self.tsids[self.tsid_idx];
                if bh.tsid <= tsid {
                    break;
                }
                self.tsid_idx += 1;
                if self.tsid_idx >= self.tsids.len() {
                    self.exhausted = true;
                    return false;
                }
            }
            self.bh_idx += 1;
            if bh.tsid != self.tsids[self.tsid_idx] {
                continue;
            }
            if bh.max_timestamp < self.tr.min_timestamp || bh.min_timestamp > self.tr.max_timestamp {
                continue;
            }
            self.current = Some(bh);
            return true;
        }
        false
    }
}
