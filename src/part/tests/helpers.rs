use std::path::Path;
use std::sync::Arc;

use crate::block::dedup::DedupPolicy;
use crate::block::{Block, RawRow, Tsid};
use crate::part::cache::IndexBlockCache;
use crate::part::stream::{BlockStreamReader, BlockStreamWriter, MergeStats};
use crate::part::{InmemoryPart, Part, PartHeader, next_part_suffix};

pub fn cache() -> Arc<IndexBlockCache> {
    Arc::new(IndexBlockCache::new(1 << 20))
}

pub fn raw_row(metric_id: u64, timestamp: i64, value: f64) -> RawRow {
    RawRow {
        tsid: Tsid::from_metric_id(metric_id),
        timestamp,
        value,
        precision_bits: 64,
    }
}

/// Irregular but increasing timestamps, so the column is neither const nor
/// delta-const.
pub fn irregular_timestamps(n: usize) -> Vec<i64> {
    (0..n as i64).map(|i| i * 10 + (i * i) % 7).collect()
}

pub fn inmemory_part(rows: &mut [RawRow]) -> Arc<Part> {
    let mp = InmemoryPart::from_raw_rows(rows, &DedupPolicy::default(), 0).unwrap();
    Arc::new(Part::from_inmemory(mp, cache()).unwrap())
}

/// Write `blocks` into a part directory under `root` and return its path.
pub fn write_file_part(root: &Path, blocks: Vec<Block>) -> std::path::PathBuf {
    let tmp = root.join(format!("tmp_{:016X}", next_part_suffix()));
    let mut bsw = BlockStreamWriter::create(&tmp, 1, DedupPolicy::default(), 0).unwrap();
    let mut ph = PartHeader::default();
    let mut stats = MergeStats::default();
    for mut b in blocks {
        bsw.write_external_block(&mut b, &mut ph, &mut stats).unwrap();
    }
    bsw.finish().unwrap();
    let dst = root.join(ph.dir_name(next_part_suffix()));
    std::fs::rename(&tmp, &dst).unwrap();
    dst
}

/// Decode every block of `part` in storage order.
pub fn read_all(part: Arc<Part>) -> Vec<(Tsid, Vec<i64>, Vec<i64>)> {
    let mut bsr = BlockStreamReader::new(part);
    let mut out = Vec::new();
    while bsr.next_block().unwrap() {
        let mut b = bsr.take_block();
        b.unmarshal_data().unwrap();
        out.push((b.tsid(), b.timestamps().to_vec(), b.values().to_vec()));
    }
    out
}
