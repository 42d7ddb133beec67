//! Part search: TSID and time-range filtering, series spanning index
//! blocks, and reading located blocks.

use std::sync::Arc;

use super::helpers::*;
use crate::block::dedup::DedupPolicy;
use crate::block::{Block, TimeRange, Tsid};
use crate::part::search::PartSearch;
use crate::part::stream::{BlockStreamWriter, MergeStats};
use crate::part::*;

fn tsids(ids: &[u64]) -> Arc<[Tsid]> {
    ids.iter().map(|&m| Tsid::from_metric_id(m)).collect()
}

fn search(part: &Arc<Part>, ids: &[u64], tr: TimeRange) -> Vec<(u64, i64, i64)> {
    let mut ps = PartSearch::new(Arc::clone(part), tsids(ids), tr);
    let mut out = Vec::new();
    while ps.next_block().unwrap() {
        let bh = ps.header();
        out.push((bh.tsid.metric_id, bh.min_timestamp, bh.max_timestamp));
    }
    out
}

/// Ten series with ids 0, 10, .., 90; each has 100 rows at 0..99.
fn ten_series_part() -> Arc<Part> {
    let mut rows: Vec<_> = (0..10u64)
        .flat_map(|m| (0..100).map(move |ts| raw_row(m * 10, ts, ts as f64)))
        .collect();
    inmemory_part(&mut rows)
}

#[test]
fn finds_requested_series_only() {
    let part = ten_series_part();
    let found = search(&part, &[5, 10, 11, 50, 95], TimeRange::all());
    assert_eq!(found, vec![(10, 0, 99), (50, 0, 99)]);
}

#[test]
fn skips_blocks_outside_the_time_range() {
    let part = ten_series_part();
    assert!(search(&part, &[10], TimeRange::new(100, 200)).is_empty());
    assert!(search(&part, &[10], TimeRange::new(-10, -1)).is_empty());
    assert_eq!(search(&part, &[10], TimeRange::new(99, 99)), vec![(10, 0, 99)]);
}

#[test]
fn empty_tsid_list_finds_nothing() {
    let part = ten_series_part();
    assert!(search(&part, &[], TimeRange::all()).is_empty());
}

#[test]
#[should_panic(expected = "BUG: tsids must be sorted")]
fn unsorted_tsids_panic() {
    let part = ten_series_part();
    let _ = PartSearch::new(part, tsids(&[2, 1]), TimeRange::all());
}

#[test]
fn series_spanning_index_blocks_is_found_completely() {
    // One series with more block headers than fit into one index block,
    // surrounded by single-block neighbours.
    let mut bsw = BlockStreamWriter::in_memory(1, DedupPolicy::default(), 0);
    let mut ph = PartHeader::default();
    let mut stats = MergeStats::default();
    let mut write = |metric_id: u64, ts: i64| {
        let mut b = Block::new(Tsid::from_metric_id(metric_id), vec![ts], vec![ts], 0, 64);
        bsw.write_external_block(&mut b, &mut ph, &mut stats).unwrap();
    };
    for m in 0..500 {
        write(m, 0);
    }
    for ts in 0..900 {
        write(500, ts);
    }
    for m in 501..600 {
        write(m, 0);
    }
    let mut mp = bsw.finish_in_memory().unwrap();
    mp.header = ph;
    let part = Arc::new(Part::from_inmemory(mp, cache()).unwrap());
    assert!(part.metaindex().len() >= 2);

    let found = search(&part, &[499, 500, 501], TimeRange::all());
    assert_eq!(found.len(), 902);
    assert_eq!(found.iter().filter(|b| b.0 == 500).count(), 900);
    assert_eq!(found.first().unwrap().0, 499);
    assert_eq!(found.last().unwrap().0, 501);

    let found = search(&part, &[500], TimeRange::new(100, 199));
    assert_eq!(found.len(), 100);
}

#[test]
fn overlapping_blocks_of_one_series_are_scanned_linearly() {
    let mut bsw = BlockStreamWriter::in_memory(1, DedupPolicy::default(), 0);
    let mut ph = PartHeader::default();
    let mut stats = MergeStats::default();
    for (min, max) in [(0, 50), (10, 20), (40, 100), (60, 70)] {
        let mut b = Block::new(Tsid::from_metric_id(1), vec![min, max], vec![1, 2], 0, 64);
        bsw.write_external_block(&mut b, &mut ph, &mut stats).unwrap();
    }
    let mut mp = bsw.finish_in_memory().unwrap();
    mp.header = ph;
    let part = Arc::new(Part::from_inmemory(mp, cache()).unwrap());

    let found = search(&part, &[1], TimeRange::new(55, 65));
    assert_eq!(found, vec![(1, 40, 100), (1, 60, 70)]);
}

#[test]
fn block_ref_reads_decoded_rows() {
    let part = ten_series_part();
    let mut ps = PartSearch::new(Arc::clone(&part), tsids(&[30]), TimeRange::new(10, 19));
    assert!(ps.next_block().unwrap());
    let b = ps.block_ref().read_block().unwrap();
    let mut timestamps = Vec::new();
    let mut values = Vec::new();
    b.append_rows_with_time_range_filter(&mut timestamps, &mut values, TimeRange::new(10, 19));
    assert_eq!(timestamps, (10..20).collect::<Vec<i64>>());
    assert_eq!(values, (10..20).map(|v| v as f64).collect::<Vec<f64>>());
    assert!(!ps.next_block().unwrap());
}

#[test]
fn repeated_searches_hit_the_index_cache() {
    let part = ten_series_part();
    let before = part_cache_stats(&part);
    search(&part, &[10], TimeRange::all());
    search(&part, &[10], TimeRange::all());
    let after = part_cache_stats(&part);
    assert_eq!(after.misses - before.misses, 1);
    assert_eq!(after.hits - before.hits, 1);
}

fn part_cache_stats(part: &Part) -> crate::part::cache::CacheStats {
    part.cache.stats()
}
