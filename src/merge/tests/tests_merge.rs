//! Merging parts: row accounting, ordering, re-blocking, dedup, deleted
//! series, retention and cancellation.

use std::collections::HashSet;
use std::sync::Arc;

use crossbeam::channel;

use crate::block::dedup::DedupPolicy;
use crate::block::{MAX_ROWS_PER_BLOCK, RawRow, Tsid};
use crate::merge::*;
use crate::part::cache::IndexBlockCache;
use crate::part::stream::{BlockStreamReader, BlockStreamWriter};
use crate::part::{InmemoryPart, Part, PartHeader};

fn row(metric_id: u64, timestamp: i64, value: f64) -> RawRow {
    RawRow {
        tsid: Tsid::from_metric_id(metric_id),
        timestamp,
        value,
        precision_bits: 64,
    }
}

fn part(mut rows: Vec<RawRow>) -> Arc<Part> {
    let mp = InmemoryPart::from_raw_rows(&mut rows, &DedupPolicy::default(), 0).unwrap();
    Arc::new(Part::from_inmemory(mp, Arc::new(IndexBlockCache::new(0))).unwrap())
}

struct Merged {
    part: Option<Arc<Part>>,
    header: PartHeader,
    stats: MergeStats,
}

fn merge_with(
    parts: &[Arc<Part>],
    policy: DedupPolicy,
    deleted: &HashSet<u64>,
    retention_deadline: i64,
    stop: Option<&channel::Receiver<()>>,
) -> Result<Merged, MergeError> {
    let mut bsw = BlockStreamWriter::in_memory(1, policy, 0);
    let readers = parts.iter().map(|p| BlockStreamReader::new(Arc::clone(p))).collect();
    let mut ph = PartHeader::default();
    let mut stats = MergeStats::default();
    merge_block_streams(&mut ph, &mut bsw, readers, stop, deleted, retention_deadline, &mut stats)?;
    let mut mp = bsw.finish_in_memory()?;
    mp.header = ph;
    let part = if ph.rows_count > 0 {
        Some(Arc::new(
            Part::from_inmemory(mp, Arc::new(IndexBlockCache::new(0))).unwrap(),
        ))
    } else {
        None
    };
    Ok(Merged {
        part,
        header: ph,
        stats,
    })
}

fn merge(parts: &[Arc<Part>]) -> Merged {
    merge_with(parts, DedupPolicy::default(), &HashSet::new(), i64::MIN, None).unwrap()
}

/// All rows of `part` as `(metric_id, timestamp, value)` plus the row
/// count of every block.
fn rows_of(part: &Arc<Part>) -> (Vec<(u64, i64, f64)>, Vec<usize>) {
    let mut bsr = BlockStreamReader::new(Arc::clone(part));
    let mut rows = Vec::new();
    let mut blocks = Vec::new();
    while bsr.next_block().unwrap() {
        let mut b = bsr.take_block();
        b.unmarshal_data().unwrap();
        let mut timestamps = Vec::new();
        let mut values = Vec::new();
        b.append_rows_with_time_range_filter(&mut timestamps, &mut values, crate::block::TimeRange::all());
        blocks.push(timestamps.len());
        for (ts, v) in timestamps.into_iter().zip(values) {
            rows.push((b.tsid().metric_id, ts, v));
        }
    }
    (rows, blocks)
}

#[test]
fn merge_keeps_every_row_in_global_order() {
    let a = part((0..100i64).map(|i| row(i as u64 % 3, i, i as f64)).collect());
    let b = part((100..250i64).map(|i| row(i as u64 % 5, i, i as f64)).collect());
    let c = part((0..50).map(|i| row(9, i * 7, 0.5)).collect());
    let merged = merge(&[a, b, c]);

    assert_eq!(merged.header.rows_count, 300);
    assert_eq!(merged.stats.rows_merged, 300);
    assert_eq!(merged.stats.rows_deleted, 0);

    let (rows, _) = rows_of(&merged.part.unwrap());
    assert_eq!(rows.len(), 300);
    assert!(rows.windows(2).all(|w| (w[0].0, w[0].1) <= (w[1].0, w[1].1)));
    let series2: Vec<i64> = rows.iter().filter(|r| r.0 == 2).map(|r| r.1).collect();
    let mut expected: Vec<i64> = (0..100).filter(|i| i % 3 == 2).collect();
    expected.extend((100..250).filter(|i| i % 5 == 2));
    assert_eq!(series2, expected);
}

#[test]
fn overlapping_blocks_are_interleaved_and_reblocked() {
    let even = part((0..5000).map(|i| row(1, i * 2, 1.0)).collect());
    let odd = part((0..5000).map(|i| row(1, i * 2 + 1, 2.5)).collect());
    let merged = merge(&[even, odd]);

    let (rows, blocks) = rows_of(&merged.part.unwrap());
    assert_eq!(blocks, vec![MAX_ROWS_PER_BLOCK, 10_000 - MAX_ROWS_PER_BLOCK]);
    let timestamps: Vec<i64> = rows.iter().map(|r| r.1).collect();
    assert_eq!(timestamps, (0..10_000).collect::<Vec<i64>>());
    // The scales differ (1.0 vs 2.5) and must be calibrated.
    assert_eq!(rows[0].2, 1.0);
    assert_eq!(rows[1].2, 2.5);
}

#[test]
fn full_pending_block_is_copied_without_merging() {
    let full = part((0..MAX_ROWS_PER_BLOCK as i64).map(|i| row(1, i, 1.0)).collect());
    let tail = part((0..10).map(|i| row(1, 10_000 + i, 1.0)).collect());
    let merged = merge(&[full, tail]);
    let (_, blocks) = rows_of(&merged.part.unwrap());
    assert_eq!(blocks, vec![MAX_ROWS_PER_BLOCK, 10]);
}

#[test]
fn equal_timestamps_keep_the_earlier_part_first() {
    let a = part(vec![row(1, 10, 1.0)]);
    let b = part(vec![row(1, 10, 2.0)]);
    let merged = merge(&[Arc::clone(&a), Arc::clone(&b)]);
    let (rows, _) = rows_of(&merged.part.unwrap());
    assert_eq!(rows, vec![(1, 10, 1.0), (1, 10, 2.0)]);

    let deduped = merge_with(&[a, b], DedupPolicy::new(1000, Vec::new()), &HashSet::new(), i64::MIN, None).unwrap();
    let (rows, _) = rows_of(&deduped.part.unwrap());
    assert_eq!(rows, vec![(1, 10, 1.0)]);
    assert_eq!(deduped.stats.rows_deduped, 1);
}

#[test]
fn row_accounting_with_dedup() {
    let a = part((0..1000).map(|i| row(7, i, i as f64)).collect());
    let b = part((0..1000).map(|i| row(7, i * 3, i as f64)).collect());
    let merged = merge_with(&[a, b], DedupPolicy::new(100, Vec::new()), &HashSet::new(), i64::MIN, None).unwrap();

    let total = 2000;
    assert_eq!(
        merged.header.rows_count,
        total - merged.stats.rows_deduped - merged.stats.rows_deleted
    );
    // One sample per 100ms window over [0, 2997].
    assert_eq!(merged.header.rows_count, 30);
    let (rows, _) = rows_of(&merged.part.unwrap());
    let timestamps: Vec<i64> = rows.iter().map(|r| r.1).collect();
    assert!(timestamps.windows(2).all(|w| w[1] / 100 > w[0] / 100));
}

#[test]
fn deleted_series_are_dropped() {
    let a = part((0..100i64).map(|i| row(i as u64 % 4, i, 1.0)).collect());
    let deleted: HashSet<u64> = [1, 3].into_iter().collect();
    let merged = merge_with(&[a], DedupPolicy::default(), &deleted, i64::MIN, None).unwrap();

    assert_eq!(merged.stats.rows_deleted, 50);
    assert_eq!(merged.header.rows_count, 50);
    let (rows, _) = rows_of(&merged.part.unwrap());
    assert!(rows.iter().all(|r| r.0 == 0 || r.0 == 2));
}

#[test]
fn samples_older_than_the_deadline_are_dropped() {
    // Series 1 is entirely old; series 2 straddles the deadline in two
    // overlapping parts, so it takes the sample-level path.
    let a = part(
        (0..100)
            .map(|i| row(1, i, 1.0))
            .chain((0..100).map(|i| row(2, i * 2, 1.0)))
            .collect(),
    );
    let b = part((0..100).map(|i| row(2, i * 2 + 1, 1.0)).collect());
    let merged = merge_with(&[a, b], DedupPolicy::default(), &HashSet::new(), 100, None).unwrap();

    let (rows, _) = rows_of(&merged.part.unwrap());
    assert!(rows.iter().all(|r| r.0 == 2 && r.1 >= 100));
    assert_eq!(rows.len(), 100);
    assert_eq!(merged.stats.rows_deleted, 200);
}

#[test]
fn merging_only_deleted_rows_yields_an_empty_part() {
    let a = part((0..10).map(|i| row(5, i, 1.0)).collect());
    let deleted: HashSet<u64> = [5].into_iter().collect();
    let merged = merge_with(&[a], DedupPolicy::default(), &deleted, i64::MIN, None).unwrap();
    assert_eq!(merged.header.rows_count, 0);
    assert!(merged.part.is_none());
}

#[test]
fn stop_signal_aborts_the_merge() {
    let a = part((0..10).map(|i| row(1, i, 1.0)).collect());

    let (tx, rx) = channel::bounded::<()>(1);
    tx.send(()).unwrap();
    let res = merge_with(&[Arc::clone(&a)], DedupPolicy::default(), &HashSet::new(), i64::MIN, Some(&rx));
    assert!(matches!(res, Err(MergeError::ForciblyStopped)));

    let (tx, rx) = channel::bounded::<()>(1);
    drop(tx);
    let res = merge_with(&[a], DedupPolicy::default(), &HashSet::new(), i64::MIN, Some(&rx));
    assert!(matches!(res, Err(MergeError::ForciblyStopped)));
}

#[test]
fn heap_yields_blocks_in_tsid_then_time_order() {
    let a = part((0..3u64).flat_map(|m| (0..10i64).map(move |i| row(m, 100 + i, 1.0))).collect());
    let b = part((0..3u64).flat_map(|m| (0..10i64).map(move |i| row(m, i, 1.0))).collect());
    let readers = vec![BlockStreamReader::new(a), BlockStreamReader::new(b)];
    let mut heap = BlockStreamHeap::new(readers).unwrap();
    let mut order = Vec::new();
    while heap.advance().unwrap() {
        let bh = heap.header();
        order.push((bh.tsid.metric_id, bh.min_timestamp));
    }
    assert_eq!(order, vec![(0, 0), (0, 100), (1, 0), (1, 100), (2, 0), (2, 100)]);
}

#[test]
fn deleted_metric_ids_are_copy_on_write() {
    let ids = DeletedMetricIds::default();
    let before = ids.snapshot();
    let after = ids.add(&[1, 2]);
    assert!(before.is_empty());
    assert!(after.contains(&1) && after.contains(&2));
    assert_eq!(ids.snapshot().len(), 2);
}
