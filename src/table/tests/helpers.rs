use std::path::Path;
use std::sync::Arc;

use crate::block::{TimeRange, Tsid};
use crate::partition::EngineSettings;
use crate::partition::tests::helpers::manual_settings;
use crate::table::Table;
use crate::table::search::TableSearch;

pub use crate::partition::tests::helpers::{BASE_TS, init_tracing, row, rows, wait_until};

pub fn open_table(path: &Path) -> Arc<Table> {
    Table::open(path, Arc::new(manual_settings())).unwrap()
}

pub fn open_table_with(path: &Path, settings: EngineSettings) -> Arc<Table> {
    Table::open(path, Arc::new(settings)).unwrap()
}

pub fn tsids(ids: &[u64]) -> Vec<Tsid> {
    ids.iter().map(|&id| Tsid::from_metric_id(id)).collect()
}

/// Run a search and return `(metric_id, timestamp, value)` of every
/// matching row in yield order, plus the `(metric_id, min_timestamp)` of
/// every block.
pub fn search(table: &Table, ids: &[u64], tr: TimeRange) -> (Vec<(u64, i64, f64)>, Vec<(u64, i64)>) {
    let mut ts = TableSearch::new(table, &tsids(ids), tr).unwrap();
    let mut rows = Vec::new();
    let mut blocks = Vec::new();
    while let Some(br) = ts.next_block().unwrap() {
        blocks.push((br.header.tsid.metric_id, br.header.min_timestamp));
        let b = br.read_block().unwrap();
        let mut timestamps = Vec::new();
        let mut values = Vec::new();
        b.append_rows_with_time_range_filter(&mut timestamps, &mut values, tr);
        rows.extend(timestamps.into_iter().zip(values).map(|(t, v)| (b.tsid().metric_id, t, v)));
    }
    (rows, blocks)
}

pub fn month_dirs(root: &Path, kind: &str) -> Vec<String> {
    let mut names = crate::fsutil::read_dir_names(&root.join("data").join(kind)).unwrap();
    names.retain(|n| n != "snapshots");
    names
}
