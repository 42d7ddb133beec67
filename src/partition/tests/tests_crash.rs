//! Crash recovery of merges.
//!
//! A merge writes its output into `tmp/`, records a transaction in `txn/`,
//! then applies it. These tests rebuild the on-disk state a crash leaves at
//! each step and check what a reopened partition sees:
//!
//! 1. **Output in `tmp/`, no transaction**: the merge never committed; the
//!    sources stay and `tmp/` is cleared.
//! 2. **Transaction recorded, not applied**: replay completes the merge.
//! 3. **Transaction partially applied**: replay finishes the rest.
//! 4. **Half-written transaction file**: discarded.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use std::collections::HashSet;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::block::RawRow;
    use crate::block::dedup::DedupPolicy;
    use crate::merge::{MergeStats, merge_block_streams};
    use crate::part::cache::IndexBlockCache;
    use crate::part::stream::{BlockStreamReader, BlockStreamWriter};
    use crate::part::{Part, PartHeader, next_part_suffix};
    use crate::partition::PartitionError;
    use crate::partition::tests::helpers::*;
    use crate::partition::txn::{TMP_DIRNAME, TXN_DIRNAME, Transaction, scratch_name, write_transaction};

    /// Create a closed partition with three small parts and return its
    /// rows.
    fn three_small_parts(root: &Path) -> (PathBuf, Vec<RawRow>) {
        let pt = create_partition(root, manual_settings());
        let mut input = Vec::new();
        for i in 0..3 {
            let batch = rows(2, 40, BASE_TS + i * 100_000);
            pt.add_rows(&batch).unwrap();
            pt.flush_raw_rows(true).unwrap();
            pt.flush_inmemory_parts(true, None).unwrap();
            input.extend(batch);
        }
        let small = pt.small_path().to_path_buf();
        pt.close().unwrap();
        assert_eq!(part_dirs(&small).len(), 3);
        (small, input)
    }

    /// Merge the parts in `dir` into `dir/tmp/<suffix>` the way a merge
    /// worker does. Returns the transaction that would commit it.
    fn merge_into_tmp(dir: &Path) -> (u64, Transaction) {
        let cache = Arc::new(IndexBlockCache::new(0));
        let sources: Vec<PathBuf> = part_dirs(dir).into_iter().map(|n| dir.join(n)).collect();
        let readers = sources
            .iter()
            .map(|p| BlockStreamReader::new(Arc::new(Part::open(p, Arc::clone(&cache), false).unwrap())))
            .collect();

        let suffix = next_part_suffix();
        let tmp = dir.join(TMP_DIRNAME).join(scratch_name(suffix));
        let mut bsw = BlockStreamWriter::create(&tmp, 1, DedupPolicy::default(), 0).unwrap();
        let mut ph = PartHeader::default();
        let mut stats = MergeStats::default();
        merge_block_streams(&mut ph, &mut bsw, readers, None, &HashSet::new(), i64::MIN, &mut stats).unwrap();
        bsw.finish().unwrap();

        let txn = Transaction {
            remove: sources,
            src: tmp,
            dst: Some(dir.join(ph.dir_name(suffix))),
        };
        (suffix, txn)
    }

    /// # Scenario
    /// Crash after the merge output was written but before the transaction
    /// was recorded.
    ///
    /// # Expected behavior
    /// The three source parts are still live; `tmp/` is empty.
    #[test]
    fn crash__output_without_transaction_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let (small, input) = three_small_parts(tmp.path());
        let (_, txn) = merge_into_tmp(&small);
        assert!(txn.src.exists());

        let pt = open_partition(tmp.path(), manual_settings());
        assert_eq!(metrics(&pt).small_parts, 3);
        assert_eq!(read_rows(&pt), expected(&input));
        assert!(fs::read_dir(small.join(TMP_DIRNAME)).unwrap().next().is_none());
        pt.close().unwrap();
    }

    /// # Scenario
    /// Crash right after the transaction was recorded.
    ///
    /// # Expected behavior
    /// Reopening applies it: one merged part, no `txn/` leftovers.
    #[test]
    fn crash__recorded_transaction_is_replayed() {
        let tmp = TempDir::new().unwrap();
        let (small, input) = three_small_parts(tmp.path());
        let (suffix, txn) = merge_into_tmp(&small);
        write_transaction(&small.join(TXN_DIRNAME), suffix, &txn).unwrap();

        let pt = open_partition(tmp.path(), manual_settings());
        assert_eq!(metrics(&pt).small_parts, 1);
        assert_eq!(part_dirs(&small), vec![txn.dst.unwrap().file_name().unwrap().to_str().unwrap().to_string()]);
        assert_eq!(read_rows(&pt), expected(&input));
        assert!(fs::read_dir(small.join(TXN_DIRNAME)).unwrap().next().is_none());
        pt.close().unwrap();
    }

    /// # Scenario
    /// Crash while applying a transaction: some sources are already gone
    /// and the output is not yet moved.
    ///
    /// # Expected behavior
    /// Replay removes the remaining sources and moves the output.
    #[test]
    fn crash__partially_applied_transaction_is_finished() {
        let tmp = TempDir::new().unwrap();
        let (small, input) = three_small_parts(tmp.path());
        let (suffix, txn) = merge_into_tmp(&small);
        write_transaction(&small.join(TXN_DIRNAME), suffix, &txn).unwrap();
        fs::remove_dir_all(&txn.remove[0]).unwrap();

        let pt = open_partition(tmp.path(), manual_settings());
        assert_eq!(metrics(&pt).small_parts, 1);
        assert_eq!(read_rows(&pt), expected(&input));
        pt.close().unwrap();
    }

    #[test]
    fn crash__applied_transaction_left_behind_is_harmless() {
        let tmp = TempDir::new().unwrap();
        let (small, input) = three_small_parts(tmp.path());
        let (suffix, txn) = merge_into_tmp(&small);
        for p in &txn.remove {
            fs::remove_dir_all(p).unwrap();
        }
        fs::rename(&txn.src, txn.dst.as_ref().unwrap()).unwrap();
        write_transaction(&small.join(TXN_DIRNAME), suffix, &txn).unwrap();

        let pt = open_partition(tmp.path(), manual_settings());
        assert_eq!(metrics(&pt).small_parts, 1);
        assert_eq!(read_rows(&pt), expected(&input));
        pt.close().unwrap();
    }

    #[test]
    fn crash__half_written_transaction_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let (small, input) = three_small_parts(tmp.path());
        let (suffix, txn) = merge_into_tmp(&small);
        let half = small.join(TXN_DIRNAME).join(format!("{}.tmp", scratch_name(suffix)));
        fs::write(&half, &txn.encode().unwrap()[..20]).unwrap();

        let pt = open_partition(tmp.path(), manual_settings());
        assert_eq!(metrics(&pt).small_parts, 3);
        assert_eq!(read_rows(&pt), expected(&input));
        assert!(!half.exists());
        pt.close().unwrap();
    }

    #[test]
    fn crash__transaction_escaping_the_partition_fails_open() {
        let tmp = TempDir::new().unwrap();
        let (small, _) = three_small_parts(tmp.path());
        let victim = tmp.path().join("victim");
        fs::create_dir_all(&victim).unwrap();
        let txn = Transaction {
            remove: vec![victim.clone()],
            src: small.join(TMP_DIRNAME).join("x"),
            dst: None,
        };
        write_transaction(&small.join(TXN_DIRNAME), 1, &txn).unwrap();

        let (s, b) = roots(tmp.path());
        let err = crate::partition::Partition::open(&s, &b, "2024_05", Arc::new(manual_settings())).unwrap_err();
        assert!(matches!(err, PartitionError::Transaction(_)), "{err}");
        assert!(victim.exists());
    }
}
