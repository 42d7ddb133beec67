//! Background workers: periodic flushes, merges, final merges and clean
//! shutdown under concurrent ingestion.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::partition::EngineSettings;
    use crate::partition::tests::helpers::*;

    const WAIT: Duration = Duration::from_secs(10);

    /// # Scenario
    /// Rows reach disk without any explicit flush.
    ///
    /// # Starting environment
    /// 10ms raw-rows and in-memory flush intervals.
    ///
    /// # Expected behavior
    /// The rows end up in a small part while the partition stays open.
    #[test]
    fn workers__flushers_move_rows_to_disk() {
        let tmp = TempDir::new().unwrap();
        let pt = create_partition(
            tmp.path(),
            EngineSettings {
                raw_rows_flush_interval: Duration::from_millis(10),
                inmemory_parts_flush_interval: Duration::from_millis(10),
                ..manual_settings()
            },
        );
        let input = rows(2, 50, BASE_TS);
        pt.add_rows(&input).unwrap();

        assert!(wait_until(WAIT, || {
            let m = metrics(&pt);
            m.pending_rows == 0 && m.inmemory_parts == 0 && m.small_parts == 1
        }));
        assert_eq!(read_rows(&pt), expected(&input));
        pt.close().unwrap();
    }

    #[test]
    fn workers__small_merger_merges_parts() {
        let tmp = TempDir::new().unwrap();
        let pt = create_partition(
            tmp.path(),
            EngineSettings {
                small_merge_workers: 1,
                ..manual_settings()
            },
        );
        let mut input = Vec::new();
        for i in 0..10 {
            let batch = rows(1, 10, BASE_TS + i * 100_000);
            pt.add_rows(&batch).unwrap();
            pt.flush_raw_rows(true).unwrap();
            pt.flush_inmemory_parts(true, None).unwrap();
            input.extend(batch);
        }

        assert!(wait_until(WAIT, || metrics(&pt).small_merges >= 1));
        pt.close().unwrap();
        drop(pt);

        let pt = open_partition(tmp.path(), manual_settings());
        assert!(metrics(&pt).small_parts < 10);
        assert_eq!(read_rows(&pt), expected(&input));
        pt.close().unwrap();
    }

    /// # Scenario
    /// Three equal parts are below the normal merge threshold, but an idle
    /// partition switches to final merges.
    ///
    /// # Expected behavior
    /// The parts are merged into one after the final merge delay.
    #[test]
    fn workers__idle_partition_gets_a_final_merge() {
        let tmp = TempDir::new().unwrap();
        let pt = create_partition(
            tmp.path(),
            EngineSettings {
                small_merge_workers: 1,
                final_merge_delay: Duration::from_millis(300),
                ..manual_settings()
            },
        );
        for i in 0..3 {
            pt.add_rows(&rows(1, 10, BASE_TS + i * 100_000)).unwrap();
            pt.flush_raw_rows(true).unwrap();
            pt.flush_inmemory_parts(true, None).unwrap();
        }

        assert!(wait_until(WAIT, || metrics(&pt).small_parts == 1));
        assert_eq!(read_rows(&pt).len(), 30);
        pt.close().unwrap();
    }

    /// # Scenario
    /// Close while writers insert and every worker is busy.
    ///
    /// # Actions
    /// 1. Four threads insert rows with tiny shards and short intervals.
    /// 2. Close once they finish, then reopen.
    ///
    /// # Expected behavior
    /// Every inserted row survives.
    #[test]
    fn workers__close_with_busy_workers_loses_nothing() {
        let tmp = TempDir::new().unwrap();
        let pt = create_partition(
            tmp.path(),
            EngineSettings {
                raw_rows_shards: 2,
                max_raw_rows_per_shard: 50,
                raw_rows_flush_interval: Duration::from_millis(5),
                inmemory_parts_flush_interval: Duration::from_millis(5),
                small_merge_workers: 2,
                big_merge_workers: 1,
                ..manual_settings()
            },
        );

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let pt = Arc::clone(&pt);
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    for i in 0..20 {
                        let batch: Vec<_> = (0..25)
                            .map(|j| row(t, BASE_TS + (i * 25 + j) * 1000, (i * 25 + j) as f64))
                            .collect();
                        pt.add_rows(&batch).unwrap();
                        mine.extend(batch);
                    }
                    mine
                })
            })
            .collect();
        let input: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        pt.close().unwrap();
        drop(pt);

        let pt = open_partition(tmp.path(), manual_settings());
        assert_eq!(read_rows(&pt), expected(&input));
        pt.close().unwrap();
    }

    #[test]
    fn workers__dropping_an_unclosed_partition_stops_them() {
        let tmp = TempDir::new().unwrap();
        let pt = create_partition(
            tmp.path(),
            EngineSettings {
                small_merge_workers: 2,
                raw_rows_flush_interval: Duration::from_millis(5),
                ..manual_settings()
            },
        );
        let weak = Arc::downgrade(&pt);
        drop(pt);
        assert!(wait_until(WAIT, || weak.upgrade().is_none()));
    }
}
