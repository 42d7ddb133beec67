//! Sharded buffer of ingested rows that are not yet packed into parts.
//!
//! Writers pick shards round-robin so that concurrent inserts rarely
//! contend on the same mutex. A shard that would grow past its capacity
//! hands its rows back to the writer, which packs them into an in-memory
//! part. Partially filled shards are drained by the background flusher once
//! their flush deadline passes.

use std::mem;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::block::RawRow;

struct RawRowsShard {
    /// Unix millis after which buffered rows are due for a flush. Updated
    /// whenever the shard goes from empty to non-empty.
    flush_deadline_ms: AtomicI64,
    rows: Mutex<Vec<RawRow>>,
}

impl RawRowsShard {
    fn new() -> Self {
        Self {
            flush_deadline_ms: AtomicI64::new(i64::MAX),
            rows: Mutex::new(Vec::new()),
        }
    }

    // A panic while holding the lock can only leave extra buffered rows.
    fn lock(&self) -> MutexGuard<'_, Vec<RawRow>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append as many of `rows` as fit. When the shard fills up its rows are
    /// swapped out and returned along with the rows that were not consumed.
    fn add_rows<'a>(
        &self,
        rows: &'a [RawRow],
        capacity: usize,
        deadline_ms: i64,
    ) -> (&'a [RawRow], Option<Vec<RawRow>>) {
        let mut buf = self.lock();
        if buf.is_empty() {
            self.flush_deadline_ms.store(deadline_ms, Ordering::Relaxed);
        }
        let n = capacity.saturating_sub(buf.len()).min(rows.len());
        buf.extend_from_slice(&rows[..n]);
        let rest = &rows[n..];
        if rest.is_empty() {
            return (rest, None);
        }

        let full = mem::take(&mut *buf);
        self.flush_deadline_ms.store(deadline_ms, Ordering::Relaxed);
        let n = capacity.min(rest.len());
        buf.extend_from_slice(&rest[..n]);
        (&rest[n..], Some(full))
    }

    fn take_if_due(&self, now_ms: i64, is_final: bool) -> Vec<RawRow> {
        if !is_final && now_ms < self.flush_deadline_ms.load(Ordering::Relaxed) {
            return Vec::new();
        }
        let mut buf = self.lock();
        self.flush_deadline_ms.store(i64::MAX, Ordering::Relaxed);
        mem::take(&mut *buf)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

pub(crate) struct RawRowsShards {
    shards: Vec<RawRowsShard>,
    next_shard: AtomicUsize,
    capacity: usize,
}

impl RawRowsShards {
    /// `shards` buffers of at most `capacity` rows each. Both are clamped to
    /// at least one.
    pub fn new(shards: usize, capacity: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| RawRowsShard::new()).collect(),
            next_shard: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Buffer `rows`. Returns the batches of full shards, which the caller
    /// must turn into parts.
    pub fn add_rows(&self, mut rows: &[RawRow], deadline_ms: i64) -> Vec<Vec<RawRow>> {
        let mut full = Vec::new();
        while !rows.is_empty() {
            let idx = self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shards.len();
            let (rest, batch) = self.shards[idx].add_rows(rows, self.capacity, deadline_ms);
            full.extend(batch);
            rows = rest;
        }
        full
    }

    /// Drain every shard whose deadline passed, or every shard when
    /// `is_final` is set. Empty batches are omitted.
    pub fn take_rows_to_flush(&self, now_ms: i64, is_final: bool) -> Vec<Vec<RawRow>> {
        self.shards
            .iter()
            .map(|shard| shard.take_if_due(now_ms, is_final))
            .filter(|rows| !rows.is_empty())
            .collect()
    }

    /// Rows currently buffered.
    pub fn len(&self) -> usize {
        self.shards.iter().map(RawRowsShard::len).sum()
    }

    pub fn shards_count(&self) -> usize {
        self.shards.len()
    }
}
