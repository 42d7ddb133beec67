//! Process-wide LRU cache of decompressed index blocks.
//!
//! Entries are keyed by `(part id, index block offset)`. A part evicts all of
//! its entries when it is dropped, so ids are never reused against stale
//! data.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::block::{BLOCK_HEADER_SIZE, BlockHeader};

/// Fixed per-entry overhead added to the header payload when accounting.
const ENTRY_OVERHEAD: usize = 64;

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: u64,
    pub size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

struct Entry {
    headers: Arc<Vec<BlockHeader>>,
    tick: u64,
    size: usize,
}

#[derive(Default)]
struct Inner {
    parts: HashMap<u64, HashMap<u64, Entry>>,
    /// Access tick → key, oldest first.
    lru: BTreeMap<u64, (u64, u64)>,
    tick: u64,
    size_bytes: usize,
    entries: usize,
}

pub struct IndexBlockCache {
    inner: Mutex<Inner>,
    capacity_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl IndexBlockCache {
    /// A cache holding at most `capacity_bytes`; `0` disables caching.
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    // The cache holds no invariants a panicking holder could break halfway,
    // so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, part_id: u64, offset: u64) -> Option<Arc<Vec<BlockHeader>>> {
        if self.capacity_bytes == 0 {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let hit = inner
            .parts
            .get_mut(&part_id)
            .and_then(|m| m.get_mut(&offset))
            .map(|e| {
                let old = e.tick;
                e.tick = tick;
                (old, Arc::clone(&e.headers))
            });
        match hit {
            Some((old, headers)) => {
                inner.lru.remove(&old);
                inner.lru.insert(tick, (part_id, offset));
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(headers)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, part_id: u64, offset: u64, headers: Arc<Vec<BlockHeader>>) {
        if self.capacity_bytes == 0 {
            return;
        }
        let size = headers.len() * BLOCK_HEADER_SIZE + ENTRY_OVERHEAD;
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let prev = inner
            .parts
            .entry(part_id)
            .or_default()
            .insert(offset, Entry { headers, tick, size });
        match prev {
            Some(old) => {
                inner.lru.remove(&old.tick);
                inner.size_bytes -= old.size;
            }
            None => inner.entries += 1,
        }
        inner.lru.insert(tick, (part_id, offset));
        inner.size_bytes += size;

        while inner.size_bytes > self.capacity_bytes {
            let Some((_, (pid, off))) = inner.lru.pop_first() else {
                break;
            };
            inner.remove_entry(pid, off);
        }
    }

    /// Drop every entry of `part_id`.
    pub fn remove_part(&self, part_id: u64) {
        let mut inner = self.lock();
        let Some(entries) = inner.parts.remove(&part_id) else {
            return;
        };
        for e in entries.values() {
            inner.lru.remove(&e.tick);
            inner.size_bytes -= e.size;
            inner.entries -= 1;
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries as u64,
            size_bytes: inner.size_bytes as u64,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn remove_entry(&mut self, part_id: u64, offset: u64) {
        let Some(m) = self.parts.get_mut(&part_id) else {
            return;
        };
        if let Some(e) = m.remove(&offset) {
            self.size_bytes -= e.size;
            self.entries -= 1;
        }
        if m.is_empty() {
            self.parts.remove(&part_id);
        }
    }
}

impl std::fmt::Debug for IndexBlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexBlockCache")
            .field("capacity_bytes", &self.capacity_bytes)
            .field("stats", &self.stats())
            .finish()
    }
}
