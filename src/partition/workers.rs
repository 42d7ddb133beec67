//! Background workers of a partition.
//!
//! Every partition runs:
//!
//! - a raw-rows flusher, packing buffered rows into in-memory parts;
//! - an in-memory parts flusher, writing due in-memory parts to disk;
//! - `small_merge_workers` threads merging in-memory and small parts;
//! - `big_merge_workers` threads merging big parts;
//! - a stale parts remover, dropping parts past the retention.
//!
//! Workers hold a weak reference to the partition and exit once it is gone
//! or the stop channel disconnects.

use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{error, trace};

use super::{PartKind, Partition};

const MIN_MERGE_BACKOFF: Duration = Duration::from_millis(1);
const MAX_MERGE_BACKOFF: Duration = Duration::from_secs(1);

pub(super) struct Workers {
    /// Dropping it disconnects every worker's receiver.
    stop: Sender<()>,
    inmemory_flusher: JoinHandle<()>,
    raw_rows_flusher: JoinHandle<()>,
    stale_parts_remover: JoinHandle<()>,
    small_mergers: Vec<JoinHandle<()>>,
    big_mergers: Vec<JoinHandle<()>>,
}

impl Workers {
    pub(super) fn start(pt: &Arc<Partition>, stop: Sender<()>) -> io::Result<Self> {
        let settings = Arc::clone(pt.settings());
        let name = pt.name().to_string();

        let raw_rows_flusher = spawn(format!("raw-flush-{name}"), pt, settings.raw_rows_flush_interval, |pt| {
            if let Err(e) = pt.flush_raw_rows(false) {
                error!(partition = %pt.name(), error = %e, "flushing raw rows failed");
            }
        })?;
        let inmemory_flusher = spawn(
            format!("mem-flush-{name}"),
            pt,
            settings.inmemory_parts_flush_interval,
            |pt| match pt.flush_inmemory_parts(false, Some(&pt.stop)) {
                Err(e) if !e.is_forcibly_stopped() => {
                    error!(partition = %pt.name(), error = %e, "flushing in-memory parts failed");
                }
                _ => {}
            },
        )?;
        let stale_parts_remover = spawn(
            format!("stale-parts-{name}"),
            pt,
            settings.retention_check_interval,
            |pt| {
                if let Err(e) = pt.remove_stale_parts() {
                    error!(partition = %pt.name(), error = %e, "removing stale parts failed");
                }
            },
        )?;

        let mut small_mergers = Vec::with_capacity(settings.small_merge_workers);
        for i in 0..settings.small_merge_workers {
            small_mergers.push(spawn_merger(format!("small-merge-{name}-{i}"), pt, PartKind::Small)?);
        }
        let mut big_mergers = Vec::with_capacity(settings.big_merge_workers);
        for i in 0..settings.big_merge_workers {
            big_mergers.push(spawn_merger(format!("big-merge-{name}-{i}"), pt, PartKind::Big)?);
        }

        Ok(Self {
            stop,
            inmemory_flusher,
            raw_rows_flusher,
            stale_parts_remover,
            small_mergers,
            big_mergers,
        })
    }

    /// Signal every worker and wait for it. The in-memory flusher goes
    /// first so it cannot race the final flush.
    pub(super) fn stop(self) {
        drop(self.stop);
        join("in-memory flusher", self.inmemory_flusher);
        join("raw rows flusher", self.raw_rows_flusher);
        join("stale parts remover", self.stale_parts_remover);
        for h in self.small_mergers {
            join("small merger", h);
        }
        for h in self.big_mergers {
            join("big merger", h);
        }
    }
}

fn join(what: &str, handle: JoinHandle<()>) {
    if handle.join().is_err() {
        error!(worker = what, "background worker panicked");
    }
}

/// Spawn a thread calling `f` every `interval` until stopped.
fn spawn<F>(name: String, pt: &Arc<Partition>, interval: Duration, f: F) -> io::Result<JoinHandle<()>>
where
    F: Fn(&Partition) + Send + 'static,
{
    let weak = Arc::downgrade(pt);
    let stop = pt.stop.clone();
    thread::Builder::new().name(name).spawn(move || {
        loop {
            match stop.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
            let Some(pt) = weak.upgrade() else {
                return;
            };
            f(&pt);
        }
    })
}

fn spawn_merger(name: String, pt: &Arc<Partition>, kind: PartKind) -> io::Result<JoinHandle<()>> {
    let weak = Arc::downgrade(pt);
    let stop = pt.stop.clone();
    thread::Builder::new()
        .name(name)
        .spawn(move || run_merger(&weak, &stop, kind))
}

/// Merge parts of `kind` until stopped. Backs off exponentially while there
/// is nothing to merge, and switches to final merges after the partition
/// stays idle for `final_merge_delay`.
fn run_merger(weak: &Weak<Partition>, stop: &Receiver<()>, kind: PartKind) {
    let mut backoff = MIN_MERGE_BACKOFF;
    let mut last_merge = Instant::now();
    loop {
        let merged = {
            let Some(pt) = weak.upgrade() else {
                return;
            };
            let delay = pt.settings().final_merge_delay;
            let is_final = !delay.is_zero() && last_merge.elapsed() >= delay;
            match pt.merge_next(kind, is_final, Some(stop)) {
                Ok(merged) => merged,
                Err(e) if e.is_forcibly_stopped() => return,
                Err(e) => {
                    error!(partition = %pt.name(), kind = ?kind, error = %e, "merge failed");
                    false
                }
            }
        };
        if merged {
            trace!(kind = ?kind, "merge done");
            last_merge = Instant::now();
            backoff = MIN_MERGE_BACKOFF;
            continue;
        }
        match stop.recv_timeout(backoff) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
        backoff = (backoff * 2).min(MAX_MERGE_BACKOFF);
    }
}
