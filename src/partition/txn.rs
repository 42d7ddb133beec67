//! Crash-safe commit of merge results.
//!
//! A merge writes its output into `tmp/` and then records a transaction
//! file in `txn/`:
//!
//! ```text
//! /data/small/2024_05/100_2_..._00000000000000A1      source parts to delete
//! /data/small/2024_05/80_1_..._00000000000000A2
//! /data/small/2024_05/tmp/00000000000000A3 -> /data/small/2024_05/150_2_..._00000000000000A3
//! ```
//!
//! The last line moves the merged part into place; its right-hand side is
//! empty when the merge left no rows. Running a transaction is idempotent:
//! missing sources are tolerated, and the file is deleted only after every
//! step completed. Leftover files are replayed on open in name order, which
//! is creation order since names come from a monotonic counter.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::PartitionError;
use crate::fsutil;

pub(crate) const TXN_DIRNAME: &str = "txn";
pub(crate) const TMP_DIRNAME: &str = "tmp";

const MOVE_SEPARATOR: &str = " -> ";

/// A parsed transaction file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Transaction {
    pub remove: Vec<PathBuf>,
    pub src: PathBuf,
    /// `None` when the merged part is empty and `src` is simply deleted.
    pub dst: Option<PathBuf>,
}

fn path_str(path: &Path) -> Result<&str, PartitionError> {
    let s = path
        .to_str()
        .ok_or_else(|| PartitionError::Transaction(format!("non UTF-8 path {}", path.display())))?;
    if s.is_empty() || s.contains('\n') || s.contains(MOVE_SEPARATOR) {
        return Err(PartitionError::Transaction(format!("unsupported path {s:?}")));
    }
    Ok(s)
}

impl Transaction {
    pub fn encode(&self) -> Result<String, PartitionError> {
        let mut out = String::new();
        for path in &self.remove {
            out.push_str(path_str(path)?);
            out.push('\n');
        }
        out.push_str(path_str(&self.src)?);
        out.push_str(MOVE_SEPARATOR);
        if let Some(dst) = &self.dst {
            out.push_str(path_str(dst)?);
        }
        out.push('\n');
        Ok(out)
    }

    pub fn parse(data: &str) -> Result<Self, PartitionError> {
        let mut lines: Vec<&str> = data.lines().collect();
        let Some(last) = lines.pop() else {
            return Err(PartitionError::Transaction("empty transaction".into()));
        };
        let Some((src, dst)) = last.split_once(MOVE_SEPARATOR.trim_end()) else {
            return Err(PartitionError::Transaction(format!(
                "invalid last line {last:?}; want `src -> dst`"
            )));
        };
        let src = src.trim_end();
        let dst = dst.trim_start();
        if src.is_empty() {
            return Err(PartitionError::Transaction(format!("missing source path in {last:?}")));
        }
        if lines.iter().any(|l| l.is_empty()) {
            return Err(PartitionError::Transaction("empty path in the removal list".into()));
        }
        Ok(Self {
            remove: lines.into_iter().map(PathBuf::from).collect(),
            src: PathBuf::from(src),
            dst: (!dst.is_empty()).then(|| PathBuf::from(dst)),
        })
    }
}

/// Name of the txn file and tmp directory of the merge numbered `suffix`.
pub(crate) fn scratch_name(suffix: u64) -> String {
    format!("{suffix:016X}")
}

/// Durably record `txn` under `txn_dir`. Returns the file path.
pub(crate) fn write_transaction(txn_dir: &Path, suffix: u64, txn: &Transaction) -> Result<PathBuf, PartitionError> {
    let path = txn_dir.join(scratch_name(suffix));
    fsutil::write_file_atomically(&path, txn.encode()?.as_bytes())?;
    Ok(path)
}

fn validate_path(path: &Path, roots: &[&Path]) -> Result<(), PartitionError> {
    let inside = path.is_absolute() && roots.iter().any(|root| path != *root && path.starts_with(root));
    if !inside {
        let roots: Vec<_> = roots.iter().map(|r| r.display().to_string()).collect();
        return Err(PartitionError::Transaction(format!(
            "path {} must be inside one of {roots:?}",
            path.display()
        )));
    }
    Ok(())
}

/// Execute the transaction stored at `txn_path`. Every path it names must
/// lie strictly inside one of `roots`, which are fsynced afterwards.
pub(crate) fn run_transaction(txn_path: &Path, roots: &[&Path]) -> Result<(), PartitionError> {
    let data = fs::read_to_string(txn_path)?;
    let txn = Transaction::parse(&data)?;
    for path in txn.remove.iter().chain(std::iter::once(&txn.src)).chain(&txn.dst) {
        validate_path(path, roots)?;
    }

    for path in &txn.remove {
        if !path.exists() {
            warn!(path = %path.display(), txn = %txn_path.display(), "part to remove is already gone");
            continue;
        }
        fsutil::remove_dir_all_if_exists(path)?;
    }

    match &txn.dst {
        Some(dst) => match fs::rename(&txn.src, dst) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if !dst.exists() {
                    warn!(
                        src = %txn.src.display(),
                        dst = %dst.display(),
                        "neither source nor destination of the move exists; expected only after an unclean shutdown"
                    );
                }
            }
            Err(e) => return Err(e.into()),
        },
        None => fsutil::remove_dir_all_if_exists(&txn.src)?,
    }

    for root in roots {
        fsutil::sync_dir(root)?;
    }
    fs::remove_file(txn_path)?;
    fsutil::sync_parent_dir(txn_path)?;
    debug!(txn = %txn_path.display(), removed = txn.remove.len(), "transaction done");
    Ok(())
}

/// Run the transactions left in the `txn/` directories of `roots` in name
/// order. Half-written transaction files are discarded. Returns the number
/// of replayed transactions.
pub(crate) fn replay_transactions(roots: &[&Path]) -> Result<usize, PartitionError> {
    let mut pending = Vec::new();
    for root in roots {
        let txn_dir = root.join(TXN_DIRNAME);
        if !txn_dir.exists() {
            continue;
        }
        for name in fsutil::read_file_names(&txn_dir)? {
            let path = txn_dir.join(&name);
            if name.ends_with(".tmp") {
                fsutil::remove_file_if_exists(&path)?;
                continue;
            }
            pending.push((name, path));
        }
    }
    pending.sort();
    for (_, path) in &pending {
        run_transaction(path, roots)?;
    }
    Ok(pending.len())
}
