//! Filesystem helpers shared by parts, partitions and snapshots.
//!
//! Every helper that mutates a directory tree leaves it durable: created
//! files are fsynced, and the parent directory is fsynced after renames and
//! removals so that the change survives a power loss.


use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Suffix of the temporary file used by [`write_file_atomically`].
const TMP_FILE_SUFFIX: &str = ".tmp";

/// Write `data` to `path` so that readers observe either the old or the new
/// contents, never a torn file.
pub fn write_file_atomically(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(TMP_FILE_SUFFIX);
    let tmp_path = PathBuf::from(tmp_name);
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    sync_parent_dir(path)
}

/// Create `path` with `data`, failing if it already exists.
pub fn write_new_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut f = OpenOptions::new().create_new(true).write(true).open(path)?;
    f.write_all(data)?;
    f.sync_all()
}

/// fsync a directory so that entries created, renamed or removed in it are
/// durable.
pub fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// fsync the directory containing `path`.
pub fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => sync_dir(parent),
        _ => Ok(()),
    }
}

/// Create `path` and its parents, then fsync the parent.
pub fn mkdir_all_sync(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)?;
    sync_parent_dir(path)
}

/// Create a single directory. An existing directory is an error.
pub fn mkdir_fail_if_exists(path: &Path) -> io::Result<()> {
    fs::create_dir(path)?;
    sync_parent_dir(path)
}

/// Remove a directory tree. A missing directory is not an error.
pub fn remove_dir_all_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => sync_parent_dir(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove a file. A missing file is not an error.
pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove every entry of `path`, keeping the directory itself.
pub fn clear_dir(path: &Path) -> io::Result<()> {
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    sync_dir(path)
}

/// Names of the subdirectories of `path`, sorted.
pub fn read_dir_names(path: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Names of the regular files in `path`, sorted.
pub fn read_file_names(path: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Recreate the tree under `src` at `dst` with every file hard-linked.
///
/// `dst` must not exist yet.
pub fn hard_link_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            hard_link_tree(&entry.path(), &target)?;
        } else {
            fs::hard_link(entry.path(), &target)?;
        }
    }
    sync_dir(dst)
}

/// Total size in bytes of the regular files under `path`.
pub fn dir_size(path: &Path) -> io::Result<u64> {
    let mut size = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            size += dir_size(&entry.path())?;
        } else {
            size += meta.len();
        }
    }
    Ok(size)
}
