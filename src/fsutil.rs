//! Filesystem helpers
//!
//! Crash-safe primitives used when creating parts and rewriting `parts.json`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::Result;

/// Suffix of files written by `write_file_atomic` before the rename
pub const TMP_SUFFIX: &str = ".tmp";

/// Replace `path` with `data` so readers see either the old or the new file
pub fn write_file_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TMP_SUFFIX);
    let tmp = Path::new(&tmp);
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    fs::rename(tmp, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// fsync a directory so created or renamed entries survive a crash
pub fn sync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(path)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Create `path`, failing if it already exists
pub fn create_dir_new(path: &Path) -> Result<()> {
    fs::create_dir(path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Remove a directory tree, logging instead of failing when it is already gone
pub fn remove_dir_all_logged(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            if let Some(parent) = path.parent() {
                sync_dir(parent)?;
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "directory already removed");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Sum of file sizes below `path`
pub fn dir_size(path: &Path) -> Result<u64> {
    let mut n = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            n += dir_size(&entry.path())?;
        } else {
            n += meta.len();
        }
    }
    Ok(n)
}
