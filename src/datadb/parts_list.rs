//! `parts.json` handling
//!
//! The partition directory lists its file parts in `parts.json`. A part
//! directory becomes visible only once its name is in this list, so a crash
//! between writing a merge output and updating the list leaves an unlisted
//! directory that is removed on the next open.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::error::{LogDbError, Result};
use crate::format::PARTS_FILENAME;
use crate::fsutil::{self, TMP_SUFFIX};

/// Read the names of the file parts of the partition at `path`
///
/// A missing list is only acceptable for a partition without part directories.
pub fn read_part_names(path: &Path) -> Result<Vec<String>> {
    let list_path = path.join(PARTS_FILENAME);
    if !list_path.exists() {
        let dirs = list_part_dirs(path)?;
        if !dirs.is_empty() {
            return Err(LogDbError::corruption(
                &list_path,
                format!(
                    "missing parts list while {} part directories exist; restore {} or remove the directories manually",
                    dirs.len(),
                    PARTS_FILENAME
                ),
            ));
        }
        write_part_names(path, &[])?;
        return Ok(Vec::new());
    }

    let data = fs::read(&list_path)?;
    let mut names: Vec<String> = serde_json::from_slice(&data)
        .map_err(|e| LogDbError::corruption(&list_path, format!("cannot parse parts list: {}", e)))?;
    for name in &names {
        if !is_valid_part_name(name) {
            return Err(LogDbError::corruption(
                &list_path,
                format!("invalid part name {:?}", name),
            ));
        }
        if !path.join(name).is_dir() {
            return Err(LogDbError::corruption(
                &list_path,
                format!("listed part directory {:?} is missing", name),
            ));
        }
    }
    names.sort();
    names.dedup();
    Ok(names)
}

/// Atomically replace `parts.json` with the sorted `names`
pub fn write_part_names(path: &Path, names: &[String]) -> Result<()> {
    let mut names = names.to_vec();
    names.sort();
    let data = serde_json::to_vec(&names)?;
    fsutil::write_file_atomic(&path.join(PARTS_FILENAME), &data)
}

/// Remove part directories not in `names` and leftover temporary files
pub fn remove_unused_dirs(path: &Path, names: &[String]) -> Result<()> {
    let mut removed = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if !names.contains(&name) {
                warn!(dir = %entry.path().display(), "removing part directory missing from the parts list");
                fsutil::remove_dir_all_logged(&entry.path())?;
                removed += 1;
            }
        } else if name.ends_with(TMP_SUFFIX) {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    if removed > 0 {
        fsutil::sync_dir(path)?;
        info!(path = %path.display(), removed, "cleaned up partition directory");
    }
    Ok(())
}

/// Directory name of a part created with merge index `idx`
pub fn part_dir_name(idx: u64) -> String {
    format!("{:016X}", idx)
}

fn is_valid_part_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && name != "." && name != ".."
}

fn list_part_dirs(path: &Path) -> Result<Vec<String>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(dirs)
}
