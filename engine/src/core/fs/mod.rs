//! Filesystem utilities.
//!
//! Crash-tolerant write primitives shared by the settings store and the
//! history journal. A partial write must never leave either file unreadable,
//! so every full rewrite goes through a sibling temp file and a rename.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use tracing::debug;

use crate::core::CoreResult;

// =============================================================================
// Atomic Writes
// =============================================================================

/// Replaces `path` with `bytes` so readers see either the old or the new content.
///
/// The data is synced to a sibling `.tmp` file before it is renamed into place.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = sibling_path(path, "tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    swap_into_place(&tmp_path, path)
}

/// Write a JSON file atomically with pretty formatting.
pub fn atomic_write_json_pretty<T: Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Write a JSONL file atomically, one compact JSON document per line.
pub fn atomic_write_json_lines<'a, T, I>(path: &Path, values: I) -> CoreResult<()>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut bytes = Vec::new();
    for value in values {
        serde_json::to_writer(&mut bytes, value)?;
        bytes.push(b'\n');
    }
    atomic_write_bytes(path, &bytes)
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut sibling = path.to_path_buf();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| suffix.to_string());
    sibling.set_file_name(format!("{file_name}.{suffix}"));
    sibling
}

/// Moves a fully written temp file over `dest`
///
/// Falls back to parking the old file as `.bak` when the platform refuses to
/// rename over an existing file; the old content is put back on failure.
fn swap_into_place(tmp: &Path, dest: &Path) -> CoreResult<()> {
    let refused = match std::fs::rename(tmp, dest) {
        Ok(()) => return Ok(()),
        Err(e) if dest.exists() => e,
        Err(e) => {
            let _ = std::fs::remove_file(tmp);
            return Err(e.into());
        }
    };
    debug!(path = ?dest, "Rename over existing file refused ({}), swapping", refused);

    let parked = sibling_path(dest, "bak");
    let _ = std::fs::remove_file(&parked);
    std::fs::rename(dest, &parked)?;
    if let Err(e) = std::fs::rename(tmp, dest) {
        let _ = std::fs::rename(&parked, dest);
        let _ = std::fs::remove_file(tmp);
        return Err(e.into());
    }
    let _ = std::fs::remove_file(&parked);
    Ok(())
}
