use std::fs::{self, File};
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::error::PersistenceError;
use super::records::Record;

/// Present in the incomplete directory while a format migration is running.
pub const MIGRATION_MARKER: &str = "migration_underway";

const PROGRESS_INTERVAL: usize = 10_000;

/// Move in-progress markers out of an old single-directory layout, resuming a
/// migration that was interrupted. Returns whether a migration ran.
pub(crate) fn migrate_if_needed(metadata_dir: &Path, incomplete_dir: &Path) -> Result<bool> {
    let marker = incomplete_dir.join(MIGRATION_MARKER);
    let old_layout = metadata_dir.exists() && !incomplete_dir.exists();
    if !old_layout && !marker.exists() {
        return Ok(false);
    }
    fs::create_dir_all(incomplete_dir)
        .with_context(|| format!("failed to create {}", incomplete_dir.display()))?;
    File::create(&marker)
        .with_context(|| format!("failed to create migration marker {}", marker.display()))?;
    migrate_records(metadata_dir, incomplete_dir)?;
    fs::remove_file(&marker)
        .with_context(|| format!("failed to remove migration marker {}", marker.display()))?;
    Ok(true)
}

/// Copy every metadata record flagged `incomplete` to the same relative path
/// below `incomplete_dir`. Targets that already exist are left alone, so a
/// rerun after a crash picks up where the last one stopped.
pub(crate) fn migrate_records(metadata_dir: &Path, incomplete_dir: &Path) -> Result<usize> {
    info!("migrating state directory to the separate incomplete-record layout");
    let mut visited = 0;
    if metadata_dir.exists() {
        for entry in WalkDir::new(metadata_dir) {
            let entry = entry
                .with_context(|| format!("failed to scan {}", metadata_dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            migrate_record(entry.path(), metadata_dir, incomplete_dir)?;
            visited += 1;
            if visited % PROGRESS_INTERVAL == 0 {
                info!(files = visited, "migration in progress");
            }
        }
    }
    info!(files = visited, "migration complete");
    Ok(visited)
}

fn migrate_record(path: &Path, metadata_dir: &Path, incomplete_dir: &Path) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let Ok(record) = serde_json::from_slice::<Record>(&bytes) else {
        let err = PersistenceError::RecordCorrupt {
            path: path.to_path_buf(),
        };
        debug!(%err, "skipping record during migration");
        return Ok(());
    };
    if !record
        .get("incomplete")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return Ok(());
    }
    let relative = path
        .strip_prefix(metadata_dir)
        .with_context(|| format!("{} is outside {}", path.display(), metadata_dir.display()))?;
    let target = incomplete_dir.join(relative);
    if target.exists() {
        return Ok(());
    }
    let parent = target.parent().unwrap_or(incomplete_dir);
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    io::copy(&mut bytes.as_slice(), &mut tmp)
        .with_context(|| format!("failed to copy {}", path.display()))?;
    tmp.persist(&target)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to move {} into place", target.display()))?;
    Ok(())
}
