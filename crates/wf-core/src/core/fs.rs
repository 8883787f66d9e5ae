use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

/// Remove a directory tree, treating an already-missing tree as success.
pub(crate) fn remove_dir_all_if_exists(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("failed to stat {}", path.display())),
    };
    if meta.file_type().is_symlink() || !meta.is_dir() {
        fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))?;
        return Ok(());
    }
    fs::remove_dir_all(path).with_context(|| format!("failed to remove {}", path.display()))?;
    Ok(())
}

/// Walk upwards from `start`, removing directories until one is non-empty or
/// `stop` is reached. `stop` itself is never removed.
pub(crate) fn remove_empty_parents(start: &Path, stop: &Path) {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

pub(crate) fn timestamp_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub(crate) fn file_modified_secs(path: &Path) -> Option<f64> {
    fs::metadata(path)
        .ok()?
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs_f64())
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    fn format_scaled(value: u64, unit: u64, suffix: &str) -> String {
        let whole = value / unit;
        let remainder = value % unit;
        let tenths = (remainder * 10) / unit;
        format!("{whole}.{tenths} {suffix}")
    }

    if bytes >= GB {
        format_scaled(bytes, GB, "GB")
    } else if bytes >= MB {
        format_scaled(bytes, MB, "MB")
    } else if bytes >= KB {
        format_scaled(bytes, KB, "KB")
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn format_bytes_scales_values() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(1_572_864), "1.5 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn empty_parents_stop_at_boundary() -> Result<()> {
        let temp = tempdir()?;
        let stop = temp.path().join("subject");
        let deep = stop.join("@a").join("@b");
        fs::create_dir_all(&deep)?;
        fs::create_dir_all(stop.join("@a").join("keep"))?;

        remove_empty_parents(&deep, &stop);
        assert!(!deep.exists());
        assert!(stop.join("@a").exists(), "non-empty parent must survive");

        fs::remove_dir(stop.join("@a").join("keep"))?;
        remove_empty_parents(&stop.join("@a"), &stop);
        assert!(!stop.join("@a").exists());
        assert!(stop.exists(), "boundary directory must survive");
        Ok(())
    }

    #[test]
    fn removing_missing_tree_is_ok() -> Result<()> {
        let temp = tempdir()?;
        remove_dir_all_if_exists(&temp.path().join("absent"))?;
        let tree = temp.path().join("tree");
        fs::create_dir_all(tree.join("nested"))?;
        fs::write(tree.join("nested").join("file"), b"x")?;
        remove_dir_all_if_exists(&tree)?;
        assert!(!tree.exists());
        Ok(())
    }
}
