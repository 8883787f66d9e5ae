use std::fmt;
use std::fs::{self, File};
use std::io;
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};

/// Files larger than this are never checksummed.
pub const CHECKSUM_SIZE_THRESHOLD: u64 = 1_000_000;

/// A job input or output as seen by the persistence layer.
pub trait FileIdentity: fmt::Debug + Send + Sync {
    /// Canonical path or URI; used as the record id.
    fn id(&self) -> &str;

    /// Identity of what is actually read. Inputs that point into a cached
    /// source report the underlying path or URI here.
    fn resolved_id(&self) -> &str {
        self.id()
    }

    fn exists(&self) -> bool;

    /// Last modification time (local or remote) in epoch seconds.
    fn mtime(&self) -> Option<f64>;

    /// Content checksum, or `None` when it cannot be computed.
    fn checksum(&self) -> Option<String>;
}

/// A file on the local filesystem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalFile {
    path: Utf8PathBuf,
    source_cache_entry: Option<String>,
}

impl LocalFile {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            source_cache_entry: None,
        }
    }

    /// Mark this file as a reference into the source cache, materialized from
    /// `origin`.
    #[must_use]
    pub fn from_source_cache(mut self, origin: impl Into<String>) -> Self {
        self.source_cache_entry = Some(origin.into());
        self
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn sha256(&self) -> io::Result<String> {
        let mut file = File::open(&self.path)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    }
}

impl FileIdentity for LocalFile {
    fn id(&self) -> &str {
        self.path.as_str()
    }

    fn resolved_id(&self) -> &str {
        self.source_cache_entry
            .as_deref()
            .unwrap_or_else(|| self.path.as_str())
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn mtime(&self) -> Option<f64> {
        fs::metadata(&self.path)
            .ok()?
            .modified()
            .ok()?
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs_f64())
    }

    fn checksum(&self) -> Option<String> {
        let meta = fs::metadata(&self.path).ok()?;
        if !meta.is_file() || meta.len() > CHECKSUM_SIZE_THRESHOLD {
            return None;
        }
        self.sha256().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn checksum_skips_missing_and_directories() -> Result<()> {
        let temp = tempdir()?;
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
            .map_err(|p| anyhow::anyhow!("non-utf8 temp path {}", p.display()))?;
        let missing = LocalFile::new(root.join("missing.txt"));
        assert!(!missing.exists());
        assert!(missing.checksum().is_none());
        assert!(missing.mtime().is_none());

        let dir = LocalFile::new(root.clone());
        assert!(dir.exists());
        assert!(dir.checksum().is_none());

        let path = root.join("data.txt");
        fs::write(&path, b"hello")?;
        let file = LocalFile::new(path);
        assert_eq!(
            file.checksum().as_deref(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
        assert!(file.mtime().is_some());
        Ok(())
    }

    #[test]
    fn source_cache_entries_resolve_to_origin() {
        let file = LocalFile::new(".wf/source_cache/abc/script.py")
            .from_source_cache("https://example.invalid/repo/script.py");
        assert_eq!(file.id(), ".wf/source_cache/abc/script.py");
        assert_eq!(file.resolved_id(), "https://example.invalid/repo/script.py");
    }
}
