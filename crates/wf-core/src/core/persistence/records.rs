use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::warn;

use super::codec::RecordPathCodec;
use super::error::PersistenceError;
use crate::core::fs::remove_empty_parents;

/// A persisted record: a JSON object of named fields.
pub type Record = Map<String, Value>;

/// Namespace a record lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subject {
    /// Completed-job history.
    Metadata,
    /// In-progress markers.
    Incomplete,
}

impl Subject {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Incomplete => "incomplete",
        }
    }
}

/// Atomic, self-healing JSON record store keyed by (subject, id).
#[derive(Debug)]
pub struct RecordStore {
    root: PathBuf,
    codec: RecordPathCodec,
    cached_reads: AtomicBool,
    cache: Mutex<HashMap<(Subject, String), Record>>,
}

impl RecordStore {
    /// Store whose subject directories live directly below `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_codec(root, RecordPathCodec::new())
    }

    #[must_use]
    pub fn with_codec(root: impl Into<PathBuf>, codec: RecordPathCodec) -> Self {
        Self {
            root: root.into(),
            codec,
            cached_reads: AtomicBool::new(true),
            cache: Mutex::default(),
        }
    }

    #[must_use]
    pub fn subject_root(&self, subject: Subject) -> PathBuf {
        self.root.join(subject.as_str())
    }

    #[must_use]
    pub fn record_path(&self, subject: Subject, id: &str) -> PathBuf {
        self.codec.encode(&self.subject_root(subject), id)
    }

    /// Serialize `value` into the record for (subject, id), replacing any
    /// previous record atomically.
    pub fn write<T: Serialize + ?Sized>(&self, subject: Subject, id: &str, value: &T) -> Result<()> {
        let path = self.record_path(subject, id);
        let dir = path
            .parent()
            .map_or_else(|| self.subject_root(subject), Path::to_path_buf);
        let suffix = debug_suffix(&path);
        // A concurrent delete may prune the chunk directory before the temp
        // file is opened.
        let mut tmp = retry_on_not_found(|| temp_record_in(&dir, &suffix))
            .with_context(|| format!("failed to create temp record in {}", dir.display()))?;
        serde_json::to_writer(&mut tmp, value)
            .with_context(|| format!("failed to serialize record {}", path.display()))?;
        tmp.flush()
            .with_context(|| format!("failed to flush temp record {}", tmp.path().display()))?;
        set_group_rw(tmp.path())?;
        tmp.persist(&path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to move record into place {}", path.display()))?;

        self.invalidate(subject, id);
        Ok(())
    }

    /// Read the record for (subject, id). Missing and corrupt records both
    /// read as empty; corrupt files are deleted.
    pub fn read(&self, subject: Subject, id: &str) -> Result<Record> {
        if !self.cached_reads.load(Ordering::Relaxed) {
            return self.read_uncached(subject, id);
        }
        let key = (subject, id.to_string());
        if let Some(record) = self.lock_cache().get(&key) {
            return Ok(record.clone());
        }
        let record = self.read_uncached(subject, id)?;
        self.lock_cache().insert(key, record.clone());
        Ok(record)
    }

    fn read_uncached(&self, subject: Subject, id: &str) -> Result<Record> {
        let path = self.record_path(subject, id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Record::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read record {}", path.display()))
            }
        };
        if let Ok(record) = serde_json::from_slice::<Record>(&bytes) {
            return Ok(record);
        }
        let err = PersistenceError::RecordCorrupt { path: path.clone() };
        warn!(%err, "deleting corrupted record");
        self.delete(subject, id)?;
        Ok(Record::new())
    }

    /// Remove the record for (subject, id) along with any directories left
    /// empty below the subject root. Returns `false` if it did not exist.
    pub fn delete(&self, subject: Subject, id: &str) -> Result<bool> {
        let path = self.record_path(subject, id);
        self.invalidate(subject, id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to remove record {}", path.display()))
            }
        }
        if let Some(parent) = path.parent() {
            remove_empty_parents(parent, &self.subject_root(subject));
        }
        Ok(true)
    }

    #[must_use]
    pub fn exists(&self, subject: Subject, id: &str) -> bool {
        self.record_path(subject, id).exists()
    }

    /// Switch between cached and uncached reads. Turning caching off also
    /// drops everything cached so far.
    pub fn set_cached_reads(&self, enabled: bool) {
        self.cached_reads.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.lock_cache().clear();
        }
    }

    #[must_use]
    pub fn cached_reads(&self) -> bool {
        self.cached_reads.load(Ordering::Relaxed)
    }

    fn invalidate(&self, subject: Subject, id: &str) {
        self.lock_cache().remove(&(subject, id.to_string()));
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<(Subject, String), Record>> {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn temp_record_in(dir: &Path, suffix: &str) -> io::Result<NamedTempFile> {
    fs::create_dir_all(dir)?;
    tempfile::Builder::new().suffix(suffix).tempfile_in(dir)
}

fn retry_on_not_found<T>(mut attempt: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    match attempt() {
        Err(err) if err.kind() == ErrorKind::NotFound => attempt(),
        other => other,
    }
}

/// Short piece of the final file name, attached to temp files for debugging.
fn debug_suffix(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let short: String = name.chars().take(8).collect();
    format!(".{short}")
}

#[cfg(unix)]
fn set_group_rw(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o660))
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_group_rw(_path: &Path) -> Result<()> {
    Ok(())
}
