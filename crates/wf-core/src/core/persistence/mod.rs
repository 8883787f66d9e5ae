//! On-disk run state: per-output records, change detection, crash recovery
//! and advisory locking for one state directory.
//!
//! Layout below the state directory:
//!
//! ```text
//! metadata/<codec path>      completed-job history, one JSON record per output
//! incomplete/<codec path>    in-progress markers, one JSON record per output
//! locks/{N}.input.lock       files read by a live run, one per line
//! locks/{N}.output.lock      files written by a live run, one per line
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::{debug, info};
use wf_domain::{FileIdentity, Job, JobGraph};

use crate::core::config::PersistenceConfig;
use crate::core::fs::{file_modified_secs, remove_dir_all_if_exists, timestamp_secs};

mod changes;
mod codec;
mod error;
mod fingerprint;
mod history;
mod housekeeping;
mod lifecycle;
mod locks;
mod migration;
mod params;
mod records;

pub use changes::{Change, ChangedOutputs};
pub use codec::{RecordPathCodec, DEFAULT_MAX_FILENAME_LEN};
pub use error::PersistenceError;
pub use history::MetadataRecord;
pub use housekeeping::ContainerCleanup;
pub use locks::{LockClaim, LockManager, LockType};
pub use migration::MIGRATION_MARKER;
#[cfg(feature = "tabular")]
pub use params::TabularParamSerializer;
pub use params::{select_param_serializer, BuiltinParamSerializer, ParamSerializer};
pub use records::{Record, RecordStore, Subject};

use fingerprint::Fingerprinter;
use lifecycle::IncompleteSnapshot;

const LOCKS_DIR: &str = "locks";
const SHADOW_DIR: &str = "shadow";
const CONDA_DIR: &str = "conda";
const CONDA_ARCHIVE_DIR: &str = "conda-archive";
const SINGULARITY_DIR: &str = "singularity";
const AUX_DIR: &str = "auxiliary";
const SOURCE_CACHE_DIR: &str = "source_cache";
const BENCHMARKS_DIR: &str = "benchmarks";

/// Run state for one state directory.
#[derive(Debug)]
pub struct Persistence {
    path: PathBuf,
    records: RecordStore,
    fingerprints: Fingerprinter,
    locks: LockManager,
    incomplete: Mutex<IncompleteSnapshot>,
    shadow_dir: PathBuf,
    conda_env_dir: PathBuf,
    conda_env_archive_dir: PathBuf,
    container_img_dir: PathBuf,
    aux_dir: PathBuf,
    source_cache_dir: PathBuf,
    benchmark_dir: PathBuf,
}

impl Persistence {
    /// Open (and if needed create or migrate) the state directory described
    /// by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state directory is not a directory, cannot be
    /// created, or an interrupted format migration cannot be completed.
    pub fn open(config: PersistenceConfig) -> Result<Self> {
        let path = std::path::absolute(&config.state_dir).with_context(|| {
            format!("failed to resolve state directory {}", config.state_dir.display())
        })?;
        if path.exists() && !path.is_dir() {
            return Err(PersistenceError::InvalidStateDir { path }.into());
        }
        let lock_dir = path.join(LOCKS_DIR);
        fs::create_dir_all(&lock_dir)
            .with_context(|| format!("failed to create {}", lock_dir.display()))?;

        let metadata_dir = path.join(Subject::Metadata.as_str());
        let incomplete_dir = path.join(Subject::Incomplete.as_str());
        migration::migrate_if_needed(&metadata_dir, &incomplete_dir)?;

        let shadow_dir = config
            .shadow_prefix
            .as_deref()
            .unwrap_or(&path)
            .join(SHADOW_DIR);
        let conda_env_dir = config
            .conda_prefix
            .clone()
            .unwrap_or_else(|| path.join(CONDA_DIR));
        let container_img_dir = config
            .singularity_prefix
            .clone()
            .unwrap_or_else(|| path.join(SINGULARITY_DIR));

        let persistence = Self {
            records: RecordStore::new(&path),
            fingerprints: Fingerprinter::new(select_param_serializer()),
            locks: LockManager::new(lock_dir, config.lock_mode),
            incomplete: Mutex::new(if config.read_cache {
                IncompleteSnapshot::Unbuilt
            } else {
                IncompleteSnapshot::Disabled
            }),
            shadow_dir,
            conda_env_dir,
            conda_env_archive_dir: path.join(CONDA_ARCHIVE_DIR),
            container_img_dir,
            aux_dir: path.join(AUX_DIR),
            source_cache_dir: path.join(SOURCE_CACHE_DIR),
            benchmark_dir: path.join(BENCHMARKS_DIR),
            path,
        };
        persistence.records.set_cached_reads(config.read_cache);
        persistence.ensure_layout()?;
        Ok(persistence)
    }

    fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.records.subject_root(Subject::Metadata),
            self.records.subject_root(Subject::Incomplete),
            self.shadow_dir.clone(),
            self.conda_env_archive_dir.clone(),
            self.conda_env_dir.clone(),
            self.container_img_dir.clone(),
            self.aux_dir.clone(),
            self.source_cache_dir.clone(),
            self.benchmark_dir.clone(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    #[must_use]
    pub fn shadow_dir(&self) -> &Path {
        &self.shadow_dir
    }

    #[must_use]
    pub fn conda_env_dir(&self) -> &Path {
        &self.conda_env_dir
    }

    #[must_use]
    pub fn conda_env_archive_dir(&self) -> &Path {
        &self.conda_env_archive_dir
    }

    #[must_use]
    pub fn container_img_dir(&self) -> &Path {
        &self.container_img_dir
    }

    /// Scratch space for auxiliary run data such as source archives.
    #[must_use]
    pub fn aux_dir(&self) -> &Path {
        &self.aux_dir
    }

    #[must_use]
    pub fn source_cache_dir(&self) -> &Path {
        &self.source_cache_dir
    }

    #[must_use]
    pub fn benchmark_dir(&self) -> &Path {
        &self.benchmark_dir
    }

    /// First file claimed by another live run that this run would conflict
    /// with, if any.
    pub fn lock_conflict(&self, graph: &dyn JobGraph) -> Result<Option<String>> {
        self.locks.lock_conflict(&LockClaim::from_graph(graph))
    }

    pub fn locked(&self, graph: &dyn JobGraph) -> Result<bool> {
        self.locks.locked(&LockClaim::from_graph(graph))
    }

    /// Claim the inputs of every job and the outputs of every job that still
    /// needs to run.
    ///
    /// # Errors
    ///
    /// Fails with [`PersistenceError::LockConflict`] when another run holds a
    /// conflicting claim and the lock mode enforces locking.
    pub fn lock(&mut self, graph: &dyn JobGraph) -> Result<()> {
        self.locks.lock(&LockClaim::from_graph(graph))
    }

    pub fn unlock(&mut self) -> Result<()> {
        self.locks.unlock()
    }

    /// Remove every lock file, including those of other runs.
    pub fn cleanup_locks(&self) -> Result<()> {
        self.locks.cleanup_locks()
    }

    /// Stop serving reads from memory. Needed whenever other processes may
    /// be writing records during this invocation.
    pub fn deactivate_cache(&self) {
        self.records.set_cached_reads(false);
        *self.lock_incomplete() = IncompleteSnapshot::Disabled;
    }

    fn lock_incomplete(&self) -> MutexGuard<'_, IncompleteSnapshot> {
        self.incomplete
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
