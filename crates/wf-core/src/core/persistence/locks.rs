use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use wf_domain::JobGraph;

use super::error::PersistenceError;
use crate::core::config::LockMode;
use crate::core::fs::remove_dir_all_if_exists;

/// Kind of claim a lock file records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockType {
    Input,
    Output,
}

impl LockType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }

    fn file_name(self, index: u64) -> String {
        format!("{index}.{}.lock", self.as_str())
    }

    /// Index of a lock file name of this type, e.g. `3.input.lock`.
    fn parse_index(self, name: &str) -> Option<u64> {
        let suffix = format!(".{}.lock", self.as_str());
        let digits = name.strip_suffix(suffix.as_str())?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

/// The files one run reads and writes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockClaim {
    pub inputs: BTreeSet<String>,
    pub outputs: BTreeSet<String>,
}

impl LockClaim {
    pub fn new<I, O, S, T>(inputs: I, outputs: O) -> Self
    where
        I: IntoIterator<Item = S>,
        O: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
        }
    }

    /// Inputs of every job and outputs of the jobs that still need to run.
    pub fn from_graph(graph: &dyn JobGraph) -> Self {
        let inputs = graph
            .jobs()
            .into_iter()
            .flat_map(|job| job.input.iter().map(|file| file.id().to_string()))
            .collect();
        let outputs = graph
            .needrun_jobs()
            .into_iter()
            .flat_map(|job| job.output.iter().map(|file| file.id().to_string()))
            .collect();
        Self { inputs, outputs }
    }
}

/// Advisory, file-listing locks shared by every run on one state directory.
///
/// A run conflicts with an existing claim when it would write a file another
/// run reads or writes, or read a file another run writes. Checking and
/// claiming are separate steps; two runs starting at the same moment can both
/// succeed.
#[derive(Debug)]
pub struct LockManager {
    dir: PathBuf,
    mode: LockMode,
    created: BTreeMap<LockType, PathBuf>,
}

impl LockManager {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, mode: LockMode) -> Self {
        Self {
            dir: dir.into(),
            mode,
            created: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Lock files written by this manager and not yet released.
    pub fn created(&self) -> impl Iterator<Item = &Path> {
        self.created.values().map(PathBuf::as_path)
    }

    /// First file of `claim` that collides with an existing lock, if any.
    pub fn lock_conflict(&self, claim: &LockClaim) -> Result<Option<String>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        for lockfile in self.lock_files(LockType::Input)? {
            for file in read_claimed(&lockfile)? {
                if claim.outputs.contains(&file) {
                    return Ok(Some(file));
                }
            }
        }
        for lockfile in self.lock_files(LockType::Output)? {
            for file in read_claimed(&lockfile)? {
                if claim.outputs.contains(&file) || claim.inputs.contains(&file) {
                    return Ok(Some(file));
                }
            }
        }
        Ok(None)
    }

    pub fn locked(&self, claim: &LockClaim) -> Result<bool> {
        Ok(self.lock_conflict(claim)?.is_some())
    }

    /// Check for conflicts and write this run's lock files.
    ///
    /// # Errors
    ///
    /// Fails with [`PersistenceError::LockConflict`] in enforcing mode when
    /// another run holds a conflicting claim.
    pub fn lock(&mut self, claim: &LockClaim) -> Result<()> {
        match self.mode {
            LockMode::Disabled => Ok(()),
            LockMode::WarnOnly => {
                if let Some(path) = self.lock_conflict(claim)? {
                    info!(
                        %path,
                        "directory is locked by another run; continuing because locking is warn-only"
                    );
                }
                Ok(())
            }
            LockMode::Enforce => {
                if let Some(path) = self.lock_conflict(claim)? {
                    return Err(PersistenceError::LockConflict { path }.into());
                }
                self.write_lock(LockType::Input, &claim.inputs)?;
                self.write_lock(LockType::Output, &claim.outputs)?;
                Ok(())
            }
        }
    }

    /// Remove the lock files this manager created.
    pub fn unlock(&mut self) -> Result<()> {
        if self.mode != LockMode::Enforce {
            return Ok(());
        }
        debug!("unlocking");
        while let Some((_, path)) = self.created.pop_first() {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed lock"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to remove lock {}", path.display()))
                }
            }
        }
        debug!("removed all locks");
        Ok(())
    }

    /// Remove every lock file in the directory, whoever created it.
    pub fn cleanup_locks(&self) -> Result<()> {
        remove_dir_all_if_exists(&self.dir)
    }

    fn lock_files(&self, lock_type: LockType) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read lock directory {}", self.dir.display()))?;
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("failed to read lock directory {}", self.dir.display())
            })?;
            let name = entry.file_name();
            let Some(index) = name.to_str().and_then(|name| lock_type.parse_index(name)) else {
                continue;
            };
            if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
                continue;
            }
            found.push((index, entry.path()));
        }
        found.sort();
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    fn write_lock(&mut self, lock_type: LockType, files: &BTreeSet<String>) -> Result<()> {
        self.write_lock_with(lock_type, files.len(), |file| {
            for claimed in files {
                writeln!(file, "{claimed}")?;
            }
            file.flush()
        })
    }

    /// Claim the next free index for `lock_type` and fill it with `write`.
    /// A lock file that could not be written completely is removed again.
    fn write_lock_with(
        &mut self,
        lock_type: LockType,
        claimed: usize,
        write: impl FnOnce(&mut File) -> io::Result<()>,
    ) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create lock directory {}", self.dir.display()))?;
        let mut index = 0u64;
        loop {
            let path = self.dir.join(lock_type.file_name(index));
            index += 1;
            if path.exists() {
                continue;
            }
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create lock {}", path.display()))
                }
            };
            if let Err(err) = write(&mut file) {
                drop(file);
                if let Err(remove_err) = fs::remove_file(&path) {
                    warn!(path = %path.display(), %remove_err, "failed to remove partial lock");
                    self.created.insert(lock_type, path.clone());
                }
                return Err(err).with_context(|| format!("failed to write lock {}", path.display()));
            }
            debug!(path = %path.display(), files = claimed, "created lock");
            self.created.insert(lock_type, path);
            return Ok(());
        }
    }
}

fn read_claimed(lockfile: &Path) -> Result<Vec<String>> {
    let text = match fs::read_to_string(lockfile) {
        Ok(text) => text,
        // Released by its owner between listing and reading.
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read lock {}", lockfile.display()))
        }
    };
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;
    use wf_domain::{Job, LocalFile, Rule, StaticGraph};

    fn manager(dir: &Path, mode: LockMode) -> LockManager {
        LockManager::new(dir.join("locks"), mode)
    }

    #[test]
    fn lock_file_names_parse_strictly() {
        assert_eq!(LockType::Input.parse_index("0.input.lock"), Some(0));
        assert_eq!(LockType::Output.parse_index("12.output.lock"), Some(12));
        assert_eq!(LockType::Input.parse_index("12.output.lock"), None);
        assert_eq!(LockType::Input.parse_index(".input.lock"), None);
        assert_eq!(LockType::Input.parse_index("a1.input.lock"), None);
        assert_eq!(LockType::Input.parse_index("1.input.lock.tmp"), None);
    }

    #[test]
    fn claims_come_from_the_graph() {
        let rule = Arc::new(Rule::new("r"));
        let graph = StaticGraph::new(vec![
            Job::new(rule.clone())
                .with_input(LocalFile::new("raw.txt"))
                .with_output(LocalFile::new("mid.txt")),
            Job::new(rule)
                .with_input(LocalFile::new("mid.txt"))
                .with_output(LocalFile::new("final.txt")),
        ])
        .with_needrun([1]);
        let claim = LockClaim::from_graph(&graph);
        assert_eq!(claim, LockClaim::new(["mid.txt", "raw.txt"], ["final.txt"]));
    }

    #[test]
    fn conflicts_are_symmetric_where_expected() -> Result<()> {
        let temp = tempdir()?;
        let mut first = manager(temp.path(), LockMode::Enforce);
        first.lock(&LockClaim::new(["in.txt"], ["out.txt"]))?;

        let other = manager(temp.path(), LockMode::Enforce);
        // Writing what another run reads.
        assert_eq!(
            other.lock_conflict(&LockClaim::new(Vec::<String>::new(), ["in.txt"]))?,
            Some("in.txt".to_string())
        );
        // Reading what another run writes.
        assert_eq!(
            other.lock_conflict(&LockClaim::new(["out.txt"], Vec::<String>::new()))?,
            Some("out.txt".to_string())
        );
        // Writing what another run writes.
        assert!(other.locked(&LockClaim::new(Vec::<String>::new(), ["out.txt"]))?);
        // Shared reads are fine.
        assert!(!other.locked(&LockClaim::new(["in.txt"], ["elsewhere.txt"]))?);
        Ok(())
    }

    #[test]
    fn enforcing_lock_fails_on_conflict() -> Result<()> {
        let temp = tempdir()?;
        let mut first = manager(temp.path(), LockMode::Enforce);
        first.lock(&LockClaim::new(["a"], ["b"]))?;
        assert_eq!(first.created().count(), 2);

        let mut second = manager(temp.path(), LockMode::Enforce);
        let err = second
            .lock(&LockClaim::new(["b"], ["c"]))
            .expect_err("conflicting claim must fail");
        let err = err
            .downcast_ref::<PersistenceError>()
            .expect("lock conflict error");
        assert_eq!(err.code(), "WF100");
        assert_eq!(second.created().count(), 0);

        first.unlock()?;
        assert_eq!(first.created().count(), 0);
        second.lock(&LockClaim::new(["b"], ["c"]))?;
        Ok(())
    }

    #[test]
    fn new_locks_take_the_next_free_index() -> Result<()> {
        let temp = tempdir()?;
        let mut first = manager(temp.path(), LockMode::Enforce);
        first.lock(&LockClaim::new(["a"], ["b"]))?;
        let mut second = manager(temp.path(), LockMode::Enforce);
        second.lock(&LockClaim::new(["a"], ["c"]))?;

        let dir = temp.path().join("locks");
        for name in ["0.input.lock", "1.input.lock", "0.output.lock", "1.output.lock"] {
            assert!(dir.join(name).is_file(), "{name} missing");
        }
        assert_eq!(fs::read_to_string(dir.join("1.output.lock"))?, "c\n");

        first.unlock()?;
        assert!(!dir.join("0.input.lock").exists());
        assert!(dir.join("1.input.lock").exists());
        Ok(())
    }

    #[test]
    fn failed_lock_write_leaves_no_file_behind() -> Result<()> {
        let temp = tempdir()?;
        let mut holder = manager(temp.path(), LockMode::Enforce);
        let err = holder
            .write_lock_with(LockType::Output, 1, |file| {
                writeln!(file, "half")?;
                Err(io::Error::other("no space left on device"))
            })
            .expect_err("write failure must propagate");
        assert!(format!("{err:#}").contains("no space left"));
        assert_eq!(holder.created().count(), 0);
        assert_eq!(fs::read_dir(temp.path().join("locks"))?.count(), 0);

        let other = manager(temp.path(), LockMode::Enforce);
        assert!(!other.locked(&LockClaim::new(["half"], ["half"]))?);
        holder.lock(&LockClaim::new(["a"], ["b"]))?;
        assert!(temp.path().join("locks").join("0.output.lock").is_file());
        Ok(())
    }

    #[test]
    fn warn_only_and_disabled_modes_write_nothing() -> Result<()> {
        let temp = tempdir()?;
        let mut holder = manager(temp.path(), LockMode::Enforce);
        holder.lock(&LockClaim::new(["a"], ["b"]))?;

        let mut warn_only = manager(temp.path(), LockMode::WarnOnly);
        warn_only.lock(&LockClaim::new(["b"], ["a"]))?;
        assert_eq!(warn_only.created().count(), 0);

        let mut disabled = manager(temp.path(), LockMode::Disabled);
        disabled.lock(&LockClaim::new(["b"], ["a"]))?;
        disabled.unlock()?;
        assert_eq!(fs::read_dir(temp.path().join("locks"))?.count(), 2);
        Ok(())
    }

    #[test]
    fn cleanup_removes_foreign_locks() -> Result<()> {
        let temp = tempdir()?;
        let mut holder = manager(temp.path(), LockMode::Enforce);
        holder.lock(&LockClaim::new(["a"], ["b"]))?;

        let other = manager(temp.path(), LockMode::Enforce);
        other.cleanup_locks()?;
        assert!(!other.locked(&LockClaim::new(["b"], ["a"]))?);
        // The owner releasing afterwards is harmless.
        holder.unlock()?;
        Ok(())
    }
}
