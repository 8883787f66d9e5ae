use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dirs_next::home_dir;

pub(crate) const STATE_DIR_ENV: &str = "WF_STATE_DIR";
pub(crate) const NOLOCK_ENV: &str = "WF_NOLOCK";
pub(crate) const LOCK_WARN_ONLY_ENV: &str = "WF_LOCK_WARN_ONLY";
pub(crate) const CONDA_PREFIX_ENV: &str = "WF_CONDA_PREFIX";
pub(crate) const SINGULARITY_PREFIX_ENV: &str = "WF_SINGULARITY_PREFIX";
pub(crate) const SHADOW_PREFIX_ENV: &str = "WF_SHADOW_PREFIX";
pub(crate) const NO_READ_CACHE_ENV: &str = "WF_NO_READ_CACHE";
pub(crate) const DEFAULT_STATE_DIR: &str = ".wf";

/// Captured process environment, so configuration can be built and tested
/// without touching the real environment.
#[derive(Debug, Clone)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    #[must_use]
    pub fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    #[must_use]
    pub fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }

    pub(crate) fn flag_is_enabled(&self, key: &str) -> bool {
        matches!(self.vars.get(key).map(String::as_str), Some("1"))
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }
}

/// How a run claims the working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Conflicts abort the run; lock files are written and removed.
    #[default]
    Enforce,
    /// Conflicts are logged; no lock files are ever written.
    WarnOnly,
    /// Locking is skipped entirely.
    Disabled,
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub(crate) state_dir: PathBuf,
    pub(crate) lock_mode: LockMode,
    pub(crate) conda_prefix: Option<PathBuf>,
    pub(crate) singularity_prefix: Option<PathBuf>,
    pub(crate) shadow_prefix: Option<PathBuf>,
    pub(crate) read_cache: bool,
}

impl PersistenceConfig {
    /// Configuration rooted at `state_dir` with all defaults.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            lock_mode: LockMode::default(),
            conda_prefix: None,
            singularity_prefix: None,
            shadow_prefix: None,
            read_cache: true,
        }
    }

    /// Builds a configuration from the current process environment.
    ///
    /// # Errors
    /// Returns an error if the working directory cannot be resolved.
    pub fn from_env() -> Result<Self> {
        let cwd = env::current_dir().context("failed to resolve the working directory")?;
        Ok(Self::from_snapshot(&EnvSnapshot::capture(), &cwd))
    }

    /// Builds a configuration from a captured environment. Relative paths are
    /// resolved against `cwd`.
    #[must_use]
    pub fn from_snapshot(snapshot: &EnvSnapshot, cwd: &Path) -> Self {
        let resolve = |raw: &str| {
            let path = expand_tilde(raw);
            if path.is_absolute() {
                path
            } else {
                cwd.join(path)
            }
        };
        let lock_mode = if snapshot.flag_is_enabled(NOLOCK_ENV) {
            LockMode::Disabled
        } else if snapshot.flag_is_enabled(LOCK_WARN_ONLY_ENV) {
            LockMode::WarnOnly
        } else {
            LockMode::Enforce
        };
        Self {
            state_dir: snapshot
                .var(STATE_DIR_ENV)
                .map_or_else(|| cwd.join(DEFAULT_STATE_DIR), resolve),
            lock_mode,
            conda_prefix: snapshot.var(CONDA_PREFIX_ENV).map(resolve),
            singularity_prefix: snapshot.var(SINGULARITY_PREFIX_ENV).map(resolve),
            shadow_prefix: snapshot.var(SHADOW_PREFIX_ENV).map(resolve),
            read_cache: !snapshot.flag_is_enabled(NO_READ_CACHE_ENV),
        }
    }

    #[must_use]
    pub fn with_lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    #[must_use]
    pub fn with_conda_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.conda_prefix = Some(prefix.into());
        self
    }

    #[must_use]
    pub fn with_singularity_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.singularity_prefix = Some(prefix.into());
        self
    }

    #[must_use]
    pub fn with_shadow_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.shadow_prefix = Some(prefix.into());
        self
    }

    #[must_use]
    pub fn with_read_cache(mut self, enabled: bool) -> Self {
        self.read_cache = enabled;
        self
    }

    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    #[must_use]
    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }
}

fn expand_tilde(raw: &str) -> PathBuf {
    if raw == "~" {
        if let Some(home) = home_dir() {
            return home;
        }
    } else if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}
