use std::path::PathBuf;

pub(crate) const LOCK_CONFLICT: &str = "WF100";
pub(crate) const RECORD_CORRUPT: &str = "WF110";
pub(crate) const INVALID_STATE_DIR: &str = "WF120";

/// Errors callers may want to match on. Everything else surfaces as a plain
/// `anyhow::Error` wrapping the underlying I/O failure.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error(
        "[WF100] directory cannot be locked: {path} is claimed by another run. \
         Another instance may be running on this directory, or a previous run \
         exited unexpectedly"
    )]
    LockConflict { path: String },
    #[error("[WF110] record {path} is not valid JSON")]
    RecordCorrupt { path: PathBuf },
    #[error("[WF120] state directory {path} exists but is not a directory")]
    InvalidStateDir { path: PathBuf },
}

impl PersistenceError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::LockConflict { .. } => LOCK_CONFLICT,
            Self::RecordCorrupt { .. } => RECORD_CORRUPT,
            Self::InvalidStateDir { .. } => INVALID_STATE_DIR,
        }
    }
}
