#![deny(clippy::all, warnings)]

//! Persistence and rebuild-decision layer for workflow runs.
//!
//! A [`Persistence`] owns one state directory and records, per output file,
//! why it was produced. The engine asks it whether outputs are incomplete or
//! changed, marks jobs started and finished, and guards the whole run with
//! advisory lock files.

mod core;

pub use crate::core::config::{EnvSnapshot, LockMode, PersistenceConfig};
pub use crate::core::persistence::{
    select_param_serializer, BuiltinParamSerializer, Change, ChangedOutputs, ContainerCleanup,
    LockClaim, LockManager, LockType, MetadataRecord, ParamSerializer, Persistence,
    PersistenceError, Record, RecordPathCodec, RecordStore, Subject, DEFAULT_MAX_FILENAME_LEN,
    MIGRATION_MARKER,
};
#[cfg(feature = "tabular")]
pub use crate::core::persistence::TabularParamSerializer;
