#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

//! Job-graph collaborator types consumed by the workflow persistence layer.
//!
//! Nothing in this crate touches the state directory; it only describes what
//! a job looks like from the outside: its rule, files, parameters and the
//! execution environment it declares.

pub mod file;
pub mod graph;
pub mod job;
pub mod params;

pub use file::{FileIdentity, LocalFile, CHECKSUM_SIZE_THRESHOLD};
pub use graph::{JobGraph, StaticGraph};
pub use job::{BodyConst, CondaEnv, Job, JobKey, Rule, RuleBody};
pub use params::{ParamValue, Table};
