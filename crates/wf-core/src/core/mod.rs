//! Internal implementation modules for `wf-core`.
//!
//! Callers go through the re-exports in the crate root.

pub mod config;
pub(crate) mod fs;
pub mod persistence;
