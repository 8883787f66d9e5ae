//! Configuration for a persistence instance.

pub mod settings;

pub use settings::*;
