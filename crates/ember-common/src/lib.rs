//! Common types for the Ember tensor runtime
//!
//! This crate holds the foundational pieces every other Ember crate builds
//! on: element data types, device classes, the error taxonomy, and engine
//! configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::{ConfigError, EngineConfig, TuningConfig, TuningPolicy};
pub use error::*;
pub use types::*;
