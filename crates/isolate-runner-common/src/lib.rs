//! Common types, errors, and configuration for isolate-runner.
//!
//! This crate provides shared functionality used across the isolate-runner workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for isolate and execution settings
//! - The TOML configuration file format used by the driver

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{DEFAULT_MEMORY_LIMIT_MB, ExecutionConfig, IsolateConfig, RuntimeConfig};
pub use config_file::{ConfigFile, ConfigFileError};
pub use error::RuntimeError;
