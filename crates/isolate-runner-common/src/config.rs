//! Configuration structures for the isolate-runner.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`IsolateConfig`]: Isolate settings (memory ceiling, stack, companion modules)
//! - [`ExecutionConfig`]: Per-evaluation limits (timeout)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Memory ceiling applied to every isolate unless configured otherwise.
pub const DEFAULT_MEMORY_LIMIT_MB: u32 = 128;

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for the isolate-runner.
/// It can be loaded from TOML or JSON.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Isolate configuration.
    #[serde(default)]
    pub isolate: IsolateConfig,

    /// Per-evaluation configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Isolate configuration.
///
/// These settings are applied once, when the isolate is created, and cannot
/// change afterwards.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IsolateConfig {
    /// Heap ceiling for the isolate in megabytes.
    ///
    /// Guest allocations beyond this fail with a memory-limit error instead
    /// of exhausting host memory.
    #[serde(default = "defaults::memory_limit_mb")]
    pub memory_limit_mb: u32,

    /// Maximum guest stack size in kilobytes.
    ///
    /// When unset the engine default is kept.
    #[serde(default)]
    pub max_stack_size_kb: Option<u32>,

    /// Location of the companion `format` module source.
    ///
    /// When unset the file bundled next to the runner crate is used.
    #[serde(default)]
    pub format_module_path: Option<PathBuf>,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: defaults::memory_limit_mb(),
            max_stack_size_kb: None,
            format_module_path: None,
        }
    }
}

impl IsolateConfig {
    /// Get the memory ceiling in bytes.
    pub fn memory_limit_bytes(&self) -> usize {
        (self.memory_limit_mb as usize) * 1024 * 1024
    }
}

/// Per-evaluation configuration.
///
/// Passed by the caller when it evaluates a module; the runner itself never
/// decides how long guest code may run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Evaluation timeout in milliseconds.
    ///
    /// This is a hard limit: the evaluation is aborted once it elapses.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::timeout_ms(),
        }
    }
}

impl ExecutionConfig {
    /// Create an execution configuration with the given timeout.
    pub const fn with_timeout_ms(timeout_ms: u64) -> Self {
        Self { timeout_ms }
    }

    /// Get the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn memory_limit_mb() -> u32 {
        super::DEFAULT_MEMORY_LIMIT_MB
    }

    pub const fn timeout_ms() -> u64 {
        10_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert_eq!(config.isolate.memory_limit_mb, 128);
        assert_eq!(config.isolate.memory_limit_bytes(), 128 * 1024 * 1024);
        assert!(config.isolate.max_stack_size_kb.is_none());
        assert!(config.isolate.format_module_path.is_none());
        assert_eq!(config.execution.timeout_ms, 10_000);
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(
            config.isolate.memory_limit_mb,
            deserialized.isolate.memory_limit_mb
        );
        assert_eq!(config.execution.timeout_ms, deserialized.execution.timeout_ms);
    }

    #[test]
    fn test_execution_timeout() {
        let config = ExecutionConfig::with_timeout_ms(500);
        assert_eq!(config.timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"isolate": {"max_stack_size_kb": 512}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        // Explicitly set value
        assert_eq!(config.isolate.max_stack_size_kb, Some(512));
        // Default values for unspecified fields
        assert_eq!(config.isolate.memory_limit_mb, 128);
        assert_eq!(config.execution.timeout_ms, 10_000);
    }
}
