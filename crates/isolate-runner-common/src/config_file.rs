//! Configuration file structures for the isolate-runner.
//!
//! [`ConfigFile`] is the TOML document the command-line driver loads at
//! startup.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.isolate]
/// memory_limit_mb = 128
/// format_module_path = "./js/format.js"
///
/// [runtime.execution]
/// timeout_ms = 10_000
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (isolate + execution settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        debug!(path = %path.as_ref().display(), "Config file loaded");
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.runtime.isolate.memory_limit_mb, 128);
        assert_eq!(config.runtime.execution.timeout_ms, 10_000);
    }

    #[test]
    fn test_parse_empty_config() {
        let config = ConfigFile::from_toml("").unwrap();
        assert_eq!(config.runtime.isolate.memory_limit_mb, 128);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [runtime.isolate]
            memory_limit_mb = 64
            max_stack_size_kb = 512
            format_module_path = "/opt/runner/format.js"

            [runtime.execution]
            timeout_ms = 2_500
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.runtime.isolate.memory_limit_mb, 64);
        assert_eq!(config.runtime.isolate.max_stack_size_kb, Some(512));
        assert_eq!(
            config.runtime.isolate.format_module_path.as_deref(),
            Some(Path::new("/opt/runner/format.js"))
        );
        assert_eq!(config.runtime.execution.timeout_ms, 2_500);
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(matches!(result, Err(ConfigFileError::Parse { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigFile::from_file("/nonexistent/isolate-runner.toml");
        assert!(matches!(result, Err(ConfigFileError::Io { .. })));
    }
}
