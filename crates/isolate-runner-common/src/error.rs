//! Error types for the isolate-runner.
//!
//! [`RuntimeError`] covers every failure in the lifecycle of a sandboxed
//! script: isolate setup, module compilation, import resolution,
//! instantiation and evaluation.

use std::io;

use thiserror::Error;

/// Top-level runtime errors.
///
/// Setup failures (`Engine`, `CompilationFailed`, `ModuleNotFound`,
/// `InstantiationFailed`, `ModuleSource`) are reported by the runner through
/// its error event. Evaluation failures (`Exception`, `ExecutionTimeout`,
/// `MemoryLimitExceeded`) are returned to whoever requested the evaluation.
/// An import binding with no matching export is only detected when the
/// module graph is linked for evaluation, so it is returned from evaluation
/// as `InstantiationFailed`.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A guest import specifier has no entry in the resolver table.
    #[error("module not found: {specifier}")]
    ModuleNotFound {
        /// The specifier the guest tried to import.
        specifier: String,
    },

    /// Guest source failed to compile.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// Linking a module against its context failed.
    #[error("Instantiation failed: {reason}")]
    InstantiationFailed {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// Evaluation exceeded the configured timeout and was aborted.
    #[error("Execution timeout after {duration_ms}ms")]
    ExecutionTimeout {
        /// The timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// Guest allocations exceeded the isolate memory ceiling.
    #[error("Memory limit exceeded: {limit_mb}MB")]
    MemoryLimitExceeded {
        /// The memory limit in megabytes.
        limit_mb: u32,
    },

    /// Guest code threw during evaluation.
    #[error("Uncaught exception: {message}")]
    Exception {
        /// Rendered exception, including the stack when available.
        message: String,
    },

    /// A module source file could not be read.
    #[error("Failed to read module source '{path}': {source}")]
    ModuleSource {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The execution engine rejected an operation.
    #[error("Engine error: {reason}")]
    Engine {
        /// Description of the engine failure.
        reason: String,
    },

    /// An operation was requested in a lifecycle state that forbids it.
    #[error("Invalid state: {reason}")]
    InvalidState {
        /// Description of the state violation.
        reason: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

impl RuntimeError {
    /// Create a new `ModuleNotFound` error.
    pub fn module_not_found(specifier: impl Into<String>) -> Self {
        Self::ModuleNotFound {
            specifier: specifier.into(),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InstantiationFailed` error.
    pub fn instantiation_failed(reason: impl Into<String>) -> Self {
        Self::InstantiationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `Exception` error.
    pub fn exception(message: impl Into<String>) -> Self {
        Self::Exception {
            message: message.into(),
        }
    }

    /// Create a new `ModuleSource` error.
    pub fn module_source(path: impl Into<String>, source: io::Error) -> Self {
        Self::ModuleSource {
            path: path.into(),
            source,
        }
    }

    /// Create a new `Engine` error.
    pub fn engine(reason: impl Into<String>) -> Self {
        Self::Engine {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidState` error.
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error indicates an import could not be resolved.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ModuleNotFound { .. })
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            Self::MemoryLimitExceeded { .. } | Self::ExecutionTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::module_not_found("nope");
        assert_eq!(err.to_string(), "module not found: nope");

        let err = RuntimeError::ExecutionTimeout { duration_ms: 250 };
        assert_eq!(err.to_string(), "Execution timeout after 250ms");

        let err = RuntimeError::MemoryLimitExceeded { limit_mb: 128 };
        assert_eq!(err.to_string(), "Memory limit exceeded: 128MB");
    }

    #[test]
    fn test_module_source_keeps_io_source() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err = RuntimeError::module_source("js/format.js", io_err);

        assert!(err.to_string().contains("js/format.js"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_is_resource_limit() {
        assert!(RuntimeError::MemoryLimitExceeded { limit_mb: 128 }.is_resource_limit());
        assert!(RuntimeError::ExecutionTimeout { duration_ms: 100 }.is_resource_limit());
        assert!(!RuntimeError::module_not_found("test").is_resource_limit());
        assert!(!RuntimeError::exception("boom").is_resource_limit());
    }

    #[test]
    fn test_is_not_found() {
        assert!(RuntimeError::module_not_found("test").is_not_found());
        assert!(!RuntimeError::compilation_failed("bad token").is_not_found());
    }
}
