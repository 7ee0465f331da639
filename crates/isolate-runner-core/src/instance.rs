//! Timed evaluation of instantiated modules.
//!
//! This module runs a module body under two limits:
//!
//! 1. A wall-clock deadline enforced by the isolate's interrupt hook, which
//!    stops synchronous guest loops
//! 2. A tokio timeout around the whole evaluation, which stops guests
//!    waiting on promises that never settle
//!
//! Failures are classified into timeout, memory, link and exception errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::Context;
use crate::context::{FailureKind, GuestFailure};
use isolate_runner_common::{ExecutionConfig, IsolateConfig, RuntimeError};

/// Result of evaluating a module.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Engine-level name of the evaluated module.
    pub module: String,

    /// Execution metrics.
    pub metrics: ExecutionMetrics,
}

/// Execution performance metrics.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
    /// Wall-clock time spent evaluating.
    pub duration: Duration,

    /// Isolate heap usage after evaluation, in bytes.
    pub memory_used_bytes: u64,
}

pub(crate) async fn evaluate_module(
    context: &Context,
    name: &str,
    source: &Arc<str>,
    options: &ExecutionConfig,
) -> Result<ExecutionResult, RuntimeError> {
    let start = Instant::now();
    let isolate = context.isolate();
    let timeout = options.timeout();

    debug!("Evaluating module");

    let watchdog = isolate.watchdog();
    watchdog.arm(timeout);
    let outcome = tokio::time::timeout(
        timeout,
        context.run_module(name.to_string(), source.to_string()),
    )
    .await;
    watchdog.disarm();
    let interrupted = watchdog.take_tripped();

    let duration = start.elapsed();

    let failure = match outcome {
        Ok(Ok(())) => None,
        Err(_elapsed) => Some(RuntimeError::ExecutionTimeout {
            duration_ms: options.timeout_ms,
        }),
        Ok(Err(failure)) => {
            let heap_used_bytes = isolate.memory_used_bytes().await;
            Some(classify_failure(
                failure,
                interrupted,
                heap_used_bytes,
                options,
                isolate.config(),
            ))
        }
    };

    if let Some(err) = failure {
        if err.is_resource_limit() {
            warn!(
                duration_ms = duration.as_millis(),
                error = %err,
                "Evaluation terminated: resource limit"
            );
        } else {
            error!(
                duration_ms = duration.as_millis(),
                error = %err,
                "Evaluation threw"
            );
        }
        return Err(err);
    }

    let memory_used_bytes = isolate.memory_used_bytes().await;

    info!(
        duration_ms = duration.as_millis(),
        memory_used_bytes = memory_used_bytes,
        "Evaluation completed successfully"
    );

    Ok(ExecutionResult {
        module: name.to_string(),
        metrics: ExecutionMetrics {
            duration,
            memory_used_bytes,
        },
    })
}

/// Map a guest failure onto a runtime error.
///
/// A thrown `null` only counts as memory exhaustion when the heap is at
/// least half full, so guests that `throw null` themselves still get an
/// exception.
fn classify_failure(
    failure: GuestFailure,
    interrupted: bool,
    heap_used_bytes: u64,
    options: &ExecutionConfig,
    config: &IsolateConfig,
) -> RuntimeError {
    if interrupted {
        return RuntimeError::ExecutionTimeout {
            duration_ms: options.timeout_ms,
        };
    }

    let limit_bytes = u64::try_from(config.memory_limit_bytes()).unwrap_or(u64::MAX);
    let out_of_memory = match failure.kind {
        FailureKind::Allocation => true,
        FailureKind::Null => heap_used_bytes.saturating_mul(2) >= limit_bytes,
        FailureKind::Thrown => is_out_of_memory(&failure.message),
    };

    if out_of_memory {
        return RuntimeError::MemoryLimitExceeded {
            limit_mb: config.memory_limit_mb,
        };
    }

    // Import bindings are checked when the engine links right before running
    // the body; a failure there means no guest code ran.
    if is_link_failure(&failure.message) {
        return RuntimeError::instantiation_failed(failure.message);
    }

    RuntimeError::exception(failure.message)
}

/// Check if a rendered failure came from the heap ceiling.
fn is_out_of_memory(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("out of memory") || message.contains("allocation failed")
}

/// Check if a rendered failure is an unresolvable import binding.
fn is_link_failure(message: &str) -> bool {
    message.contains("Could not find export")
        || message.contains("circular reference when looking for export")
        || (message.contains("export '") && message.contains("is ambiguous"))
}
