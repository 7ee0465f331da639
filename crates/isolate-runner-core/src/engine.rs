//! QuickJS isolate creation and configuration.
//!
//! The [`Isolate`] is the sandboxing boundary of the runtime. It is:
//! - Owned by a single runner and never shared with another one
//! - Bounded by a memory ceiling fixed at creation
//! - Interruptible through a deadline checked by the engine's interrupt hook
//!
//! Dropping the last handle to an isolate (the isolate itself, or any
//! [`Context`] or [`CompiledModule`] created from it) releases the sandboxed
//! heap.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rquickjs::AsyncRuntime;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::resolver::{LinkTable, TableLoader, TableResolver};
use crate::{CompiledModule, Context, EventChannel};
use isolate_runner_common::{IsolateConfig, RuntimeError};

/// Heap-isolated JavaScript engine instance.
///
/// This struct wraps an `rquickjs` [`AsyncRuntime`] configured for running
/// untrusted code: a memory ceiling, an interrupt hook driven by evaluation
/// deadlines, and a module loader that only knows modules compiled through
/// this isolate.
///
/// Cloning an `Isolate` clones a handle; all clones refer to the same heap.
///
/// # Example
///
/// ```ignore
/// use isolate_runner_common::IsolateConfig;
/// use isolate_runner_core::Isolate;
///
/// let isolate = Isolate::new(&IsolateConfig::default()).await?;
/// let module = isolate.compile_module("export const answer = 42;").await?;
/// ```
#[derive(Clone)]
pub struct Isolate {
    inner: Arc<IsolateInner>,
}

struct IsolateInner {
    id: String,
    runtime: AsyncRuntime,
    config: IsolateConfig,
    links: Arc<LinkTable>,
    watchdog: Arc<Watchdog>,
}

impl Isolate {
    /// Create a new isolate with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The memory ceiling is zero
    /// - The engine runtime cannot be allocated
    #[instrument(skip(config), fields(memory_limit_mb = config.memory_limit_mb))]
    pub async fn new(config: &IsolateConfig) -> Result<Self, RuntimeError> {
        if config.memory_limit_mb == 0 {
            return Err(RuntimeError::invalid_config(
                "memory_limit_mb must be greater than zero",
            ));
        }

        let runtime = AsyncRuntime::new().map_err(|e| {
            RuntimeError::engine(format!("Failed to create QuickJS runtime: {e}"))
        })?;

        runtime.set_memory_limit(config.memory_limit_bytes()).await;

        if let Some(stack_kb) = config.max_stack_size_kb {
            runtime
                .set_max_stack_size((stack_kb as usize) * 1024)
                .await;
        }

        // The engine polls this hook periodically while guest code runs
        let watchdog = Arc::new(Watchdog::default());
        let hook = Arc::clone(&watchdog);
        runtime
            .set_interrupt_handler(Some(Box::new(move || hook.should_interrupt())))
            .await;

        let links = Arc::new(LinkTable::default());
        runtime
            .set_loader(
                TableResolver::new(Arc::clone(&links)),
                TableLoader::new(Arc::clone(&links)),
            )
            .await;

        let id = Uuid::new_v4().to_string();

        info!(
            isolate_id = %id,
            memory_limit_mb = config.memory_limit_mb,
            "Isolate created"
        );

        Ok(Self {
            inner: Arc::new(IsolateInner {
                id,
                runtime,
                config: config.clone(),
                links,
                watchdog,
            }),
        })
    }

    /// Create a new global-scope context inside this isolate.
    ///
    /// Events raised while evaluating modules in the context (completion,
    /// and anything host functions emit) are delivered on `events`.
    pub async fn create_context(&self, events: EventChannel) -> Result<Context, RuntimeError> {
        Context::new(self, events).await
    }

    /// Compile guest source into a module handle.
    ///
    /// The module is parsed but not linked; imports are only resolved when
    /// it is instantiated.
    pub async fn compile_module(&self, source: &str) -> Result<CompiledModule, RuntimeError> {
        CompiledModule::compile(self, source).await
    }

    /// Get the unique identifier of this isolate.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Get the isolate configuration.
    pub fn config(&self) -> &IsolateConfig {
        &self.inner.config
    }

    /// Bytes currently allocated on the isolate heap.
    pub async fn memory_used_bytes(&self) -> u64 {
        let usage = self.inner.runtime.memory_usage().await;
        u64::try_from(usage.memory_used_size).unwrap_or(0)
    }

    /// Returns `true` if both handles refer to the same isolate.
    pub fn same_isolate(&self, other: &Isolate) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn runtime(&self) -> &AsyncRuntime {
        &self.inner.runtime
    }

    pub(crate) fn links(&self) -> &Arc<LinkTable> {
        &self.inner.links
    }

    pub(crate) fn watchdog(&self) -> &Watchdog {
        &self.inner.watchdog
    }
}

impl Drop for IsolateInner {
    fn drop(&mut self) {
        debug!(isolate_id = %self.id, "Isolate disposed");
    }
}

impl std::fmt::Debug for Isolate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Isolate")
            .field("id", &self.inner.id)
            .field("memory_limit_mb", &self.inner.config.memory_limit_mb)
            .finish_non_exhaustive()
    }
}

/// Evaluation deadline polled by the engine's interrupt hook.
#[derive(Debug, Default)]
pub(crate) struct Watchdog {
    deadline: Mutex<Option<Instant>>,
    tripped: AtomicBool,
}

impl Watchdog {
    /// Start the clock for an evaluation.
    pub(crate) fn arm(&self, timeout: Duration) {
        self.tripped.store(false, Ordering::SeqCst);
        *self.deadline.lock() = Instant::now().checked_add(timeout);
    }

    pub(crate) fn disarm(&self) {
        *self.deadline.lock() = None;
    }

    /// Returns `true` once if the last armed deadline interrupted guest code.
    pub(crate) fn take_tripped(&self) -> bool {
        self.tripped.swap(false, Ordering::SeqCst)
    }

    fn should_interrupt(&self) -> bool {
        let Some(deadline) = *self.deadline.lock() else {
            return false;
        };

        if Instant::now() >= deadline {
            self.tripped.store(true, Ordering::SeqCst);
            return true;
        }

        false
    }
}
