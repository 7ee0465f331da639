//! Guest module compilation, linking and evaluation.
//!
//! This module provides [`CompiledModule`], a handle to ES module source that
//! has been checked by the engine and registered with an [`Isolate`].
//!
//! # Lifecycle
//!
//! ```text
//! Compiled ──instantiate──► Linking ──► Instantiated ──evaluate──► Evaluating ──► Evaluated
//!                              │                                       │
//!                              └──────────────► Errored ◄──────────────┘
//! ```
//!
//! Each transition happens at most once: a module is linked into exactly
//! one context and evaluated there at most once.

use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rquickjs::{AsyncContext, CatchResultExt, Module};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::instance::{self, ExecutionResult};
use crate::resolver::PROBE_PREFIX;
use crate::{Context, Isolate, ModuleResolver, RunnerEvent};
use isolate_runner_common::{ExecutionConfig, RuntimeError};

/// A compiled guest module.
///
/// Cloning a `CompiledModule` clones a handle; lifecycle state is shared by
/// all clones. A handle keeps its isolate alive.
#[derive(Clone)]
pub struct CompiledModule {
    inner: Arc<ModuleInner>,
}

struct ModuleInner {
    /// Engine-level module name, unique within the isolate.
    name: String,

    /// Hash of the original source text.
    content_hash: String,

    source: Arc<str>,

    /// When this module was compiled.
    compiled_at: Instant,

    isolate: Isolate,

    state: Mutex<ModuleState>,
}

enum ModuleState {
    Compiled,
    Linking,
    Instantiated(Context),
    Evaluating,
    Evaluated,
    Errored,
}

impl ModuleState {
    fn status(&self) -> ModuleStatus {
        match self {
            Self::Compiled => ModuleStatus::Compiled,
            Self::Linking => ModuleStatus::Linking,
            Self::Instantiated(_) => ModuleStatus::Instantiated,
            Self::Evaluating => ModuleStatus::Evaluating,
            Self::Evaluated => ModuleStatus::Evaluated,
            Self::Errored => ModuleStatus::Errored,
        }
    }
}

/// Observable lifecycle stage of a [`CompiledModule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    Compiled,
    Linking,
    Instantiated,
    Evaluating,
    Evaluated,
    Errored,
}

impl std::fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Compiled => "compiled",
            Self::Linking => "linking",
            Self::Instantiated => "instantiated",
            Self::Evaluating => "evaluating",
            Self::Evaluated => "evaluated",
            Self::Errored => "errored",
        };
        write!(f, "{s}")
    }
}

impl CompiledModule {
    /// Compile ES module source inside `isolate`.
    ///
    /// The source is parsed in a scratch context whose imports all resolve
    /// to empty placeholders, so syntax errors surface here while import
    /// errors wait for [`instantiate`](Self::instantiate).
    #[instrument(skip(isolate, source), fields(bytes_len = source.len()))]
    pub(crate) async fn compile(isolate: &Isolate, source: &str) -> Result<Self, RuntimeError> {
        let start = Instant::now();
        let name = format!("module-{}", Uuid::new_v4());
        let source: Arc<str> = Arc::from(source);

        Self::check_syntax(isolate, &name, &source).await?;
        isolate.links().add_source(&name, Arc::clone(&source));

        let content_hash = compute_hash(source.as_bytes());
        let duration = start.elapsed();

        info!(
            module = %name,
            content_hash = %content_hash,
            duration_ms = duration.as_millis(),
            "Module compiled"
        );

        Ok(Self {
            inner: Arc::new(ModuleInner {
                name,
                content_hash,
                source,
                compiled_at: Instant::now(),
                isolate: isolate.clone(),
                state: Mutex::new(ModuleState::Compiled),
            }),
        })
    }

    async fn check_syntax(isolate: &Isolate, name: &str, source: &str) -> Result<(), RuntimeError> {
        let scratch = AsyncContext::full(isolate.runtime()).await.map_err(|e| {
            RuntimeError::engine(format!("Failed to create compilation context: {e}"))
        })?;

        let probe = format!("{PROBE_PREFIX}{name}");
        let source = source.to_string();

        scratch
            .with(move |ctx| {
                Module::declare(ctx.clone(), probe, source)
                    .map(|_| ())
                    .catch(&ctx)
                    .map_err(|err| RuntimeError::compilation_failed(err.to_string()))
            })
            .await
    }

    /// Link this module into `context`, resolving its imports through
    /// `resolver`.
    ///
    /// The resolver table is registered before the returned future is first
    /// polled, so several modules that import each other can be instantiated
    /// concurrently.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The module was already instantiated
    /// - The context or a resolver entry belongs to another isolate
    /// - An import specifier has no resolver entry
    ///   ([`RuntimeError::ModuleNotFound`])
    /// - Linking fails for any other reason
    pub fn instantiate(
        &self,
        context: &Context,
        resolver: ModuleResolver,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send + 'static {
        let prepared = self.begin_link(context, &resolver);
        let module = self.clone();
        let context = context.clone();

        async move {
            prepared?;
            let outcome = module.link(&context).await;
            module.finish_link(&context, outcome.is_ok());
            outcome
        }
    }

    fn begin_link(&self, context: &Context, resolver: &ModuleResolver) -> Result<(), RuntimeError> {
        let isolate = &self.inner.isolate;

        if !isolate.same_isolate(context.isolate()) {
            return Err(RuntimeError::invalid_state(
                "context belongs to a different isolate",
            ));
        }

        if let Some((specifier, _)) = resolver
            .entries()
            .find(|(_, target)| !isolate.same_isolate(&target.inner.isolate))
        {
            return Err(RuntimeError::invalid_state(format!(
                "module for '{specifier}' belongs to a different isolate"
            )));
        }

        {
            let mut state = self.inner.state.lock();
            if !matches!(*state, ModuleState::Compiled) {
                return Err(RuntimeError::invalid_state(format!(
                    "module {} is already {}",
                    self.inner.name,
                    state.status()
                )));
            }
            *state = ModuleState::Linking;
        }

        let table = resolver
            .entries()
            .map(|(specifier, target)| (specifier.to_string(), target.inner.name.clone()))
            .collect();
        isolate.links().register_imports(&self.inner.name, table);

        Ok(())
    }

    #[instrument(skip_all, fields(module = %self.inner.name))]
    async fn link(&self, context: &Context) -> Result<(), RuntimeError> {
        let start = Instant::now();
        let name = self.inner.name.clone();
        let source = self.inner.source.to_string();
        let links = Arc::clone(self.inner.isolate.links());

        context
            .with(move |ctx| {
                links.take_unresolved();

                Module::declare(ctx.clone(), name, source)
                    .map(|_| ())
                    .catch(&ctx)
                    .map_err(|err| match links.take_unresolved() {
                        Some(specifier) => RuntimeError::module_not_found(specifier),
                        None => RuntimeError::instantiation_failed(err.to_string()),
                    })
            })
            .await?;

        debug!(
            duration_us = start.elapsed().as_micros(),
            "Module instantiated"
        );

        Ok(())
    }

    fn finish_link(&self, context: &Context, linked: bool) {
        *self.inner.state.lock() = if linked {
            ModuleState::Instantiated(context.clone())
        } else {
            ModuleState::Errored
        };
    }

    /// Run the module body in the context it was instantiated into.
    ///
    /// On success an [`RunnerEvent::Exit`] is emitted on the context's event
    /// channel. Failures are only returned to the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The module is not instantiated, or was already evaluated
    /// - Evaluation exceeds `options.timeout_ms`
    /// - Guest allocations exceed the isolate memory ceiling
    /// - Guest code throws
    #[instrument(skip(self, options), fields(module = %self.inner.name, timeout_ms = options.timeout_ms))]
    pub async fn evaluate(&self, options: &ExecutionConfig) -> Result<ExecutionResult, RuntimeError> {
        let context = self.begin_evaluation()?;

        let outcome =
            instance::evaluate_module(&context, &self.inner.name, &self.inner.source, options).await;

        *self.inner.state.lock() = if outcome.is_ok() {
            ModuleState::Evaluated
        } else {
            ModuleState::Errored
        };

        if let Ok(result) = &outcome {
            context.events().emit(RunnerEvent::Exit(result.clone()));
        }

        outcome
    }

    fn begin_evaluation(&self) -> Result<Context, RuntimeError> {
        let mut state = self.inner.state.lock();

        match std::mem::replace(&mut *state, ModuleState::Evaluating) {
            ModuleState::Instantiated(context) => Ok(context),
            previous => {
                let status = previous.status();
                *state = previous;
                Err(RuntimeError::invalid_state(format!(
                    "module {} cannot be evaluated while {status}",
                    self.inner.name
                )))
            }
        }
    }

    /// Get the engine-level module name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the content hash of the original source.
    pub fn content_hash(&self) -> &str {
        &self.inner.content_hash
    }

    /// Get the original source text.
    pub fn source(&self) -> &str {
        &self.inner.source
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.inner.compiled_at
    }

    /// Get the isolate this module was compiled in.
    pub fn isolate(&self) -> &Isolate {
        &self.inner.isolate
    }

    /// Get the current lifecycle stage.
    pub fn status(&self) -> ModuleStatus {
        self.inner.state.lock().status()
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("name", &self.inner.name)
            .field("content_hash", &self.inner.content_hash)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
