//! Global-scope contexts inside an isolate.
//!
//! A [`Context`] is one JavaScript realm: its own global object, its own
//! module map, and the event channel its modules and host functions report
//! through.

use std::sync::Arc;

use rquickjs::markers::ParallelSend;
use rquickjs::{AsyncContext, CatchResultExt, CaughtError, Ctx, Module, async_with};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{EventChannel, Isolate};
use isolate_runner_common::RuntimeError;

/// A realm inside an [`Isolate`].
///
/// Cloning a `Context` clones a handle; all clones share one global object.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: String,
    js: AsyncContext,
    isolate: Isolate,
    events: EventChannel,
}

impl Context {
    #[instrument(skip_all, fields(isolate_id = %isolate.id()))]
    pub(crate) async fn new(isolate: &Isolate, events: EventChannel) -> Result<Self, RuntimeError> {
        let js = AsyncContext::full(isolate.runtime())
            .await
            .map_err(|e| RuntimeError::engine(format!("Failed to create context: {e}")))?;

        let id = Uuid::new_v4().to_string();
        debug!(context_id = %id, "Context created");

        Ok(Self {
            inner: Arc::new(ContextInner {
                id,
                js,
                isolate: isolate.clone(),
                events,
            }),
        })
    }

    /// Get the unique identifier of this context.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Get the isolate this context lives in.
    pub fn isolate(&self) -> &Isolate {
        &self.inner.isolate
    }

    /// Get the channel events raised in this context are delivered on.
    pub fn events(&self) -> &EventChannel {
        &self.inner.events
    }

    /// Run `f` with exclusive access to the engine, scoped to this context.
    ///
    /// Used by host code to install globals and inspect guest state.
    pub async fn with<F, R>(&self, f: F) -> R
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R + ParallelSend,
        R: ParallelSend,
    {
        self.inner.js.with(f).await
    }

    /// Declare, link and run a module body to completion, including any
    /// top-level await. Failures come back rendered with their stack.
    pub(crate) async fn run_module(&self, name: String, source: String) -> Result<(), GuestFailure> {
        async_with!(self.inner.js => |ctx| {
            let outcome = match Module::declare(ctx.clone(), name, source)
                .and_then(|declared| declared.eval())
            {
                Ok((_, promise)) => promise.into_future::<()>().await,
                Err(err) => Err(err),
            };

            outcome.catch(&ctx).map_err(|err| GuestFailure::from_caught(&err))
        })
        .await
    }
}

/// What the engine raised when a module run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureKind {
    /// An `Error` instance, another thrown value, or an engine error.
    Thrown,
    /// A bare `null`. QuickJS raises this when it cannot allocate the
    /// exception object itself.
    Null,
    /// The engine reported an allocation failure.
    Allocation,
}

/// A failed module run, rendered for the host.
#[derive(Debug, Clone)]
pub(crate) struct GuestFailure {
    pub(crate) kind: FailureKind,
    pub(crate) message: String,
}

impl GuestFailure {
    fn from_caught(err: &CaughtError<'_>) -> Self {
        let kind = match err {
            CaughtError::Error(rquickjs::Error::Allocation) => FailureKind::Allocation,
            CaughtError::Value(value) if value.is_null() => FailureKind::Null,
            _ => FailureKind::Thrown,
        };

        Self {
            kind,
            message: err.to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn thrown(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Thrown,
            message: message.into(),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("isolate_id", &self.inner.isolate.id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isolate_runner_common::IsolateConfig;

    #[tokio::test]
    async fn test_contexts_have_separate_globals() {
        let isolate = Isolate::new(&IsolateConfig::default()).await.unwrap();
        let a = isolate.create_context(EventChannel::new()).await.unwrap();
        let b = isolate.create_context(EventChannel::new()).await.unwrap();

        a.with(|ctx| ctx.globals().set("marker", 7)).await.unwrap();

        let in_a: Option<i32> = a.with(|ctx| ctx.globals().get("marker")).await.unwrap();
        let in_b: Option<i32> = b.with(|ctx| ctx.globals().get("marker")).await.unwrap();

        assert_eq!(in_a, Some(7));
        assert_eq!(in_b, None);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_run_module_reports_exception() {
        let isolate = Isolate::new(&IsolateConfig::default()).await.unwrap();
        let context = isolate.create_context(EventChannel::new()).await.unwrap();

        let err = context
            .run_module("module-throw".into(), r#"throw new Error("boom");"#.into())
            .await
            .unwrap_err();

        assert_eq!(err.kind, FailureKind::Thrown);
        assert!(err.message.contains("boom"));
    }

    #[tokio::test]
    async fn test_run_module_reports_thrown_null() {
        let isolate = Isolate::new(&IsolateConfig::default()).await.unwrap();
        let context = isolate.create_context(EventChannel::new()).await.unwrap();

        let err = context
            .run_module("module-null".into(), "throw null;".into())
            .await
            .unwrap_err();

        assert_eq!(err.kind, FailureKind::Null);
    }

    #[tokio::test]
    async fn test_run_module_awaits_top_level() {
        let isolate = Isolate::new(&IsolateConfig::default()).await.unwrap();
        let context = isolate.create_context(EventChannel::new()).await.unwrap();

        context
            .run_module(
                "module-await".into(),
                "globalThis.done = await Promise.resolve(true);".into(),
            )
            .await
            .unwrap();

        let done: bool = context.with(|ctx| ctx.globals().get("done")).await.unwrap();
        assert!(done);
    }

    #[tokio::test]
    async fn test_context_debug() {
        let isolate = Isolate::new(&IsolateConfig::default()).await.unwrap();
        let context = isolate.create_context(EventChannel::new()).await.unwrap();

        let debug_str = format!("{context:?}");
        assert!(debug_str.contains("Context"));
        assert!(debug_str.contains(isolate.id()));
    }
}
