//! The isolate runner.
//!
//! [`IsolateRunner`] owns one isolate for one untrusted script. Construction
//! starts setup in the background:
//!
//! 1. Concurrently: create the context and install the host bridge, compile
//!    the script as the *main* module, read and compile the *format* module
//! 2. Concurrently: instantiate main with `{"format": format}` and format
//!    with an empty resolver
//! 3. Emit `ready` with the main module, or `error` with the first failure
//!
//! Evaluation is left to the caller, who decides the timeout:
//!
//! ```ignore
//! let runner = IsolateRunner::new(r#"stdout("Hello, World!");"#);
//! let log = OutputLog::attach(runner.events());
//!
//! let main = runner.ready().await?;
//! main.evaluate(&ExecutionConfig::with_timeout_ms(10_000)).await?;
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::HostBridge;
use isolate_runner_common::{RuntimeConfig, RuntimeError};
use isolate_runner_core::{
    CompiledModule, Context, EventChannel, EventKind, ExecutionResult, Isolate, ListenerId,
    ModuleResolver, Once, RunnerEvent, create_resolver,
};

/// Specifier under which guest scripts import the companion module.
pub const FORMAT_SPECIFIER: &str = "format";

/// Companion module bundled with this crate.
pub const DEFAULT_FORMAT_MODULE_PATH: &str =
    concat!(env!("CARGO_MANIFEST_DIR"), "/js/format.js");

type SetupOutcome = Result<CompiledModule, Arc<RuntimeError>>;
type StateSlot = Arc<watch::Sender<Option<SetupOutcome>>>;

/// Lifecycle of a runner's setup.
#[derive(Debug, Clone)]
pub enum RunnerState {
    /// Setup is still running.
    Created,
    /// Setup succeeded; carries the instantiated main module.
    Ready(CompiledModule),
    /// Setup failed; carries the first error.
    Failed(Arc<RuntimeError>),
}

impl RunnerState {
    pub fn is_ready(&self) -> bool {
        matches!(self, RunnerState::Ready(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RunnerState::Failed(_))
    }
}

/// Runs one untrusted script in its own memory-bounded isolate.
///
/// # Events
///
/// | Event    | Payload           | When                                      |
/// |----------|-------------------|-------------------------------------------|
/// | `ready`  | main module       | once, after setup succeeds                |
/// | `error`  | `RuntimeError`    | once, after setup fails                   |
/// | `stdout` | text              | each guest `stdout(...)` call             |
/// | `stderr` | text              | each guest `stderr(...)` call             |
/// | `exit`   | `ExecutionResult` | after the main module evaluates cleanly   |
///
/// Exactly one of `ready` and `error` fires. Listeners only see events
/// emitted after they subscribe; [`state`](Self::state) and
/// [`ready`](Self::ready) report the outcome regardless of timing.
pub struct IsolateRunner {
    id: String,
    source: Arc<str>,
    events: EventChannel,
    state: StateSlot,
    setup: Mutex<Option<JoinHandle<()>>>,
}

impl IsolateRunner {
    /// Create a runner for `source` with the default configuration.
    ///
    /// Setup starts immediately on the current tokio runtime.
    pub fn new(source: impl Into<String>) -> Self {
        Self::with_config(source, RuntimeConfig::default())
    }

    /// Create a runner for `source` with `config`.
    ///
    /// Called outside a tokio runtime, the runner starts out
    /// [`Failed`](RunnerState::Failed).
    pub fn with_config(source: impl Into<String>, config: RuntimeConfig) -> Self {
        let id = Uuid::new_v4().to_string();
        let source: Arc<str> = Arc::from(source.into());
        let events = EventChannel::new();
        let (state, _) = watch::channel::<Option<SetupOutcome>>(None);
        let state = Arc::new(state);

        let setup = match Handle::try_current() {
            Ok(handle) => {
                let task = Setup {
                    runner_id: id.clone(),
                    source: Arc::clone(&source),
                    config,
                    events: events.clone(),
                    state: Arc::clone(&state),
                };
                Some(handle.spawn(task.run()))
            }
            Err(e) => {
                let err = RuntimeError::invalid_state(format!(
                    "isolate setup requires a tokio runtime: {e}"
                ));
                error!(runner_id = %id, error = %err, "Isolate setup not started");
                publish(&state, Err(Arc::new(err)));
                None
            }
        };

        info!(runner_id = %id, bytes_len = source.len(), "Isolate runner created");

        Self {
            id,
            source,
            events,
            state,
            setup: Mutex::new(setup),
        }
    }

    /// Get the unique identifier of this runner.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the script source.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Get the event channel of this runner.
    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    /// Current setup state.
    pub fn state(&self) -> RunnerState {
        match &*self.state.borrow() {
            None => RunnerState::Created,
            Some(Ok(module)) => RunnerState::Ready(module.clone()),
            Some(Err(err)) => RunnerState::Failed(Arc::clone(err)),
        }
    }

    /// Wait for setup to finish.
    ///
    /// Resolves immediately if setup already finished.
    ///
    /// # Errors
    ///
    /// Returns the setup error if setup failed.
    pub async fn ready(&self) -> Result<CompiledModule, Arc<RuntimeError>> {
        let mut state = self.state.subscribe();
        let settled = state
            .wait_for(Option::is_some)
            .await
            .map(|slot| (*slot).clone());

        match settled {
            Ok(Some(outcome)) => outcome,
            Ok(None) | Err(_) => Err(Arc::new(RuntimeError::invalid_state(
                "isolate setup ended without an outcome",
            ))),
        }
    }

    /// Subscribe to every future event of `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&RunnerEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, listener)
    }

    pub fn on_ready<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&CompiledModule) + Send + Sync + 'static,
    {
        self.events.on_ready(listener)
    }

    pub fn on_stdout<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.events.on_stdout(listener)
    }

    pub fn on_stderr<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.events.on_stderr(listener)
    }

    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Arc<RuntimeError>) + Send + Sync + 'static,
    {
        self.events.on_error(listener)
    }

    pub fn on_exit<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ExecutionResult) + Send + Sync + 'static,
    {
        self.events.on_exit(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    /// Wait for the next `kind` event; an error event rejects it.
    ///
    /// Setup events are never missed: if setup already settled, waiting for
    /// `ready` or `error` resolves with the stored outcome instead of the
    /// next emission.
    pub fn once(
        &self,
        kind: EventKind,
    ) -> impl Future<Output = Result<RunnerEvent, Arc<RuntimeError>>> + 'static {
        // Subscribe before reading the slot so no emission falls in between
        let next = self.events.once(kind);
        let state = self.state.subscribe();
        settled_or_next(kind, next, state)
    }

    /// Wait for setup to finish, then release the isolate.
    ///
    /// Handles to the main module held elsewhere keep the isolate alive
    /// until they are dropped too.
    #[instrument(skip(self), fields(runner_id = %self.id))]
    pub async fn dispose(self) {
        let setup = self.setup.lock().take();

        if let Some(setup) = setup {
            if let Err(e) = setup.await {
                warn!(error = %e, "Isolate setup task did not complete");
            }
        }

        debug!("Isolate runner disposed");
    }
}

impl std::fmt::Debug for IsolateRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.borrow() {
            None => "created",
            Some(Ok(_)) => "ready",
            Some(Err(_)) => "failed",
        };

        f.debug_struct("IsolateRunner")
            .field("id", &self.id)
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

/// Store the setup outcome unless one is already stored.
fn publish(state: &StateSlot, outcome: SetupOutcome) -> bool {
    state.send_if_modified(move |slot| {
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        true
    })
}

/// Resolve a setup event from the state slot, or fall back to the next
/// emission of `kind`.
async fn settled_or_next(
    kind: EventKind,
    mut next: Once,
    mut state: watch::Receiver<Option<SetupOutcome>>,
) -> Result<RunnerEvent, Arc<RuntimeError>> {
    if !matches!(kind, EventKind::Ready | EventKind::Error) {
        return next.await;
    }

    let settled = tokio::select! {
        biased;
        event = &mut next => return event,
        slot = state.wait_for(Option::is_some) => slot.ok().and_then(|slot| (*slot).clone()),
    };

    match (kind, settled) {
        (EventKind::Ready, Some(Ok(module))) => Ok(RunnerEvent::Ready(module)),
        (EventKind::Ready, Some(Err(err))) => Err(err),
        (EventKind::Error, Some(Err(err))) => Ok(RunnerEvent::Error(err)),
        // Setup succeeded or the slot closed; only a later emission can match
        _ => next.await,
    }
}

/// Background setup task of one runner.
struct Setup {
    runner_id: String,
    source: Arc<str>,
    config: RuntimeConfig,
    events: EventChannel,
    state: StateSlot,
}

impl Setup {
    #[instrument(skip_all, fields(runner_id = %self.runner_id))]
    async fn run(self) {
        let start = Instant::now();

        match self.initialize().await {
            Ok(main) => {
                info!(
                    module = %main.name(),
                    duration_ms = start.elapsed().as_millis(),
                    "Isolate ready"
                );
                self.events.emit(RunnerEvent::Ready(main.clone()));
                publish(&self.state, Ok(main));
            }
            Err(e) => {
                let err = Arc::new(e);
                error!(
                    error = %err,
                    duration_ms = start.elapsed().as_millis(),
                    "Isolate setup failed"
                );
                self.events.emit(RunnerEvent::Error(Arc::clone(&err)));
                publish(&self.state, Err(err));
            }
        }
    }

    async fn initialize(&self) -> Result<CompiledModule, RuntimeError> {
        let isolate = Isolate::new(&self.config.isolate).await?;
        let bridge = HostBridge::new(self.runner_id.clone(), self.events.clone());

        let (context, main, format) = tokio::try_join!(
            self.create_context(&isolate, &bridge),
            isolate.compile_module(&self.source),
            self.compile_format_module(&isolate),
        )?;

        tokio::try_join!(
            main.instantiate(&context, create_resolver([(FORMAT_SPECIFIER, format.clone())])),
            format.instantiate(&context, ModuleResolver::empty()),
        )?;

        Ok(main)
    }

    async fn create_context(
        &self,
        isolate: &Isolate,
        bridge: &HostBridge,
    ) -> Result<Context, RuntimeError> {
        let context = isolate.create_context(self.events.clone()).await?;
        bridge.install(&context).await?;
        Ok(context)
    }

    async fn compile_format_module(&self, isolate: &Isolate) -> Result<CompiledModule, RuntimeError> {
        let path = self
            .config
            .isolate
            .format_module_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FORMAT_MODULE_PATH));

        let source = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| RuntimeError::module_source(path.display().to_string(), e))?;

        debug!(path = %path.display(), "Format module source loaded");
        isolate.compile_module(&source).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_is_set_once() {
        let (state, _) = watch::channel::<Option<SetupOutcome>>(None);
        let state = Arc::new(state);

        assert!(publish(
            &state,
            Err(Arc::new(RuntimeError::module_not_found("a")))
        ));
        assert!(!publish(
            &state,
            Err(Arc::new(RuntimeError::module_not_found("b")))
        ));

        match &*state.borrow() {
            Some(Err(err)) => assert_eq!(err.to_string(), "module not found: a"),
            _ => panic!("expected the first outcome to stick"),
        }
    }

    #[test]
    fn test_runner_without_tokio_runtime_fails() {
        let runner = IsolateRunner::new("stdout('hi');");

        match runner.state() {
            RunnerState::Failed(err) => {
                assert!(matches!(*err, RuntimeError::InvalidState { .. }));
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn test_default_format_module_exists() {
        assert!(std::path::Path::new(DEFAULT_FORMAT_MODULE_PATH).is_file());
    }

    #[tokio::test]
    async fn test_runner_debug() {
        let runner = IsolateRunner::new("export {};");

        let debug_str = format!("{runner:?}");
        assert!(debug_str.contains("IsolateRunner"));
        assert!(debug_str.contains(runner.id()));

        runner.dispose().await;
    }
}
