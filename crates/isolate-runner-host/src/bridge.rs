//! Host bridge exposed to guest code.
//!
//! The bridge installs exactly three names on the guest global object:
//!
//! - `global`: a self-reference to the global object
//! - `stdout(data)`: emits a stdout event
//! - `stderr(data)`: emits a stderr event
//!
//! Nothing else from the host is reachable: no `console`, no `require`, no
//! filesystem or network access.

use rquickjs::{Coerced, Function};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use isolate_runner_common::RuntimeError;
use isolate_runner_core::{Context, EventChannel, RunnerEvent};

/// Names the bridge defines on the guest global object.
pub const GUEST_GLOBALS: [&str; 3] = ["global", "stdout", "stderr"];

/// Output stream a guest wrote to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputChannel {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputChannel::Stdout => write!(f, "stdout"),
            OutputChannel::Stderr => write!(f, "stderr"),
        }
    }
}

/// Host side of the guest output functions.
///
/// Every write is:
/// 1. Emitted as a [`RunnerEvent`] on the runner's channel
/// 2. Traced for observability
#[derive(Debug, Clone)]
pub struct HostBridge {
    runner_id: String,
    events: EventChannel,
}

impl HostBridge {
    pub fn new(runner_id: impl Into<String>, events: EventChannel) -> Self {
        Self {
            runner_id: runner_id.into(),
            events,
        }
    }

    /// Emit `data` on `channel`.
    pub fn write(&self, channel: OutputChannel, data: &str) {
        let runner_id = &self.runner_id;
        debug!(runner_id, channel = %channel, guest_output = true, "{}", data);

        let event = match channel {
            OutputChannel::Stdout => RunnerEvent::Stdout(data.to_string()),
            OutputChannel::Stderr => RunnerEvent::Stderr(data.to_string()),
        };
        self.events.emit(event);
    }

    pub fn stdout(&self, data: &str) {
        self.write(OutputChannel::Stdout, data);
    }

    pub fn stderr(&self, data: &str) {
        self.write(OutputChannel::Stderr, data);
    }

    /// Define the bridge globals in `context`.
    ///
    /// Arguments that are not strings are coerced with the guest's own
    /// string conversion.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects a global definition.
    #[instrument(skip_all, fields(runner_id = %self.runner_id, context_id = %context.id()))]
    pub async fn install(&self, context: &Context) -> Result<(), RuntimeError> {
        let stdout = self.clone();
        let stderr = self.clone();

        let [global_name, stdout_name, stderr_name] = GUEST_GLOBALS;

        context
            .with(move |ctx| {
                let globals = ctx.globals();
                globals.set(global_name, globals.clone())?;

                let write_stdout = Function::new(ctx.clone(), move |data: Coerced<String>| {
                    stdout.stdout(&data.0);
                })?;
                globals.set(stdout_name, write_stdout)?;

                let write_stderr = Function::new(ctx.clone(), move |data: Coerced<String>| {
                    stderr.stderr(&data.0);
                })?;
                globals.set(stderr_name, write_stderr)
            })
            .await
            .map_err(|e| RuntimeError::engine(format!("Failed to install host bridge: {e}")))?;

        debug!("Host bridge installed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use isolate_runner_common::{ExecutionConfig, IsolateConfig};
    use isolate_runner_core::{Isolate, ModuleResolver};

    async fn run_guest(source: &str) -> Vec<(OutputChannel, String)> {
        let isolate = Isolate::new(&IsolateConfig::default()).await.unwrap();
        let events = EventChannel::new();
        let context = isolate.create_context(events.clone()).await.unwrap();
        HostBridge::new("test", events.clone())
            .install(&context)
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        events.on_stdout(move |data| sink.lock().push((OutputChannel::Stdout, data.to_string())));
        let sink = Arc::clone(&seen);
        events.on_stderr(move |data| sink.lock().push((OutputChannel::Stderr, data.to_string())));

        let module = isolate.compile_module(source).await.unwrap();
        module
            .instantiate(&context, ModuleResolver::empty())
            .await
            .unwrap();
        module.evaluate(&ExecutionConfig::default()).await.unwrap();

        let lines = seen.lock().clone();
        lines
    }

    #[test]
    fn test_output_channel_display() {
        assert_eq!(OutputChannel::Stdout.to_string(), "stdout");
        assert_eq!(OutputChannel::Stderr.to_string(), "stderr");
    }

    #[test]
    fn test_write_emits_event() {
        let events = EventChannel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        events.on_stderr(move |data| sink.lock().push(data.to_string()));

        let bridge = HostBridge::new("runner-1", events);
        bridge.stderr("warning");
        bridge.stdout("ignored by this listener");

        assert_eq!(*seen.lock(), ["warning"]);
    }

    #[tokio::test]
    async fn test_guest_writes_both_channels() {
        let lines = run_guest(r#"stdout("out"); stderr("err"); stdout("again");"#).await;

        assert_eq!(
            lines,
            [
                (OutputChannel::Stdout, "out".to_string()),
                (OutputChannel::Stderr, "err".to_string()),
                (OutputChannel::Stdout, "again".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_non_string_arguments_are_coerced() {
        let lines = run_guest(r#"stdout(42); stdout(true); stdout(null); stdout({});"#).await;
        let contents: Vec<&str> = lines.iter().map(|(_, data)| data.as_str()).collect();

        assert_eq!(contents, ["42", "true", "null", "[object Object]"]);
    }

    #[tokio::test]
    async fn test_global_surface() {
        let lines = run_guest(
            r#"
            stdout(String(global === globalThis));
            stdout(typeof console);
            stdout(typeof require);
            stdout(typeof stdout);
            "#,
        )
        .await;
        let contents: Vec<&str> = lines.iter().map(|(_, data)| data.as_str()).collect();

        assert_eq!(contents, ["true", "undefined", "undefined", "function"]);
    }

    #[tokio::test]
    async fn test_install_defines_every_guest_global() {
        let isolate = Isolate::new(&IsolateConfig::default()).await.unwrap();
        let context = isolate.create_context(EventChannel::new()).await.unwrap();

        let before: Vec<bool> = context
            .with(|ctx| {
                let globals = ctx.globals();
                GUEST_GLOBALS
                    .iter()
                    .map(|name| globals.contains_key(*name))
                    .collect::<rquickjs::Result<_>>()
            })
            .await
            .unwrap();
        assert_eq!(before, [false; 3]);

        HostBridge::new("test", EventChannel::new())
            .install(&context)
            .await
            .unwrap();

        let after: Vec<bool> = context
            .with(|ctx| {
                let globals = ctx.globals();
                GUEST_GLOBALS
                    .iter()
                    .map(|name| globals.contains_key(*name))
                    .collect::<rquickjs::Result<_>>()
            })
            .await
            .unwrap();
        assert_eq!(after, [true; 3]);
    }
}
