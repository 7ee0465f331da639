//! Collected guest output.
//!
//! [`OutputLog`] subscribes to a runner's stdout and stderr events and keeps
//! every write in arrival order. It serializes to the shape drivers print:
//!
//! ```json
//! [{ "event": "stdout", "content": "Hello, World!" }]
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::OutputChannel;
use isolate_runner_core::{EventChannel, ListenerId};

/// A single write from guest code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEntry {
    /// Stream the guest wrote to.
    pub event: OutputChannel,

    /// Text as written, after string coercion.
    pub content: String,
}

impl OutputEntry {
    pub fn stdout(content: impl Into<String>) -> Self {
        Self {
            event: OutputChannel::Stdout,
            content: content.into(),
        }
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self {
            event: OutputChannel::Stderr,
            content: content.into(),
        }
    }
}

/// Ordered record of guest output.
///
/// Cloning an `OutputLog` clones a handle to the same entries.
#[derive(Debug, Clone, Default)]
pub struct OutputLog {
    entries: Arc<Mutex<Vec<OutputEntry>>>,
}

impl OutputLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a log already subscribed to `events`.
    pub fn attach(events: &EventChannel) -> Self {
        let log = Self::new();
        log.subscribe(events);
        log
    }

    /// Record every future stdout and stderr event of `events`.
    pub fn subscribe(&self, events: &EventChannel) -> [ListenerId; 2] {
        let stdout = self.clone();
        let stderr = self.clone();

        [
            events.on_stdout(move |data| stdout.push(OutputEntry::stdout(data))),
            events.on_stderr(move |data| stderr.push(OutputEntry::stderr(data))),
        ]
    }

    pub fn push(&self, entry: OutputEntry) {
        self.entries.lock().push(entry);
    }

    /// Snapshot of the entries recorded so far.
    pub fn entries(&self) -> Vec<OutputEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Serialize for OutputLog {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.lock().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isolate_runner_core::RunnerEvent;

    #[test]
    fn test_log_records_in_order() {
        let events = EventChannel::new();
        let log = OutputLog::attach(&events);

        events.emit(RunnerEvent::Stdout("one".into()));
        events.emit(RunnerEvent::Stderr("two".into()));
        events.emit(RunnerEvent::Stdout("three".into()));

        assert_eq!(
            log.entries(),
            [
                OutputEntry::stdout("one"),
                OutputEntry::stderr("two"),
                OutputEntry::stdout("three"),
            ]
        );
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_unsubscribe() {
        let events = EventChannel::new();
        let log = OutputLog::new();
        let ids = log.subscribe(&events);

        for id in ids {
            assert!(events.off(id));
        }
        events.emit(RunnerEvent::Stdout("dropped".into()));

        assert!(log.is_empty());
    }

    #[test]
    fn test_serialize_shape() {
        let log = OutputLog::new();
        log.push(OutputEntry::stdout("Hello, World!"));
        log.push(OutputEntry::stderr("careful"));

        let json = serde_json::to_value(&log).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                { "event": "stdout", "content": "Hello, World!" },
                { "event": "stderr", "content": "careful" },
            ])
        );
    }

    #[test]
    fn test_entry_roundtrip() {
        let parsed: OutputEntry =
            serde_json::from_str(r#"{"event":"stderr","content":"x"}"#).unwrap();
        assert_eq!(parsed, OutputEntry::stderr("x"));
    }
}
