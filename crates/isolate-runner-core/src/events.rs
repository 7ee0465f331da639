//! Runner lifecycle events.
//!
//! An [`EventChannel`] is a synchronous publish/subscribe hub keyed by
//! [`EventKind`]. Listeners run on the emitting task, in registration order,
//! and only see events emitted after they subscribed.
//!
//! [`EventChannel::once`] turns the next event of a kind into a future that
//! fails early if an [`EventKind::Error`] event arrives first.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{self, Poll};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::{CompiledModule, ExecutionResult};
use isolate_runner_common::RuntimeError;

/// The closed set of runner events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Setup finished; the main module is linked and may be evaluated.
    Ready,
    /// The guest wrote to standard output.
    Stdout,
    /// The guest wrote to standard error.
    Stderr,
    /// Setup failed.
    Error,
    /// The main module finished evaluating.
    Exit,
}

impl EventKind {
    /// All event kinds, in lifecycle order.
    pub const ALL: [EventKind; 5] = [
        EventKind::Ready,
        EventKind::Stdout,
        EventKind::Stderr,
        EventKind::Error,
        EventKind::Exit,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::Ready => "ready",
            EventKind::Stdout => "stdout",
            EventKind::Stderr => "stderr",
            EventKind::Error => "error",
            EventKind::Exit => "exit",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event together with its payload.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    /// Carries the instantiated main module.
    Ready(CompiledModule),
    Stdout(String),
    Stderr(String),
    Error(Arc<RuntimeError>),
    Exit(ExecutionResult),
}

impl RunnerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RunnerEvent::Ready(_) => EventKind::Ready,
            RunnerEvent::Stdout(_) => EventKind::Stdout,
            RunnerEvent::Stderr(_) => EventKind::Stderr,
            RunnerEvent::Error(_) => EventKind::Error,
            RunnerEvent::Exit(_) => EventKind::Exit,
        }
    }
}

/// A registered event callback.
pub type Listener = Arc<dyn Fn(&RunnerEvent) + Send + Sync>;

/// Handle returned by [`EventChannel::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Publish/subscribe hub for [`RunnerEvent`]s.
///
/// Cloning an `EventChannel` clones a handle to the same listener registry.
#[derive(Clone, Default)]
pub struct EventChannel {
    registry: Arc<Registry>,
}

#[derive(Default)]
struct Registry {
    listeners: DashMap<EventKind, Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl Registry {
    fn allocate_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, kind: EventKind, id: ListenerId, listener: Listener) {
        self.listeners.entry(kind).or_default().push((id, listener));
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut removed = false;

        for mut entry in self.listeners.iter_mut() {
            let before = entry.len();
            entry.retain(|(existing, _)| *existing != id);
            removed |= entry.len() != before;
        }

        removed
    }
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `listener` to every future event of `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&RunnerEvent) + Send + Sync + 'static,
    {
        let id = self.registry.allocate_id();
        self.registry.insert(kind, id, Arc::new(listener));
        trace!(event = %kind, listener = id.0, "Listener registered");
        id
    }

    /// Unsubscribe a listener. Returns `false` if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        self.registry.remove(id)
    }

    /// Subscribe to ready events; the callback receives the main module.
    pub fn on_ready<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&CompiledModule) + Send + Sync + 'static,
    {
        self.on(EventKind::Ready, move |event| {
            if let RunnerEvent::Ready(module) = event {
                listener(module);
            }
        })
    }

    pub fn on_stdout<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on(EventKind::Stdout, move |event| {
            if let RunnerEvent::Stdout(data) = event {
                listener(data);
            }
        })
    }

    pub fn on_stderr<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on(EventKind::Stderr, move |event| {
            if let RunnerEvent::Stderr(data) = event {
                listener(data);
            }
        })
    }

    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Arc<RuntimeError>) + Send + Sync + 'static,
    {
        self.on(EventKind::Error, move |event| {
            if let RunnerEvent::Error(err) = event {
                listener(err);
            }
        })
    }

    pub fn on_exit<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ExecutionResult) + Send + Sync + 'static,
    {
        self.on(EventKind::Exit, move |event| {
            if let RunnerEvent::Exit(result) = event {
                listener(result);
            }
        })
    }

    /// Deliver `event` to the current listeners of its kind.
    ///
    /// Listeners are called synchronously, in registration order. A listener
    /// may subscribe or unsubscribe while running; the change applies from
    /// the next emission.
    pub fn emit(&self, event: RunnerEvent) {
        let kind = event.kind();
        let listeners: Vec<Listener> = self
            .registry
            .listeners
            .get(&kind)
            .map(|entry| entry.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        if listeners.is_empty() {
            debug!(event = %kind, "Event emitted with no listeners");
            return;
        }

        trace!(event = %kind, listeners = listeners.len(), "Emitting event");

        for listener in listeners {
            listener(&event);
        }
    }

    /// Wait for the next event of `kind`.
    ///
    /// The returned future resolves with the first of:
    /// - The next `kind` event, as `Ok`
    /// - The next error event, as `Err` (unless `kind` is itself
    ///   [`EventKind::Error`], which resolves `Ok`)
    ///
    /// Both subscriptions are removed as soon as either fires, or when the
    /// future is dropped.
    pub fn once(&self, kind: EventKind) -> Once {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));

        let mut ids = vec![self.registry.allocate_id()];
        if kind != EventKind::Error {
            ids.push(self.registry.allocate_id());
        }
        let ids: Arc<[ListenerId]> = ids.into();

        let registry = Arc::downgrade(&self.registry);
        let listener: Listener = {
            let ids = Arc::clone(&ids);
            Arc::new(move |event: &RunnerEvent| {
                let Some(tx) = slot.lock().take() else {
                    return;
                };

                if let Some(registry) = registry.upgrade() {
                    for id in ids.iter() {
                        registry.remove(*id);
                    }
                }

                let outcome = match event {
                    RunnerEvent::Error(err) if kind != EventKind::Error => Err(Arc::clone(err)),
                    other => Ok(other.clone()),
                };
                // The waiter may already be gone
                let _ = tx.send(outcome);
            })
        };

        self.registry.insert(kind, ids[0], Arc::clone(&listener));
        if let Some(error_id) = ids.get(1) {
            self.registry.insert(EventKind::Error, *error_id, listener);
        }

        Once {
            rx,
            ids,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Number of listeners currently subscribed to `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.registry
            .listeners
            .get(&kind)
            .map_or(0, |entry| entry.len())
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for kind in EventKind::ALL {
            map.entry(&kind.as_str(), &self.listener_count(kind));
        }
        map.finish()
    }
}

/// Future returned by [`EventChannel::once`].
pub struct Once {
    rx: oneshot::Receiver<Result<RunnerEvent, Arc<RuntimeError>>>,
    ids: Arc<[ListenerId]>,
    registry: Weak<Registry>,
}

impl Future for Once {
    type Output = Result<RunnerEvent, Arc<RuntimeError>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(Arc::new(RuntimeError::invalid_state(
                    "event channel closed before the event fired",
                )))
            })
        })
    }
}

impl Drop for Once {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            for id in self.ids.iter() {
                registry.remove(*id);
            }
        }
    }
}

impl std::fmt::Debug for Once {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Once").finish_non_exhaustive()
    }
}
