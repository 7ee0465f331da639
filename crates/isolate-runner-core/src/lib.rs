//! Core QuickJS runtime for isolate-runner.
//!
//! This crate provides the sandboxed execution primitives:
//! - [`Isolate`]: Memory-bounded engine instance with an interrupt deadline
//! - [`Context`]: A realm (global object + module map) inside an isolate
//! - [`CompiledModule`]: Compiled ES module with a one-shot link/evaluate lifecycle
//! - [`ModuleResolver`]: Host-declared import table used during linking
//! - [`EventChannel`]: Publish/subscribe hub for runner events
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Isolate                           │
//! │  (One per runner, never shared)                         │
//! │  - Memory ceiling                                       │
//! │  - Interrupt deadline                                   │
//! │  - Link table (compiled sources + import tables)        │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!              ┌─────────────┴─────────────┐
//!              ▼                           ▼
//! ┌──────────────────────────┐ ┌──────────────────────────┐
//! │        Context           │ │     CompiledModule       │
//! │  - Global object         │ │  - Parsed source         │
//! │  - Host functions        │ │  - Lifecycle state       │
//! │  - EventChannel          │ │                          │
//! └──────────────────────────┘ └──────────────────────────┘
//!              │                           │
//!              └─────────────┬─────────────┘
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          instantiate(context, resolver) → evaluate      │
//! │  - Imports resolved only through the resolver table     │
//! │  - Evaluation bounded by a timeout                      │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod context;
pub mod engine;
pub mod events;
pub mod instance;
pub mod module;
pub mod resolver;

pub use context::Context;
pub use engine::Isolate;
pub use events::{EventChannel, EventKind, Listener, ListenerId, Once, RunnerEvent};
pub use instance::{ExecutionMetrics, ExecutionResult};
pub use module::{CompiledModule, ModuleStatus};
pub use resolver::{ModuleResolver, create_resolver};
