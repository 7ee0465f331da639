//! Host side of isolate-runner.
//!
//! This crate wires the core primitives into a runner for one untrusted
//! script:
//!
//! - [`runner`]: [`IsolateRunner`], which owns the isolate and drives setup
//! - [`bridge`]: The `global`, `stdout` and `stderr` functions guests can call
//! - [`output`]: An ordered log of guest output for drivers
//!
//! # Security Model
//!
//! Guest code is confined in three ways:
//!
//! 1. **Heap ceiling**: Each isolate has a fixed memory limit (128 MiB by
//!    default).
//! 2. **Closed namespace**: The only importable module is `"format"`; every
//!    other specifier fails setup with `module not found`.
//! 3. **Minimal globals**: The bridge is the only host surface. There is no
//!    `console`, `require`, filesystem or network.

pub mod bridge;
pub mod output;
pub mod runner;

pub use bridge::{GUEST_GLOBALS, HostBridge, OutputChannel};
pub use output::{OutputEntry, OutputLog};
pub use runner::{DEFAULT_FORMAT_MODULE_PATH, FORMAT_SPECIFIER, IsolateRunner, RunnerState};
