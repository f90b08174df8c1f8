// src/supervise/mod.rs

//! Process supervision: service descriptors, per-attempt process handles,
//! the dependency graph, and the supervisor that owns all of it.
//!
//! - [`descriptor`] holds the immutable per-service definition.
//! - [`process`] wraps one OS child process per start attempt.
//! - [`order`] computes dependency-ordered start/stop sequences.
//! - [`supervisor`] exposes the lifecycle operations the presentation layer
//!   calls.

pub mod descriptor;
pub mod order;
pub mod process;
pub mod supervisor;

pub use descriptor::ServiceDescriptor;
pub use order::DependencyGraph;
pub use process::{ProcessHandle, ServiceState};
pub use supervisor::{RestartIncident, Supervisor};
