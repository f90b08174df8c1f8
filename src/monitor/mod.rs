// src/monitor/mod.rs

//! Health monitoring and outward-facing events.
//!
//! - [`events`] defines the event types, the [`events::EventSink`] consumer
//!   interface and the per-stream append-only log files.
//! - [`health`] runs the periodic liveness/readiness classification and the
//!   auto-restart policy.

pub mod events;
pub mod health;

pub use events::{Event, EventHub, EventReason, EventSink, HealthEvent, JobEvent, TracingSink};
pub use health::HealthMonitor;
