// src/monitor/events.rs

//! Status events and the sink the presentation layer consumes.
//!
//! Every health and job transition flows through [`EventHub::emit`], which:
//! - logs the event via `tracing`,
//! - appends a timestamped record to the per-service (or per-job) log file,
//! - forwards the event to the configured [`EventSink`].
//!
//! Events are transient; the append-only log files are the only persisted
//! trace.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::backup::job::JobState;
use crate::supervise::process::ServiceState;

/// Why a service changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReason {
    /// Operator requested a start and the process was spawned.
    Launched,
    /// The launch itself failed (missing executable, OS refusal).
    LaunchFailed,
    /// Grace period elapsed without a crash; presumed ready.
    ReadyTimeout,
    /// Ready pattern matched on stdout before the grace period elapsed.
    ReadyConfirmed,
    /// The process exited without a stop having been requested.
    Crash,
    /// Operator requested a stop.
    ManualStop,
    /// Auto-restart policy decided to relaunch the service.
    RestartScheduled,
    /// Auto-restart policy ran out of attempts; operator attention required.
    RestartExhausted,
}

/// A single service state transition.
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub service_id: String,
    pub previous: ServiceState,
    pub new: ServiceState,
    pub timestamp: DateTime<Utc>,
    pub reason: EventReason,
    /// Human-readable cause detail (exit code, launch error, ...).
    pub detail: Option<String>,
}

impl HealthEvent {
    pub fn now(
        service_id: impl Into<String>,
        previous: ServiceState,
        new: ServiceState,
        reason: EventReason,
        detail: Option<String>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            previous,
            new,
            timestamp: Utc::now(),
            reason,
            detail,
        }
    }
}

/// A backup/restore job transition or progress report.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: JobEventKind,
}

#[derive(Debug, Clone)]
pub enum JobEventKind {
    StateChanged {
        state: JobState,
        detail: Option<String>,
    },
    Progress {
        bytes_written: u64,
        fraction: Option<f64>,
    },
}

/// Anything the supervisor or backup engine reports outward.
#[derive(Debug, Clone)]
pub enum Event {
    Health(HealthEvent),
    Job(JobEvent),
}

impl From<HealthEvent> for Event {
    fn from(e: HealthEvent) -> Self {
        Event::Health(e)
    }
}

impl From<JobEvent> for Event {
    fn from(e: JobEvent) -> Self {
        Event::Job(e)
    }
}

/// Consumer interface for status/progress events.
///
/// The presentation layer implements this; the supervisor core only pushes.
/// Implementations must tolerate events arriving after the command that
/// caused them has already returned.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, event: &Event);
}

/// Default sink: re-emits every event through `tracing`.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: &Event) {
        match event {
            Event::Health(h) => info!(
                service = %h.service_id,
                from = ?h.previous,
                to = ?h.new,
                reason = ?h.reason,
                detail = h.detail.as_deref().unwrap_or(""),
                "service state changed"
            ),
            Event::Job(j) => match &j.kind {
                JobEventKind::StateChanged { state, detail } => info!(
                    job = j.job_id,
                    state = ?state,
                    detail = detail.as_deref().unwrap_or(""),
                    "job state changed"
                ),
                JobEventKind::Progress {
                    bytes_written,
                    fraction,
                } => info!(
                    job = j.job_id,
                    bytes = bytes_written,
                    fraction = fraction.unwrap_or(0.0),
                    "job progress"
                ),
            },
        }
    }
}

/// Fan-out point for events plus the append-only per-stream log files.
pub struct EventHub {
    sink: Arc<dyn EventSink>,
    log_dir: PathBuf,
}

impl EventHub {
    pub fn new(sink: Arc<dyn EventSink>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            sink,
            log_dir: log_dir.into(),
        }
    }

    /// Publish an event and append it to the matching log stream.
    pub async fn emit(&self, event: Event) {
        let (stream, line) = match &event {
            Event::Health(h) => (
                h.service_id.clone(),
                format!(
                    "{:?} -> {:?} ({:?}){}",
                    h.previous,
                    h.new,
                    h.reason,
                    h.detail
                        .as_deref()
                        .map(|d| format!(": {d}"))
                        .unwrap_or_default()
                ),
            ),
            Event::Job(j) => (
                format!("job-{}", j.job_id),
                match &j.kind {
                    JobEventKind::StateChanged { state, detail } => format!(
                        "state {:?}{}",
                        state,
                        detail
                            .as_deref()
                            .map(|d| format!(": {d}"))
                            .unwrap_or_default()
                    ),
                    JobEventKind::Progress {
                        bytes_written,
                        fraction,
                    } => match fraction {
                        Some(f) => {
                            format!("progress {bytes_written} bytes ({:.0}%)", f * 100.0)
                        }
                        None => format!("progress {bytes_written} bytes"),
                    },
                },
            ),
        };

        self.append_stream(&stream, &line).await;
        self.sink.publish(&event);
    }

    /// Append one timestamped line to a named log stream.
    ///
    /// Also used for captured child stdout/stderr, which share the service's
    /// stream.
    pub async fn append_stream(&self, stream: &str, line: &str) {
        if let Err(e) = self.try_append(stream, line).await {
            warn!(stream = %stream, error = %e, "failed to append to log stream");
        }
    }

    async fn try_append(&self, stream: &str, line: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.log_dir).await?;
        let path = self.log_dir.join(format!("{stream}.log"));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let record = format!("[{}] {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"), line);
        file.write_all(record.as_bytes()).await
    }
}
