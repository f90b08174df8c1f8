// src/errors.rs

//! Structured error taxonomy for supervisor operations and backup/restore
//! jobs.
//!
//! Application-level plumbing still uses `anyhow` (see `lib.rs`), but the
//! operations the presentation layer calls return these enums so callers can
//! match on the failure kind instead of parsing strings.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from `Supervisor` lifecycle operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("service '{service}' depends on '{dependency}', which is not running")]
    DependencyNotReady { service: String, dependency: String },

    #[error("cycle detected in service dependencies involving '{0}'")]
    CyclicDependency(String),

    #[error("failed to launch service '{service}': {reason}")]
    Launch { service: String, reason: String },

    #[error(
        "service '{service}' did not stop within {grace:?}; the process may still be running"
    )]
    ShutdownTimeout { service: String, grace: Duration },

    #[error("a backup or restore job is running; '{0}' cannot be changed until it finishes")]
    MaintenanceBusy(String),
}

/// Errors from `BackupRestoreEngine` operations.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("another backup or restore job is already running")]
    Busy,

    #[error("no job with id {0}")]
    UnknownJob(u64),

    #[error("invalid backup target '{0}'")]
    InvalidTarget(String),

    #[error("backup file not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("service '{0}' must be stopped before restoring its database")]
    ServiceMustBeStopped(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
