// src/backup/mod.rs

//! Database backup/restore jobs.
//!
//! - [`job`] holds the job records and states.
//! - [`engine`] drives the external dump/restore tools as cancelable,
//!   progress-reporting jobs, one at a time.
//!
//! The "one destructive operation at a time" rule is the explicit
//! [`MaintenanceLock`], shared between the engine and the supervisor's
//! database-service lifecycle so a backup cannot race an operator restarting
//! the database mid-job.

pub mod engine;
pub mod job;

pub use engine::BackupRestoreEngine;
pub use job::{Job, JobKind, JobState};

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Guard held for the duration of a backup/restore job or a database-service
/// lifecycle operation.
pub type MaintenanceGuard = OwnedMutexGuard<()>;

/// System-wide exclusive slot for destructive database operations.
#[derive(Clone, Default)]
pub struct MaintenanceLock {
    inner: Arc<Mutex<()>>,
}

impl MaintenanceLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot if free; `None` means a job or database lifecycle
    /// operation is in flight and the caller should report `Busy`.
    pub fn try_acquire(&self) -> Option<MaintenanceGuard> {
        Arc::clone(&self.inner).try_lock_owned().ok()
    }
}
