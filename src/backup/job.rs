// src/backup/job.rs

use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Lifecycle of one backup or restore job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

/// What a job does.
#[derive(Debug, Clone)]
pub enum JobKind {
    /// Dump the named databases into timestamped `.sql` files under
    /// `destination`.
    Backup {
        targets: Vec<String>,
        destination: PathBuf,
    },
    /// Load `source` into the database behind `service_id` (which must be
    /// stopped for the duration).
    Restore {
        service_id: String,
        source: PathBuf,
    },
}

/// Record of one backup/restore job.
///
/// Updated in place by the engine's job task; callers read snapshots via
/// `BackupRestoreEngine::job`.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: u64,
    pub kind: JobKind,
    pub state: JobState,
    pub bytes_written: u64,
    /// Completed fraction in `0.0..=1.0` when an estimate exists.
    pub progress: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Human-readable failure cause; never empty for a Failed job.
    pub error: Option<String>,
    /// Files published at their final destination (Succeeded jobs only).
    pub produced: Vec<PathBuf>,
}

impl Job {
    pub fn new(id: u64, kind: JobKind) -> Self {
        Self {
            id,
            kind,
            state: JobState::Queued,
            bytes_written: 0,
            progress: None,
            started_at: None,
            finished_at: None,
            error: None,
            produced: Vec::new(),
        }
    }
}
