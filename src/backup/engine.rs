// src/backup/engine.rs

//! Orchestrates external dump/restore tools as cancelable jobs.
//!
//! A backup writes every database to a `.partial` file first and renames the
//! whole set to the final names only when the last dump succeeds, so a
//! half-written backup is never visible under its final name. A restore
//! recreates the target schema before loading and never reports success on a
//! non-zero tool exit. Cancellation is cooperative: the tool process is
//! killed and partial output removed, while the job record flips to
//! Cancelled as soon as the request is accepted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::model::DatabaseSection;
use crate::errors::JobError;
use crate::monitor::events::{EventHub, JobEvent, JobEventKind};
use crate::backup::job::{Job, JobKind, JobState};
use crate::backup::MaintenanceLock;
use crate::supervise::process::ServiceState;
use crate::supervise::supervisor::Supervisor;

/// Minimum spacing between progress events for one job.
const PROGRESS_EVENT_INTERVAL: Duration = Duration::from_millis(250);

/// Grace before a cancelled tool process is killed outright.
const CANCEL_KILL_GRACE: Duration = Duration::from_secs(2);

/// Schemas that are never offered as backup targets.
const SYSTEM_SCHEMAS: &[&str] = &["information_schema", "performance_schema", "mysql", "sys"];

/// Finished job records kept for inspection before the oldest are dropped.
const JOB_HISTORY_LIMIT: usize = 32;

/// External tool invocation settings, taken from `[database]`.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub dump_tool: String,
    pub client_tool: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dump_args: Vec<String>,
}

impl From<&DatabaseSection> for ToolSettings {
    fn from(db: &DatabaseSection) -> Self {
        Self {
            dump_tool: db.dump_tool.clone(),
            client_tool: db.client_tool.clone(),
            host: db.host.clone(),
            port: db.port,
            user: db.user.clone(),
            password: db.password.clone(),
            dump_args: db.dump_args.clone(),
        }
    }
}

impl ToolSettings {
    fn connection_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--host={}", self.host),
            format!("--port={}", self.port),
            format!("--user={}", self.user),
        ];
        if let Some(ref password) = self.password {
            args.push(format!("--password={password}"));
        }
        args
    }
}

struct JobSlot {
    record: Arc<Mutex<Job>>,
    cancel: watch::Sender<bool>,
}

/// Runs backup and restore jobs, one at a time system-wide.
pub struct BackupRestoreEngine {
    tools: ToolSettings,
    events: Arc<EventHub>,
    lock: MaintenanceLock,
    supervisor: Arc<Supervisor>,
    jobs: Mutex<HashMap<u64, JobSlot>>,
    next_id: AtomicU64,
}

/// Outcome of one external-tool step inside a job.
enum StepError {
    Cancelled,
    Failed(String),
}

impl BackupRestoreEngine {
    pub fn new(
        tools: ToolSettings,
        events: Arc<EventHub>,
        lock: MaintenanceLock,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        Self {
            tools,
            events,
            lock,
            supervisor,
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Snapshot of a job record.
    pub async fn job(&self, id: u64) -> Option<Job> {
        let jobs = self.jobs.lock().await;
        match jobs.get(&id) {
            Some(slot) => Some(slot.record.lock().await.clone()),
            None => None,
        }
    }

    /// Id of the currently running job, if any.
    pub async fn active_job(&self) -> Option<u64> {
        let jobs = self.jobs.lock().await;
        for (id, slot) in jobs.iter() {
            if !slot.record.lock().await.state.is_terminal() {
                return Some(*id);
            }
        }
        None
    }

    /// Start dumping `targets` into timestamped `.sql` files under
    /// `destination`.
    ///
    /// Fails with `Busy` while any backup/restore job is running (the
    /// original job is unaffected), `InvalidTarget` for an empty selection,
    /// or `Io` if the destination cannot be created. Returns the job id;
    /// completion is observed via events or [`BackupRestoreEngine::job`].
    pub async fn start_backup(
        self: &Arc<Self>,
        targets: Vec<String>,
        destination: PathBuf,
    ) -> Result<u64, JobError> {
        if targets.is_empty() {
            return Err(JobError::InvalidTarget("empty database selection".into()));
        }

        let guard = self.lock.try_acquire().ok_or(JobError::Busy)?;
        tokio::fs::create_dir_all(&destination).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = JobKind::Backup {
            targets: targets.clone(),
            destination: destination.clone(),
        };
        let (record, cancel_rx) = self.register(id, kind).await;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            engine
                .run_backup(id, record, cancel_rx, targets, destination)
                .await;
        });

        Ok(id)
    }

    /// Start restoring `source` into the database behind `service_id`.
    ///
    /// Fails fast (before the tool is invoked) with `SourceNotFound`,
    /// `ServiceMustBeStopped` while the service is alive, or `Busy`.
    pub async fn start_restore(
        self: &Arc<Self>,
        service_id: &str,
        source: PathBuf,
    ) -> Result<u64, JobError> {
        if !source.is_file() {
            return Err(JobError::SourceNotFound(source));
        }

        let database = database_name_from_backup(&source)
            .ok_or_else(|| JobError::InvalidTarget(source.display().to_string()))?;

        match self.supervisor.state_of(service_id).await {
            Ok(ServiceState::Stopped) | Ok(ServiceState::Crashed) => {}
            Ok(_) => return Err(JobError::ServiceMustBeStopped(service_id.to_string())),
            Err(_) => return Err(JobError::InvalidTarget(service_id.to_string())),
        }

        let guard = self.lock.try_acquire().ok_or(JobError::Busy)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = JobKind::Restore {
            service_id: service_id.to_string(),
            source: source.clone(),
        };
        let (record, cancel_rx) = self.register(id, kind).await;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            engine.run_restore(id, record, cancel_rx, database, source).await;
        });

        Ok(id)
    }

    /// Request cooperative cancellation.
    ///
    /// The job record flips to Cancelled immediately; the tool process is
    /// terminated and partial output discarded by the job task. Cancelling a
    /// finished job is a no-op.
    pub async fn cancel(&self, job_id: u64) -> Result<(), JobError> {
        let cancel = {
            let jobs = self.jobs.lock().await;
            let slot = jobs.get(&job_id).ok_or(JobError::UnknownJob(job_id))?;

            let mut job = slot.record.lock().await;
            if job.state.is_terminal() {
                return Ok(());
            }
            job.state = JobState::Cancelled;
            slot.cancel.clone()
        };

        info!(job = job_id, "cancellation requested");
        self.emit_state(job_id, JobState::Cancelled, Some("cancelled by operator".into()))
            .await;
        let _ = cancel.send(true);
        Ok(())
    }

    /// Cancel whatever job is running, if any. Used during shutdown.
    pub async fn cancel_active(&self) {
        if let Some(id) = self.active_job().await {
            let _ = self.cancel(id).await;
        }
    }

    /// Enumerate user databases on the server, filtering system schemas.
    pub async fn list_databases(&self) -> Result<Vec<String>, JobError> {
        let output = Command::new(&self.tools.client_tool)
            .args(self.tools.connection_args())
            .arg("-e")
            .arg("SHOW DATABASES;")
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(JobError::Io(std::io::Error::other(format!(
                "listing databases failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        // First line is the column header.
        Ok(stdout
            .lines()
            .skip(1)
            .map(|l| l.trim().to_string())
            .filter(|name| !name.is_empty() && !SYSTEM_SCHEMAS.contains(&name.as_str()))
            .collect())
    }

    async fn register(
        &self,
        id: u64,
        kind: JobKind,
    ) -> (Arc<Mutex<Job>>, watch::Receiver<bool>) {
        let record = Arc::new(Mutex::new(Job::new(id, kind)));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut jobs = self.jobs.lock().await;
        jobs.insert(
            id,
            JobSlot {
                record: Arc::clone(&record),
                cancel: cancel_tx,
            },
        );

        // Cap the history so a long-lived control process does not grow the
        // map without bound; oldest finished jobs go first.
        if jobs.len() > JOB_HISTORY_LIMIT {
            let mut finished = Vec::new();
            for (id, slot) in jobs.iter() {
                if slot.record.lock().await.state.is_terminal() {
                    finished.push(*id);
                }
            }
            finished.sort_unstable();
            let excess = jobs.len().saturating_sub(JOB_HISTORY_LIMIT);
            for id in finished.into_iter().take(excess) {
                jobs.remove(&id);
            }
        }

        (record, cancel_rx)
    }

    async fn run_backup(
        &self,
        id: u64,
        record: Arc<Mutex<Job>>,
        mut cancel: watch::Receiver<bool>,
        targets: Vec<String>,
        destination: PathBuf,
    ) {
        self.mark_running(id, &record).await;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let total = targets.len();
        let mut partials: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut meter = ProgressMeter::new();

        for (index, db) in targets.iter().enumerate() {
            if *cancel.borrow() {
                remove_partials(&partials).await;
                self.finish(id, &record, None).await;
                return;
            }

            let final_path = destination.join(format!("{db}_{timestamp}.sql"));
            let partial_path = destination.join(format!("{db}_{timestamp}.sql.partial"));

            let step = self
                .dump_one(
                    id,
                    db,
                    &partial_path,
                    &record,
                    &mut cancel,
                    &mut meter,
                    index,
                    total,
                )
                .await;

            match step {
                Ok(()) => partials.push((partial_path, final_path)),
                Err(StepError::Cancelled) => {
                    partials.push((partial_path, final_path));
                    remove_partials(&partials).await;
                    self.finish(id, &record, None).await;
                    return;
                }
                Err(StepError::Failed(reason)) => {
                    partials.push((partial_path, final_path));
                    remove_partials(&partials).await;
                    self.finish(
                        id,
                        &record,
                        Some(format!("dumping '{db}' failed: {reason}")),
                    )
                    .await;
                    return;
                }
            }
        }

        // A cancel may have landed after the last dump finished; the job is
        // already Cancelled and nothing must be published.
        if *cancel.borrow() {
            remove_partials(&partials).await;
            self.finish(id, &record, None).await;
            return;
        }

        // Publish the whole set atomically-per-file only once every dump
        // succeeded.
        let mut produced = Vec::new();
        for (partial, final_path) in &partials {
            if let Err(e) = tokio::fs::rename(partial, final_path).await {
                remove_partials(&partials).await;
                for published in &produced {
                    let _ = tokio::fs::remove_file(published).await;
                }
                self.finish(
                    id,
                    &record,
                    Some(format!("publishing {:?} failed: {e}", final_path)),
                )
                .await;
                return;
            }
            produced.push(final_path.clone());
        }

        record.lock().await.produced = produced;
        self.finish(id, &record, None).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn dump_one(
        &self,
        id: u64,
        db: &str,
        partial_path: &Path,
        record: &Arc<Mutex<Job>>,
        cancel: &mut watch::Receiver<bool>,
        meter: &mut ProgressMeter,
        index: usize,
        total: usize,
    ) -> Result<(), StepError> {
        debug!(job = id, db = %db, "starting dump");

        let mut cmd = Command::new(&self.tools.dump_tool);
        cmd.args(self.tools.connection_args())
            .args(&self.tools.dump_args)
            .arg(db)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| StepError::Failed(format!("spawning {}: {e}", self.tools.dump_tool)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| StepError::Failed("dump tool stdout not captured".into()))?;
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(read_to_end_lossy(s)));

        let mut file = tokio::fs::File::create(partial_path)
            .await
            .map_err(|e| StepError::Failed(format!("creating {:?}: {e}", partial_path)))?;

        let mut buf = vec![0u8; 64 * 1024];
        let fraction = index as f64 / total as f64;

        loop {
            tokio::select! {
                read = stdout.read(&mut buf) => {
                    let n = read
                        .map_err(|e| StepError::Failed(format!("reading dump output: {e}")))?;
                    if n == 0 {
                        break;
                    }
                    file.write_all(&buf[..n])
                        .await
                        .map_err(|e| StepError::Failed(format!("writing {:?}: {e}", partial_path)))?;

                    let bytes = {
                        let mut job = record.lock().await;
                        job.bytes_written += n as u64;
                        job.progress = Some(fraction);
                        job.bytes_written
                    };
                    self.maybe_emit_progress(id, meter, bytes, Some(fraction)).await;
                }
                _ = cancel.changed() => {
                    kill_tool(&mut child).await;
                    if let Some(task) = stderr_task {
                        task.abort();
                    }
                    return Err(StepError::Cancelled);
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| StepError::Failed(format!("flushing {:?}: {e}", partial_path)))?;

        let status = child
            .wait()
            .await
            .map_err(|e| StepError::Failed(format!("waiting for dump tool: {e}")))?;
        let stderr_text = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(StepError::Failed(tool_failure(&status, &stderr_text)));
        }

        let bytes = {
            let mut job = record.lock().await;
            job.progress = Some((index + 1) as f64 / total as f64);
            job.bytes_written
        };
        self.maybe_emit_progress(id, meter, bytes, Some((index + 1) as f64 / total as f64))
            .await;

        Ok(())
    }

    async fn run_restore(
        &self,
        id: u64,
        record: Arc<Mutex<Job>>,
        mut cancel: watch::Receiver<bool>,
        database: String,
        source: PathBuf,
    ) {
        self.mark_running(id, &record).await;

        // Make sure the destination schema exists before loading data.
        if let Err(reason) = self.ensure_schema(&database).await {
            self.finish(id, &record, Some(reason)).await;
            return;
        }

        let source_size = tokio::fs::metadata(&source).await.map(|m| m.len()).ok();

        let mut cmd = Command::new(&self.tools.client_tool);
        cmd.args(self.tools.connection_args())
            .arg(&database)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                self.finish(
                    id,
                    &record,
                    Some(format!("spawning {}: {e}", self.tools.client_tool)),
                )
                .await;
                return;
            }
        };

        let mut stdin = match child.stdin.take() {
            Some(s) => s,
            None => {
                kill_tool(&mut child).await;
                self.finish(id, &record, Some("restore tool stdin not captured".into()))
                    .await;
                return;
            }
        };
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(read_to_end_lossy(s)));

        let mut file = match tokio::fs::File::open(&source).await {
            Ok(f) => f,
            Err(e) => {
                kill_tool(&mut child).await;
                self.finish(id, &record, Some(format!("opening {:?}: {e}", source)))
                    .await;
                return;
            }
        };

        let mut buf = vec![0u8; 64 * 1024];
        let mut meter = ProgressMeter::new();

        loop {
            tokio::select! {
                read = file.read(&mut buf) => {
                    let n = match read {
                        Ok(n) => n,
                        Err(e) => {
                            kill_tool(&mut child).await;
                            self.finish(id, &record, Some(format!("reading {:?}: {e}", source)))
                                .await;
                            return;
                        }
                    };
                    if n == 0 {
                        break;
                    }
                    if let Err(e) = stdin.write_all(&buf[..n]).await {
                        // The tool exiting early surfaces as a broken pipe;
                        // report its stderr below instead.
                        debug!(job = id, error = %e, "restore stdin write failed");
                        break;
                    }

                    let (bytes, fraction) = {
                        let mut job = record.lock().await;
                        job.bytes_written += n as u64;
                        job.progress = source_size
                            .map(|size| (job.bytes_written as f64 / size as f64).min(1.0));
                        (job.bytes_written, job.progress)
                    };
                    self.maybe_emit_progress(id, &mut meter, bytes, fraction).await;
                }
                _ = cancel.changed() => {
                    kill_tool(&mut child).await;
                    if let Some(task) = stderr_task {
                        task.abort();
                    }
                    self.finish(id, &record, None).await;
                    return;
                }
            }
        }

        // Close stdin so the tool sees EOF.
        drop(stdin);

        let status = match child.wait().await {
            Ok(s) => s,
            Err(e) => {
                self.finish(id, &record, Some(format!("waiting for restore tool: {e}")))
                    .await;
                return;
            }
        };
        let stderr_text = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            self.finish(
                id,
                &record,
                Some(format!(
                    "restore of '{database}' failed ({}); the database may be partially \
                     loaded and should be restored again",
                    tool_failure(&status, &stderr_text)
                )),
            )
            .await;
            return;
        }

        self.finish(id, &record, None).await;
    }

    async fn ensure_schema(&self, database: &str) -> Result<(), String> {
        let output = Command::new(&self.tools.client_tool)
            .args(self.tools.connection_args())
            .arg("-e")
            .arg(format!("CREATE DATABASE IF NOT EXISTS `{database}`;"))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| format!("spawning {}: {e}", self.tools.client_tool))?;

        if !output.status.success() {
            return Err(format!(
                "creating schema '{database}' failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }

    async fn mark_running(&self, id: u64, record: &Arc<Mutex<Job>>) {
        {
            let mut job = record.lock().await;
            // A cancel may have landed between registration and here.
            if job.state != JobState::Queued {
                return;
            }
            job.state = JobState::Running;
            job.started_at = Some(Utc::now());
        }
        self.emit_state(id, JobState::Running, None).await;
    }

    /// Finalize the job. `error: None` means Succeeded unless the record was
    /// already flipped to Cancelled.
    async fn finish(&self, id: u64, record: &Arc<Mutex<Job>>, error: Option<String>) {
        let (state, detail) = {
            let mut job = record.lock().await;
            job.finished_at = Some(Utc::now());

            if job.state == JobState::Cancelled {
                (JobState::Cancelled, None)
            } else {
                match error {
                    Some(reason) => {
                        job.state = JobState::Failed;
                        job.error = Some(reason.clone());
                        (JobState::Failed, Some(reason))
                    }
                    None => {
                        job.state = JobState::Succeeded;
                        (JobState::Succeeded, None)
                    }
                }
            }
        };

        match &state {
            JobState::Failed => warn!(job = id, error = detail.as_deref().unwrap_or(""), "job failed"),
            _ => info!(job = id, state = ?state, "job finished"),
        }

        // Cancelled already emitted its state change when the request was
        // accepted.
        if state != JobState::Cancelled {
            self.emit_state(id, state, detail).await;
        }
    }

    async fn emit_state(&self, id: u64, state: JobState, detail: Option<String>) {
        self.events
            .emit(
                JobEvent {
                    job_id: id,
                    timestamp: Utc::now(),
                    kind: JobEventKind::StateChanged { state, detail },
                }
                .into(),
            )
            .await;
    }

    async fn maybe_emit_progress(
        &self,
        id: u64,
        meter: &mut ProgressMeter,
        bytes_written: u64,
        fraction: Option<f64>,
    ) {
        if !meter.should_emit() {
            return;
        }
        self.events
            .emit(
                JobEvent {
                    job_id: id,
                    timestamp: Utc::now(),
                    kind: JobEventKind::Progress {
                        bytes_written,
                        fraction,
                    },
                }
                .into(),
            )
            .await;
    }
}

/// Rate limiter for progress events.
struct ProgressMeter {
    last_emit: Option<Instant>,
}

impl ProgressMeter {
    fn new() -> Self {
        Self { last_emit: None }
    }

    fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < PROGRESS_EVENT_INTERVAL => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

/// `acore_auth_20240101_120000.sql` -> `acore_auth` is not derivable without
/// knowing where the timestamp starts, so the original convention applies:
/// the database name is everything before the first underscore-digit
/// timestamp suffix; failing that, the part before the first underscore.
fn database_name_from_backup(source: &Path) -> Option<String> {
    let stem = source.file_stem()?.to_str()?;

    // Strip a trailing `_YYYYmmdd_HHMMSS` if present.
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() >= 3 {
        let tail = &parts[parts.len() - 2..];
        if tail.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())) {
            let name = parts[..parts.len() - 2].join("_");
            if !name.is_empty() {
                return Some(name);
            }
        }
    }

    let name = stem.split('_').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

async fn remove_partials(partials: &[(PathBuf, PathBuf)]) {
    for (partial, _) in partials {
        if let Err(e) = tokio::fs::remove_file(partial).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = ?partial, error = %e, "failed to remove partial backup file");
            }
        }
    }
}

async fn kill_tool(child: &mut tokio::process::Child) {
    // Cooperative first: give the tool a moment to exit after losing its
    // pipes, then kill.
    if let Ok(Ok(_)) = tokio::time::timeout(CANCEL_KILL_GRACE, child.wait()).await {
        return;
    }
    let _ = child.kill().await;
}

async fn read_to_end_lossy(mut stream: tokio::process::ChildStderr) -> String {
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

/// Number of stderr characters kept in a failure message.
const STDERR_TAIL_CHARS: usize = 500;

fn tool_failure(status: &std::process::ExitStatus, stderr: &str) -> String {
    let stderr = stderr.trim();
    // Trim on a character boundary; tool stderr may be localized or contain
    // replacement characters from the lossy conversion.
    let tail: String = match stderr.char_indices().nth_back(STDERR_TAIL_CHARS - 1) {
        Some((idx, _)) if idx > 0 => format!("...{}", &stderr[idx..]),
        _ => stderr.to_string(),
    };

    match status.code() {
        Some(code) if tail.is_empty() => format!("exit code {code}"),
        Some(code) => format!("exit code {code}: {tail}"),
        None if tail.is_empty() => "killed by signal".to_string(),
        None => format!("killed by signal: {tail}"),
    }
}
