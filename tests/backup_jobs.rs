#![cfg(unix)]

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use servdag::backup::engine::ToolSettings;
use servdag::backup::{BackupRestoreEngine, Job, JobState, MaintenanceLock};
use servdag::errors::{JobError, SupervisorError};
use servdag::monitor::events::{EventHub, TracingSink};
use servdag::supervise::{ServiceDescriptor, ServiceState, Supervisor};
use tempfile::tempdir;
use tokio::time::sleep;

type TestResult = Result<(), Box<dyn Error>>;

/// Write an executable fake tool script.
fn write_tool(dir: &Path, name: &str, body: &str) -> Result<PathBuf, Box<dyn Error>> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    let mut perms = std::fs::metadata(&path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms)?;
    Ok(path)
}

struct Harness {
    supervisor: Arc<Supervisor>,
    engine: Arc<BackupRestoreEngine>,
}

/// Supervisor with one database service (`sleep 30`) plus an engine wired to
/// the given fake tools, sharing one maintenance lock.
fn harness(
    dump_tool: &Path,
    client_tool: &Path,
    log_dir: &Path,
) -> Result<Harness, Box<dyn Error>> {
    let events = Arc::new(EventHub::new(Arc::new(TracingSink), log_dir));
    let lock = MaintenanceLock::new();

    let db = ServiceDescriptor {
        id: "db".into(),
        display_name: "db".into(),
        executable: PathBuf::from("/bin/sh"),
        args: vec!["-c".into(), "sleep 30".into()],
        working_dir: None,
        startup_grace: Duration::ZERO,
        depends_on: vec![],
        auto_restart: false,
        max_restart_attempts: 3,
        restart_backoff: Duration::ZERO,
        ready_pattern: None,
    };

    let supervisor = Arc::new(Supervisor::new(
        vec![db],
        Arc::clone(&events),
        lock.clone(),
        Some("db".into()),
        Duration::from_secs(2),
    )?);

    let tools = ToolSettings {
        dump_tool: dump_tool.display().to_string(),
        client_tool: client_tool.display().to_string(),
        host: "localhost".into(),
        port: 3306,
        user: "root".into(),
        password: None,
        dump_args: vec![],
    };

    let engine = Arc::new(BackupRestoreEngine::new(
        tools,
        events,
        lock,
        Arc::clone(&supervisor),
    ));

    Ok(Harness { supervisor, engine })
}

async fn wait_terminal(engine: &Arc<BackupRestoreEngine>, id: u64) -> Job {
    for _ in 0..200 {
        if let Some(job) = engine.job(id).await {
            if job.state.is_terminal() && job.finished_at.is_some() {
                return job;
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("job {id} did not reach a terminal state in time");
}

fn files_with_extension(dir: &Path, ext: &str) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|e| e == ext))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn successful_backup_publishes_one_file_per_database() -> TestResult {
    let dir = tempdir()?;
    let dump = write_tool(dir.path(), "dump.sh", "echo '-- fake dump'; echo 'INSERT 1;'")?;
    let client = write_tool(dir.path(), "client.sh", "exit 0")?;
    let h = harness(&dump, &client, dir.path())?;

    let dest = dir.path().join("backups");
    let id = h
        .engine
        .start_backup(vec!["acore_auth".into(), "acore_world".into()], dest.clone())
        .await?;

    let job = wait_terminal(&h.engine, id).await;
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.produced.len(), 2);
    assert!(job.bytes_written > 0);

    let published = files_with_extension(&dest, "sql");
    assert_eq!(published.len(), 2);
    assert!(files_with_extension(&dest, "partial").is_empty());

    for path in &job.produced {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(
            name.starts_with("acore_auth_") || name.starts_with("acore_world_"),
            "unexpected file name: {name}"
        );
        let content = std::fs::read_to_string(path)?;
        assert!(content.contains("-- fake dump"));
    }

    Ok(())
}

#[tokio::test]
async fn failed_dump_leaves_no_file_behind() -> TestResult {
    let dir = tempdir()?;
    let dump = write_tool(dir.path(), "dump.sh", "echo 'cannot connect' >&2; exit 2")?;
    let client = write_tool(dir.path(), "client.sh", "exit 0")?;
    let h = harness(&dump, &client, dir.path())?;

    let dest = dir.path().join("backups");
    let id = h
        .engine
        .start_backup(vec!["acore_auth".into()], dest.clone())
        .await?;

    let job = wait_terminal(&h.engine, id).await;
    assert_eq!(job.state, JobState::Failed);
    let error = job.error.unwrap_or_default();
    assert!(error.contains("cannot connect"), "got: {error}");

    assert!(files_with_extension(&dest, "sql").is_empty());
    assert!(files_with_extension(&dest, "partial").is_empty());

    Ok(())
}

#[tokio::test]
async fn cancelled_backup_leaves_no_file_behind() -> TestResult {
    let dir = tempdir()?;
    let dump = write_tool(dir.path(), "dump.sh", "sleep 30")?;
    let client = write_tool(dir.path(), "client.sh", "exit 0")?;
    let h = harness(&dump, &client, dir.path())?;

    let dest = dir.path().join("backups");
    let id = h
        .engine
        .start_backup(vec!["acore_auth".into()], dest.clone())
        .await?;

    // Give the dump a moment to open its partial file, then cancel.
    sleep(Duration::from_millis(200)).await;
    h.engine.cancel(id).await?;

    // State flips immediately.
    assert_eq!(h.engine.job(id).await.unwrap().state, JobState::Cancelled);

    let job = wait_terminal(&h.engine, id).await;
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.produced.is_empty());
    assert!(files_with_extension(&dest, "sql").is_empty());
    assert!(files_with_extension(&dest, "partial").is_empty());

    Ok(())
}

#[tokio::test]
async fn only_one_job_runs_at_a_time() -> TestResult {
    let dir = tempdir()?;
    let dump = write_tool(dir.path(), "dump.sh", "sleep 30")?;
    let client = write_tool(dir.path(), "client.sh", "exit 0")?;
    let h = harness(&dump, &client, dir.path())?;

    let dest = dir.path().join("backups");
    let id = h
        .engine
        .start_backup(vec!["acore_auth".into()], dest.clone())
        .await?;
    sleep(Duration::from_millis(100)).await;

    let second = h
        .engine
        .start_backup(vec!["acore_world".into()], dest.clone())
        .await;
    assert!(matches!(second, Err(JobError::Busy)));

    let backup_file = dir.path().join("acore_auth_20240101_120000.sql");
    std::fs::write(&backup_file, "-- restore me\n")?;
    let restore = h.engine.start_restore("db", backup_file).await;
    assert!(matches!(restore, Err(JobError::Busy)));

    // The database service lifecycle shares the same exclusion.
    let start = h.supervisor.start_service("db").await;
    assert!(matches!(start, Err(SupervisorError::MaintenanceBusy(_))));

    h.engine.cancel(id).await?;
    wait_terminal(&h.engine, id).await;

    // Once the job is gone the service can be started again.
    h.supervisor.start_service("db").await?;
    h.supervisor.stop_service("db").await?;

    Ok(())
}

#[tokio::test]
async fn restore_into_live_service_never_invokes_the_tool() -> TestResult {
    let dir = tempdir()?;
    let marker = dir.path().join("client-invoked");
    let dump = write_tool(dir.path(), "dump.sh", "exit 0")?;
    let client = write_tool(
        dir.path(),
        "client.sh",
        &format!("touch {}; exit 0", marker.display()),
    )?;
    let h = harness(&dump, &client, dir.path())?;

    let backup_file = dir.path().join("acore_auth_20240101_120000.sql");
    std::fs::write(&backup_file, "-- restore me\n")?;

    h.supervisor.start_service("db").await?;
    assert_ne!(h.supervisor.state_of("db").await?, ServiceState::Stopped);

    let result = h.engine.start_restore("db", backup_file).await;
    assert!(matches!(result, Err(JobError::ServiceMustBeStopped(_))));
    assert!(!marker.exists(), "restore tool was invoked");

    h.supervisor.stop_service("db").await?;
    Ok(())
}

#[tokio::test]
async fn restore_streams_the_backup_into_the_client_tool() -> TestResult {
    let dir = tempdir()?;
    let dump = write_tool(dir.path(), "dump.sh", "exit 0")?;
    // Consumes whatever arrives on stdin; handles both the schema-creation
    // call (stdin closed) and the actual load.
    let client = write_tool(dir.path(), "client.sh", "cat > /dev/null")?;
    let h = harness(&dump, &client, dir.path())?;

    let backup_file = dir.path().join("acore_auth_20240101_120000.sql");
    let payload = "CREATE TABLE t (id INT);\n".repeat(100);
    std::fs::write(&backup_file, &payload)?;

    let id = h.engine.start_restore("db", backup_file).await?;
    let job = wait_terminal(&h.engine, id).await;

    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.bytes_written, payload.len() as u64);
    assert_eq!(job.progress, Some(1.0));

    Ok(())
}

#[tokio::test]
async fn failed_restore_reports_the_tool_error() -> TestResult {
    let dir = tempdir()?;
    let dump = write_tool(dir.path(), "dump.sh", "exit 0")?;
    let client = write_tool(dir.path(), "client.sh", "echo 'access denied' >&2; exit 1")?;
    let h = harness(&dump, &client, dir.path())?;

    let backup_file = dir.path().join("acore_auth_20240101_120000.sql");
    std::fs::write(&backup_file, "-- restore me\n")?;

    let id = h.engine.start_restore("db", backup_file).await?;
    let job = wait_terminal(&h.engine, id).await;

    assert_eq!(job.state, JobState::Failed);
    let error = job.error.unwrap_or_default();
    assert!(error.contains("access denied"), "got: {error}");

    Ok(())
}

#[tokio::test]
async fn restore_from_missing_file_is_rejected() -> TestResult {
    let dir = tempdir()?;
    let dump = write_tool(dir.path(), "dump.sh", "exit 0")?;
    let client = write_tool(dir.path(), "client.sh", "exit 0")?;
    let h = harness(&dump, &client, dir.path())?;

    let result = h
        .engine
        .start_restore("db", dir.path().join("nope.sql"))
        .await;
    assert!(matches!(result, Err(JobError::SourceNotFound(_))));

    Ok(())
}

#[tokio::test]
async fn empty_backup_selection_is_rejected() -> TestResult {
    let dir = tempdir()?;
    let dump = write_tool(dir.path(), "dump.sh", "exit 0")?;
    let client = write_tool(dir.path(), "client.sh", "exit 0")?;
    let h = harness(&dump, &client, dir.path())?;

    let result = h
        .engine
        .start_backup(vec![], dir.path().join("backups"))
        .await;
    assert!(matches!(result, Err(JobError::InvalidTarget(_))));

    Ok(())
}

#[tokio::test]
async fn finished_jobs_are_pruned_after_the_history_limit() -> TestResult {
    let dir = tempdir()?;
    let dump = write_tool(dir.path(), "dump.sh", "echo 'boom' >&2; exit 1")?;
    let client = write_tool(dir.path(), "client.sh", "exit 0")?;
    let h = harness(&dump, &client, dir.path())?;

    let dest = dir.path().join("backups");

    // The maintenance slot frees a moment after the record turns terminal,
    // so a fresh start may briefly see Busy.
    async fn start_retrying(
        engine: &Arc<BackupRestoreEngine>,
        dest: &Path,
    ) -> Result<u64, Box<dyn Error>> {
        for _ in 0..100 {
            match engine
                .start_backup(vec!["acore_auth".into()], dest.to_path_buf())
                .await
            {
                Ok(id) => return Ok(id),
                Err(JobError::Busy) => sleep(Duration::from_millis(10)).await,
                Err(e) => return Err(e.into()),
            }
        }
        Err("engine stayed busy".into())
    }

    let first = start_retrying(&h.engine, &dest).await?;
    wait_terminal(&h.engine, first).await;

    let mut last = first;
    for _ in 0..40 {
        last = start_retrying(&h.engine, &dest).await?;
        wait_terminal(&h.engine, last).await;
    }

    assert!(
        h.engine.job(first).await.is_none(),
        "oldest finished job should have been dropped"
    );
    assert!(h.engine.job(last).await.is_some());

    Ok(())
}

#[tokio::test]
async fn list_databases_filters_system_schemas() -> TestResult {
    let dir = tempdir()?;
    let dump = write_tool(dir.path(), "dump.sh", "exit 0")?;
    let client = write_tool(
        dir.path(),
        "client.sh",
        "echo Database; echo acore_auth; echo acore_world; echo mysql; \
         echo information_schema; echo performance_schema; echo sys",
    )?;
    let h = harness(&dump, &client, dir.path())?;

    let databases = h.engine.list_databases().await?;
    assert_eq!(databases, vec!["acore_auth", "acore_world"]);

    Ok(())
}
