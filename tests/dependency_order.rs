use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use servdag::backup::MaintenanceLock;
use servdag::errors::SupervisorError;
use servdag::monitor::events::{EventHub, TracingSink};
use servdag::monitor::HealthMonitor;
use servdag::supervise::{ServiceDescriptor, ServiceState, Supervisor};
use tempfile::tempdir;
use tokio::time::sleep;

type TestResult = Result<(), Box<dyn Error>>;

fn sh(id: &str, script: &str, deps: &[&str]) -> ServiceDescriptor {
    ServiceDescriptor {
        id: id.into(),
        display_name: id.into(),
        executable: PathBuf::from("/bin/sh"),
        args: vec!["-c".into(), script.into()],
        working_dir: None,
        startup_grace: Duration::ZERO,
        depends_on: deps.iter().map(|s| s.to_string()).collect(),
        auto_restart: false,
        max_restart_attempts: 3,
        restart_backoff: Duration::ZERO,
        ready_pattern: None,
    }
}

fn supervisor(
    descriptors: Vec<ServiceDescriptor>,
    log_dir: &std::path::Path,
) -> Result<Arc<Supervisor>, SupervisorError> {
    let events = Arc::new(EventHub::new(Arc::new(TracingSink), log_dir));
    Ok(Arc::new(Supervisor::new(
        descriptors,
        events,
        MaintenanceLock::new(),
        None,
        Duration::from_secs(2),
    )?))
}

#[tokio::test]
async fn start_all_brings_up_stack_in_dependency_order() -> TestResult {
    let dir = tempdir()?;
    let sup = supervisor(
        vec![
            sh("world", "sleep 30", &["db"]),
            sh("web", "sleep 30", &["db"]),
            sh("db", "sleep 30", &[]),
        ],
        dir.path(),
    )?;

    let order = sup.start_order();
    let pos = |id: &str| order.iter().position(|s| s == id).unwrap();
    assert!(pos("db") < pos("world"));
    assert!(pos("db") < pos("web"));

    let failures = sup.start_all().await;
    assert!(failures.is_empty(), "unexpected failures: {failures:?}");

    // One monitoring pass promotes the leaves past their (zero) grace.
    let monitor = HealthMonitor::new(Arc::clone(&sup), Duration::from_millis(50));
    monitor.tick().await;

    for id in ["db", "world", "web"] {
        assert_eq!(sup.state_of(id).await?, ServiceState::Running, "{id}");
    }

    let failures = sup.stop_all().await;
    assert!(failures.is_empty(), "unexpected failures: {failures:?}");

    for id in ["db", "world", "web"] {
        assert_eq!(sup.state_of(id).await?, ServiceState::Stopped, "{id}");
    }

    Ok(())
}

#[tokio::test]
async fn starting_dependent_without_dependency_spawns_nothing() -> TestResult {
    let dir = tempdir()?;
    let sup = supervisor(
        vec![sh("world", "sleep 30", &["db"]), sh("db", "sleep 30", &[])],
        dir.path(),
    )?;

    let err = sup.start_service("world").await.unwrap_err();
    assert!(matches!(err, SupervisorError::DependencyNotReady { .. }));
    assert_eq!(sup.state_of("world").await?, ServiceState::Stopped);

    Ok(())
}

#[tokio::test]
async fn dependent_starts_once_dependency_is_running() -> TestResult {
    let dir = tempdir()?;
    let sup = supervisor(
        vec![sh("world", "sleep 30", &["db"]), sh("db", "sleep 30", &[])],
        dir.path(),
    )?;

    sup.start_service("db").await?;

    let monitor = HealthMonitor::new(Arc::clone(&sup), Duration::from_millis(50));
    monitor.tick().await;
    assert_eq!(sup.state_of("db").await?, ServiceState::Running);

    sup.start_service("world").await?;
    monitor.tick().await;
    assert_eq!(sup.state_of("world").await?, ServiceState::Running);

    sup.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn starting_a_running_service_is_a_no_op() -> TestResult {
    let dir = tempdir()?;
    let sup = supervisor(vec![sh("db", "sleep 30", &[])], dir.path())?;

    sup.start_service("db").await?;
    let monitor = HealthMonitor::new(Arc::clone(&sup), Duration::from_millis(50));
    monitor.tick().await;
    assert_eq!(sup.state_of("db").await?, ServiceState::Running);

    // No error and still running afterwards.
    sup.start_service("db").await?;
    assert_eq!(sup.state_of("db").await?, ServiceState::Running);

    sup.stop_service("db").await?;
    Ok(())
}

#[tokio::test]
async fn unknown_service_is_rejected() -> TestResult {
    let dir = tempdir()?;
    let sup = supervisor(vec![sh("db", "sleep 30", &[])], dir.path())?;

    let err = sup.start_service("ghost").await.unwrap_err();
    assert!(matches!(err, SupervisorError::UnknownService(_)));

    let err = sup.stop_service("ghost").await.unwrap_err();
    assert!(matches!(err, SupervisorError::UnknownService(_)));

    Ok(())
}

#[tokio::test]
async fn dependency_cycle_is_rejected_at_registration() -> TestResult {
    let dir = tempdir()?;
    let events = Arc::new(EventHub::new(Arc::new(TracingSink), dir.path()));

    let result = Supervisor::new(
        vec![sh("a", "sleep 30", &["b"]), sh("b", "sleep 30", &["a"])],
        events,
        MaintenanceLock::new(),
        None,
        Duration::from_secs(2),
    );

    assert!(matches!(
        result.err(),
        Some(SupervisorError::CyclicDependency(_))
    ));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn sigterm_ignoring_service_is_force_killed_on_stop() -> TestResult {
    let dir = tempdir()?;
    let events = Arc::new(EventHub::new(Arc::new(TracingSink), dir.path()));

    // Short shutdown grace so the escalation path is reached quickly.
    let sup = Arc::new(Supervisor::new(
        vec![sh("stubborn", "trap '' TERM; sleep 30", &[])],
        events,
        MaintenanceLock::new(),
        None,
        Duration::from_millis(200),
    )?);

    sup.start_service("stubborn").await?;
    // Let the shell install its trap before asking it to stop.
    sleep(Duration::from_millis(150)).await;

    // The termination signal is ignored; the forced kill still wins.
    sup.stop_service("stubborn").await?;
    assert_eq!(sup.state_of("stubborn").await?, ServiceState::Stopped);

    Ok(())
}

#[tokio::test]
async fn launch_failure_surfaces_without_affecting_others() -> TestResult {
    let dir = tempdir()?;
    let mut broken = sh("broken", "true", &[]);
    broken.executable = PathBuf::from("/no/such/binary");

    let sup = supervisor(vec![broken, sh("db", "sleep 30", &[])], dir.path())?;

    let failures = sup.start_all().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].service_id, "broken");
    assert!(matches!(failures[0].error, SupervisorError::Launch { .. }));

    let monitor = HealthMonitor::new(Arc::clone(&sup), Duration::from_millis(50));
    monitor.tick().await;
    assert_eq!(sup.state_of("db").await?, ServiceState::Running);

    sup.stop_service("db").await?;
    Ok(())
}
