// src/supervise/process.rs

//! One OS-level child process per start attempt.
//!
//! A [`ProcessHandle`] is created by `launch` and replaced wholesale on every
//! restart; stale handles are never reused. It owns the `tokio` child, drains
//! stdout/stderr into the service's log stream, and exposes non-blocking
//! liveness polling plus cooperative termination.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::errors::SupervisorError;
use crate::monitor::events::EventHub;
use crate::supervise::descriptor::ServiceDescriptor;

/// How long a forced kill may take to be confirmed before we give up and
/// report a shutdown timeout.
const FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(3);

/// Lifecycle state of one managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

/// Handle to one running attempt of a service.
pub struct ProcessHandle {
    service_id: String,
    child: Option<Child>,
    pid: Option<u32>,
    state: ServiceState,
    started_at: Instant,
    startup_grace: Duration,
    /// Set by the stdout drain task when the ready pattern matches.
    ready: Arc<AtomicBool>,
    last_exit_code: Option<i32>,
}

impl ProcessHandle {
    /// Spawn the OS process for `descriptor`.
    ///
    /// Fails with [`SupervisorError::Launch`] if the executable is missing or
    /// the OS refuses to spawn. On success the handle is in `Starting` state
    /// and stdout/stderr are being drained into the service's log stream.
    pub fn launch(
        descriptor: &ServiceDescriptor,
        events: Arc<EventHub>,
    ) -> Result<Self, SupervisorError> {
        if !descriptor.executable.is_file() {
            return Err(SupervisorError::Launch {
                service: descriptor.id.clone(),
                reason: format!("executable not found: {:?}", descriptor.executable),
            });
        }

        let mut cmd = Command::new(&descriptor.executable);
        cmd.args(&descriptor.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = descriptor.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| SupervisorError::Launch {
            service: descriptor.id.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id();
        let ready = Arc::new(AtomicBool::new(false));

        if let Some(stdout) = child.stdout.take() {
            spawn_stdout_drain(
                descriptor.id.clone(),
                stdout,
                descriptor.ready_pattern.clone(),
                Arc::clone(&ready),
                Arc::clone(&events),
            );
        }

        if let Some(stderr) = child.stderr.take() {
            let service_id = descriptor.id.clone();
            let events = Arc::clone(&events);
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    events
                        .append_stream(&service_id, &format!("stderr: {line}"))
                        .await;
                }
            });
        }

        debug!(service = %descriptor.id, pid = ?pid, "process spawned");

        Ok(Self {
            service_id: descriptor.id.clone(),
            child: Some(child),
            pid,
            state: ServiceState::Starting,
            started_at: Instant::now(),
            startup_grace: descriptor.startup_grace,
            ready,
            last_exit_code: None,
        })
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        self.last_exit_code
    }

    /// True once the ready pattern has matched on stdout.
    pub fn ready_confirmed(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// True once the startup grace period has elapsed.
    pub fn grace_elapsed(&self) -> bool {
        self.started_at.elapsed() >= self.startup_grace
    }

    /// Non-blocking liveness check.
    ///
    /// Transitions `Starting`/`Running` to `Crashed` when the process has
    /// exited without a stop having been requested, and `Stopping` to
    /// `Stopped` once the requested exit is observed. Never promotes to
    /// `Running`; readiness classification belongs to the health monitor.
    pub fn poll(&mut self) -> ServiceState {
        let child = match self.child.as_mut() {
            Some(c) => c,
            None => return self.state,
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                self.last_exit_code = status.code();
                self.pid = None;
                self.state = match self.state {
                    ServiceState::Stopping | ServiceState::Stopped => ServiceState::Stopped,
                    _ => ServiceState::Crashed,
                };
                self.child = None;
                self.state
            }
            Ok(None) => self.state,
            Err(e) => {
                warn!(service = %self.service_id, error = %e, "liveness poll failed");
                self.state
            }
        }
    }

    /// Promote `Starting` to `Running`. Caller (the health monitor) is
    /// responsible for having checked liveness and readiness first.
    pub(crate) fn mark_running(&mut self) {
        if self.state == ServiceState::Starting {
            self.state = ServiceState::Running;
        }
    }

    /// Request cooperative shutdown, escalating to a forced kill after
    /// `grace`.
    ///
    /// Idempotent: terminating an already-exited handle is a no-op. Fails
    /// with [`SupervisorError::ShutdownTimeout`] only if the process survives
    /// both the termination signal and the kill.
    pub async fn terminate(&mut self, grace: Duration) -> Result<(), SupervisorError> {
        // Settle any already-observed exit first.
        if self.poll() == ServiceState::Crashed {
            self.state = ServiceState::Stopped;
        }

        let child = match self.child.as_mut() {
            Some(c) => c,
            None => {
                self.state = ServiceState::Stopped;
                return Ok(());
            }
        };

        self.state = ServiceState::Stopping;
        send_term_signal(child, &self.service_id);

        if let Ok(status) = timeout(grace, child.wait()).await {
            let status = status.map_err(|e| SupervisorError::Launch {
                service: self.service_id.clone(),
                reason: format!("waiting for process exit: {e}"),
            })?;
            self.finish_stopped(status.code());
            return Ok(());
        }

        warn!(
            service = %self.service_id,
            grace = ?grace,
            "graceful shutdown timed out; force killing"
        );

        let Some(child) = self.child.as_mut() else {
            self.state = ServiceState::Stopped;
            return Ok(());
        };
        let _ = child.start_kill();

        match timeout(FORCE_KILL_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                self.finish_stopped(status.code());
                Ok(())
            }
            _ => Err(SupervisorError::ShutdownTimeout {
                service: self.service_id.clone(),
                grace,
            }),
        }
    }

    fn finish_stopped(&mut self, exit_code: Option<i32>) {
        self.last_exit_code = exit_code;
        self.pid = None;
        self.child = None;
        self.state = ServiceState::Stopped;
    }
}

/// Send the platform's cooperative termination signal.
#[cfg(unix)]
fn send_term_signal(child: &Child, service_id: &str) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(service = %service_id, pid, error = %e, "failed to send SIGTERM");
            }
        }
        None => debug!(service = %service_id, "no pid; process already exited"),
    }
}

#[cfg(not(unix))]
fn send_term_signal(child: &Child, service_id: &str) {
    // No portable cooperative signal; the grace wait below still gives the
    // process a chance to exit before the forced kill.
    let _ = (child, service_id);
}

fn spawn_stdout_drain(
    service_id: String,
    stdout: tokio::process::ChildStdout,
    ready_pattern: Option<regex::Regex>,
    ready: Arc<AtomicBool>,
    events: Arc<EventHub>,
) {
    tokio::spawn(async move {
        let reader = BufReader::new(stdout);
        let mut lines = reader.lines();

        while let Ok(Some(line)) = lines.next_line().await {
            events
                .append_stream(&service_id, &format!("stdout: {line}"))
                .await;

            if let Some(re) = &ready_pattern {
                if !ready.load(Ordering::Relaxed) && re.is_match(&line) {
                    debug!(service = %service_id, "ready pattern matched on stdout");
                    ready.store(true, Ordering::Relaxed);
                }
            }
        }

        debug!(service = %service_id, "stdout drain ended");
    });
}
