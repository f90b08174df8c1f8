// src/monitor/health.rs

//! Periodic health classification and auto-restart policy.
//!
//! [`check_service`] is the single classification step for one service:
//! poll liveness, drive the grace/ready transition, and on an unexpected
//! exit apply the restart policy. [`HealthMonitor`] runs it for every
//! registered service on a fixed interval, in dependency order so that a
//! crashed dependency is relaunched before its dependents are considered.
//!
//! Tests call [`HealthMonitor::tick`] (or `check_service` via
//! `Supervisor::state_of` polling) directly instead of sleeping through real
//! intervals.

use std::cmp::min;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::monitor::events::{EventReason, HealthEvent};
use crate::supervise::process::{ProcessHandle, ServiceState};
use crate::supervise::supervisor::{RestartIncident, Supervisor};

/// Upper bound on the computed restart backoff.
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Periodic driver over all registered services.
pub struct HealthMonitor {
    supervisor: Arc<Supervisor>,
    poll_interval: Duration,
}

impl HealthMonitor {
    pub fn new(supervisor: Arc<Supervisor>, poll_interval: Duration) -> Self {
        Self {
            supervisor,
            poll_interval,
        }
    }

    /// One monitoring pass over every service, in dependency order.
    pub async fn tick(&self) {
        for id in self.supervisor.start_order() {
            check_service(&self.supervisor, &id).await;
        }
    }

    /// Run the periodic loop until the task is aborted.
    pub async fn run(self) {
        info!(interval = ?self.poll_interval, "health monitor started");
        let mut ticker = interval(self.poll_interval);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }
}

/// What the locked classification phase decided to do next.
enum CrashAction {
    Nothing,
    /// Crashed with restart budget left; attempt a relaunch once the
    /// service's dependencies are Running.
    TryRelaunch,
}

/// Classify one service's current state and act on it.
///
/// Also used by `Supervisor::await_running`, so readiness progression does
/// not depend on the background monitor task being scheduled.
pub(crate) async fn check_service(supervisor: &Supervisor, id: &str) {
    let entry = match supervisor.entry(id) {
        Some(e) => e,
        None => return,
    };

    let action = {
        let mut guard = entry.runtime.lock().await;
        let rt = &mut *guard;

        let (previous, state, exit_code, ready_confirmed, grace_elapsed) =
            match rt.handle.as_mut() {
                Some(handle) => {
                    let previous = handle.state();
                    let state = handle.poll();
                    (
                        previous,
                        state,
                        handle.last_exit_code(),
                        handle.ready_confirmed(),
                        handle.grace_elapsed(),
                    )
                }
                None => return,
            };

        match state {
            ServiceState::Starting => {
                let reason = if ready_confirmed {
                    Some(EventReason::ReadyConfirmed)
                } else if grace_elapsed {
                    Some(EventReason::ReadyTimeout)
                } else {
                    None
                };

                if let Some(reason) = reason {
                    if let Some(handle) = rt.handle.as_mut() {
                        handle.mark_running();
                    }
                    rt.incident = None;
                    supervisor
                        .events()
                        .emit(
                            HealthEvent::now(
                                id,
                                ServiceState::Starting,
                                ServiceState::Running,
                                reason,
                                None,
                            )
                            .into(),
                        )
                        .await;
                }
                CrashAction::Nothing
            }

            ServiceState::Running | ServiceState::Stopped | ServiceState::Stopping => {
                CrashAction::Nothing
            }

            ServiceState::Crashed => {
                if rt.manual_stop {
                    // Exit raced with a requested stop; not a crash.
                    CrashAction::Nothing
                } else {
                    let fresh_crash =
                        matches!(previous, ServiceState::Starting | ServiceState::Running);

                    if fresh_crash {
                        warn!(service = %id, exit_code = ?exit_code, "service crashed");
                        supervisor
                            .events()
                            .emit(
                                HealthEvent::now(
                                    id,
                                    previous,
                                    ServiceState::Crashed,
                                    EventReason::Crash,
                                    Some(match exit_code {
                                        Some(code) => format!("exit code {code}"),
                                        None => "killed by signal".to_string(),
                                    }),
                                )
                                .into(),
                            )
                            .await;
                    }

                    evaluate_restart_policy(supervisor, id, rt, fresh_crash).await
                }
            }
        }
    };

    if matches!(action, CrashAction::TryRelaunch) {
        try_relaunch(supervisor, id, entry).await;
    }
}

/// Decide what to do about a crashed service. Runs with the runtime lock
/// held; the actual relaunch happens afterwards without it.
async fn evaluate_restart_policy(
    supervisor: &Supervisor,
    id: &str,
    rt: &mut crate::supervise::supervisor::ServiceRuntime,
    fresh_crash: bool,
) -> CrashAction {
    let descriptor = match supervisor.descriptor(id) {
        Some(d) => d,
        None => return CrashAction::Nothing,
    };

    if rt.exhausted {
        return CrashAction::Nothing;
    }

    if !descriptor.auto_restart {
        rt.exhausted = true;
        supervisor
            .events()
            .emit(
                HealthEvent::now(
                    id,
                    ServiceState::Crashed,
                    ServiceState::Crashed,
                    EventReason::RestartExhausted,
                    Some("auto-restart disabled; manual intervention required".to_string()),
                )
                .into(),
            )
            .await;
        return CrashAction::Nothing;
    }

    let now = Instant::now();
    let incident = rt.incident.get_or_insert_with(|| RestartIncident::new(now));

    if incident.attempts >= descriptor.max_restart_attempts {
        rt.exhausted = true;
        supervisor
            .events()
            .emit(
                HealthEvent::now(
                    id,
                    ServiceState::Crashed,
                    ServiceState::Crashed,
                    EventReason::RestartExhausted,
                    Some(format!(
                        "gave up after {} restart attempts; manual intervention required",
                        incident.attempts
                    )),
                )
                .into(),
            )
            .await;
        return CrashAction::Nothing;
    }

    if now < incident.next_allowed_at {
        if fresh_crash {
            debug!(
                service = %id,
                until = ?(incident.next_allowed_at - now),
                "restart deferred by backoff"
            );
        }
        return CrashAction::Nothing;
    }

    CrashAction::TryRelaunch
}

/// Relaunch a crashed service if its dependencies are Running.
///
/// The attempt is only charged when a launch actually happens; a crashed
/// service whose dependency is itself still starting is retried on a later
/// tick without consuming budget.
async fn try_relaunch(
    supervisor: &Supervisor,
    id: &str,
    entry: &Arc<crate::supervise::supervisor::ServiceEntry>,
) {
    for dep in supervisor.graph().dependencies_of(id) {
        match supervisor.state_of(dep).await {
            Ok(ServiceState::Running) => {}
            _ => {
                debug!(service = %id, dependency = %dep, "restart waiting on dependency");
                return;
            }
        }
    }

    let mut rt = entry.runtime.lock().await;

    // Re-verify under the lock; a manual stop or start may have intervened.
    if rt.manual_stop || rt.exhausted {
        return;
    }
    match rt.handle.as_ref().map(|h| h.state()) {
        Some(ServiceState::Crashed) => {}
        _ => return,
    }

    let descriptor = match supervisor.descriptor(id) {
        Some(d) => d.clone(),
        None => return,
    };

    let now = Instant::now();
    let incident = match rt.incident.as_mut() {
        Some(i) => i,
        None => return,
    };
    if incident.attempts >= descriptor.max_restart_attempts || now < incident.next_allowed_at {
        return;
    }

    incident.attempts += 1;
    let backoff = min(
        descriptor.restart_backoff * incident.attempts,
        BACKOFF_CAP,
    );
    incident.next_allowed_at = now + backoff;
    let attempt = incident.attempts;

    match ProcessHandle::launch(&descriptor, Arc::clone(supervisor.events())) {
        Ok(handle) => {
            info!(
                service = %id,
                attempt,
                max = descriptor.max_restart_attempts,
                "auto-restarting crashed service"
            );
            rt.handle = Some(handle);
            supervisor
                .events()
                .emit(
                    HealthEvent::now(
                        id,
                        ServiceState::Crashed,
                        ServiceState::Starting,
                        EventReason::RestartScheduled,
                        Some(format!(
                            "attempt {attempt} of {}",
                            descriptor.max_restart_attempts
                        )),
                    )
                    .into(),
                )
                .await;
        }
        Err(e) => {
            warn!(service = %id, error = %e, "auto-restart launch failed");
            supervisor
                .events()
                .emit(
                    HealthEvent::now(
                        id,
                        ServiceState::Crashed,
                        ServiceState::Crashed,
                        EventReason::LaunchFailed,
                        Some(e.to_string()),
                    )
                    .into(),
                )
                .await;
        }
    }
}
