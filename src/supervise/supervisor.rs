// src/supervise/supervisor.rs

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::backup::MaintenanceLock;
use crate::errors::SupervisorError;
use crate::monitor::events::{EventHub, EventReason, HealthEvent};
use crate::monitor::health;
use crate::supervise::descriptor::ServiceDescriptor;
use crate::supervise::order::DependencyGraph;
use crate::supervise::process::{ProcessHandle, ServiceState};

/// How often `start_all` re-polls a dependency while waiting for it to
/// become Running.
const AWAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Extra time on top of a dependency's startup grace before `start_all`
/// gives up waiting for it.
const AWAIT_MARGIN: Duration = Duration::from_secs(5);

/// Per-service crash/restart bookkeeping for one incident.
///
/// Created on the first crash, reset once the service reaches Running, and
/// discarded entirely on a manual stop.
#[derive(Debug, Clone)]
pub struct RestartIncident {
    pub attempts: u32,
    pub first_failure_at: Instant,
    /// Backoff gate: no restart attempt before this time.
    pub next_allowed_at: Instant,
}

impl RestartIncident {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            attempts: 0,
            first_failure_at: now,
            next_allowed_at: now,
        }
    }
}

/// Mutable per-service state, guarded by the entry's lifecycle mutex.
pub(crate) struct ServiceRuntime {
    /// Live handle for the current attempt; a fresh one replaces it on every
    /// start.
    pub(crate) handle: Option<ProcessHandle>,
    pub(crate) incident: Option<RestartIncident>,
    /// Set by `stop_service`; suppresses crash classification and
    /// auto-restart.
    pub(crate) manual_stop: bool,
    /// Restart policy ran out; the Crashed state is terminal until a manual
    /// start.
    pub(crate) exhausted: bool,
}

pub(crate) struct ServiceEntry {
    pub(crate) descriptor: ServiceDescriptor,
    /// Serializes lifecycle transitions per service: a restart in progress
    /// blocks a concurrent stop and vice versa. Unrelated services proceed
    /// concurrently.
    pub(crate) runtime: Mutex<ServiceRuntime>,
}

/// A per-service failure from `start_all` / `stop_all`.
#[derive(Debug)]
pub struct BulkFailure {
    pub service_id: String,
    pub error: SupervisorError,
}

/// Owns the set of registered services and their live process handles.
///
/// One supervisor instance per control process; nothing here is a global, so
/// tests can run several independent supervisors side by side. The
/// supervisor itself is stateless across restarts of the control process: on
/// construction no service is assumed running.
pub struct Supervisor {
    services: HashMap<String, Arc<ServiceEntry>>,
    graph: DependencyGraph,
    events: Arc<EventHub>,
    maintenance: MaintenanceLock,
    /// Service id whose lifecycle shares the maintenance lock with
    /// backup/restore jobs.
    db_service: Option<String>,
    shutdown_grace: Duration,
}

impl Supervisor {
    /// Register the given descriptors.
    ///
    /// Fails with `CyclicDependency` if the `depends_on` relation has a
    /// cycle; the check runs once here, before any process is touched.
    pub fn new(
        descriptors: Vec<ServiceDescriptor>,
        events: Arc<EventHub>,
        maintenance: MaintenanceLock,
        db_service: Option<String>,
        shutdown_grace: Duration,
    ) -> Result<Self, SupervisorError> {
        let graph = DependencyGraph::new(
            descriptors
                .iter()
                .map(|d| (d.id.as_str(), d.depends_on.as_slice())),
        )?;

        let mut services = HashMap::new();
        for descriptor in descriptors {
            let id = descriptor.id.clone();
            services.insert(
                id,
                Arc::new(ServiceEntry {
                    descriptor,
                    runtime: Mutex::new(ServiceRuntime {
                        handle: None,
                        incident: None,
                        manual_stop: false,
                        exhausted: false,
                    }),
                }),
            );
        }

        Ok(Self {
            services,
            graph,
            events,
            maintenance,
            db_service,
            shutdown_grace,
        })
    }

    /// Registered service ids in dependency (start) order.
    pub fn start_order(&self) -> Vec<String> {
        self.graph
            .start_order()
            .iter()
            .filter(|id| self.services.contains_key(*id))
            .cloned()
            .collect()
    }

    pub fn descriptor(&self, id: &str) -> Option<&ServiceDescriptor> {
        self.services.get(id).map(|e| &e.descriptor)
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    pub(crate) fn entry(&self, id: &str) -> Option<&Arc<ServiceEntry>> {
        self.services.get(id)
    }

    pub(crate) fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub(crate) fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Current lifecycle state of a service, polling the OS first.
    pub async fn state_of(&self, id: &str) -> Result<ServiceState, SupervisorError> {
        let entry = self
            .services
            .get(id)
            .ok_or_else(|| SupervisorError::UnknownService(id.to_string()))?;

        let mut rt = entry.runtime.lock().await;
        Ok(match rt.handle.as_mut() {
            Some(handle) => handle.poll(),
            None => ServiceState::Stopped,
        })
    }

    /// Launch a service.
    ///
    /// Fails with `UnknownService`, `DependencyNotReady` (without spawning
    /// anything), `MaintenanceBusy` for the database service while a job
    /// runs, or `Launch` if the spawn itself fails. Starting a service that
    /// is already Starting or Running is a no-op.
    pub async fn start_service(&self, id: &str) -> Result<(), SupervisorError> {
        let entry = self
            .services
            .get(id)
            .ok_or_else(|| SupervisorError::UnknownService(id.to_string()))?;

        let _guard = self.maintenance_guard_for(id)?;
        self.ensure_dependencies_running(id).await?;

        let mut rt = entry.runtime.lock().await;

        let previous = match rt.handle.as_mut() {
            Some(handle) => match handle.poll() {
                ServiceState::Starting | ServiceState::Running => {
                    debug!(service = %id, "already running; start is a no-op");
                    return Ok(());
                }
                state => state,
            },
            None => ServiceState::Stopped,
        };

        let handle = match ProcessHandle::launch(&entry.descriptor, Arc::clone(&self.events)) {
            Ok(h) => h,
            Err(e) => {
                self.events
                    .emit(
                        HealthEvent::now(
                            id,
                            previous,
                            previous,
                            EventReason::LaunchFailed,
                            Some(e.to_string()),
                        )
                        .into(),
                    )
                    .await;
                return Err(e);
            }
        };

        info!(service = %id, pid = ?handle.pid(), "service starting");

        rt.handle = Some(handle);
        rt.manual_stop = false;
        rt.exhausted = false;
        rt.incident = None;

        self.events
            .emit(
                HealthEvent::now(
                    id,
                    previous,
                    ServiceState::Starting,
                    EventReason::Launched,
                    None,
                )
                .into(),
            )
            .await;

        Ok(())
    }

    /// Stop a service and wait for it to exit.
    ///
    /// Marks the stop as manual first, so the monitor never classifies the
    /// exit as a crash, and discards the restart incident. Returns
    /// `ShutdownTimeout` if the process survives both the termination signal
    /// and the forced kill; the handle then stays in `Stopping` and the call
    /// may be retried.
    pub async fn stop_service(&self, id: &str) -> Result<(), SupervisorError> {
        let entry = self
            .services
            .get(id)
            .ok_or_else(|| SupervisorError::UnknownService(id.to_string()))?;

        let _guard = self.maintenance_guard_for(id)?;

        let mut rt = entry.runtime.lock().await;
        rt.manual_stop = true;
        rt.incident = None;
        rt.exhausted = false;

        let handle = match rt.handle.as_mut() {
            Some(h) => h,
            None => return Ok(()),
        };

        let previous = handle.state();
        if previous == ServiceState::Stopped {
            return Ok(());
        }

        handle.terminate(self.shutdown_grace).await?;

        info!(service = %id, "service stopped");

        self.events
            .emit(
                HealthEvent::now(
                    id,
                    previous,
                    ServiceState::Stopped,
                    EventReason::ManualStop,
                    None,
                )
                .into(),
            )
            .await;

        Ok(())
    }

    /// Stop-then-start; preserves no partial state.
    pub async fn restart_service(&self, id: &str) -> Result<(), SupervisorError> {
        self.stop_service(id).await?;
        self.start_service(id).await
    }

    /// Start every service in dependency order, waiting for each dependency
    /// to become Running before its dependents start.
    ///
    /// Individual failures don't abort the rest of the stack; they are
    /// returned so the caller can surface them.
    pub async fn start_all(&self) -> Vec<BulkFailure> {
        let mut failures = Vec::new();

        'services: for id in self.start_order() {
            for dep in self.graph.dependencies_of(&id) {
                if !self.services.contains_key(dep) {
                    failures.push(BulkFailure {
                        service_id: id.clone(),
                        error: SupervisorError::DependencyNotReady {
                            service: id.clone(),
                            dependency: dep.clone(),
                        },
                    });
                    continue 'services;
                }

                if !self.await_running(dep).await {
                    failures.push(BulkFailure {
                        service_id: id.clone(),
                        error: SupervisorError::DependencyNotReady {
                            service: id.clone(),
                            dependency: dep.clone(),
                        },
                    });
                    continue 'services;
                }
            }

            if let Err(error) = self.start_service(&id).await {
                warn!(service = %id, error = %error, "start_all: service failed to start");
                failures.push(BulkFailure {
                    service_id: id,
                    error,
                });
            }
        }

        failures
    }

    /// Stop every service in reverse dependency order.
    pub async fn stop_all(&self) -> Vec<BulkFailure> {
        let mut failures = Vec::new();

        for id in self.graph.stop_order() {
            if !self.services.contains_key(&id) {
                continue;
            }
            if let Err(error) = self.stop_service(&id).await {
                warn!(service = %id, error = %error, "stop_all: service failed to stop");
                failures.push(BulkFailure {
                    service_id: id,
                    error,
                });
            }
        }

        failures
    }

    /// Poll a service until it reaches Running, driving readiness
    /// classification inline so no background monitor is required.
    ///
    /// Gives up after the service's startup grace plus a margin, or as soon
    /// as the service lands in a state it cannot leave on its own.
    async fn await_running(&self, id: &str) -> bool {
        let grace = self
            .descriptor(id)
            .map(|d| d.startup_grace)
            .unwrap_or_default();
        let deadline = Instant::now() + grace + AWAIT_MARGIN;

        loop {
            health::check_service(self, id).await;

            match self.state_of(id).await {
                Ok(ServiceState::Running) => return true,
                Ok(ServiceState::Starting) => {}
                // Crashed may recover via auto-restart; keep polling until
                // the deadline.
                Ok(ServiceState::Crashed) => {}
                Ok(ServiceState::Stopped) | Ok(ServiceState::Stopping) => return false,
                Err(_) => return false,
            }

            if Instant::now() >= deadline {
                return false;
            }

            sleep(AWAIT_POLL_INTERVAL).await;
        }
    }

    /// Fail with `DependencyNotReady` unless every dependency is Running.
    async fn ensure_dependencies_running(&self, id: &str) -> Result<(), SupervisorError> {
        for dep in self.graph.dependencies_of(id) {
            let running = match self.services.get(dep) {
                Some(_) => self.state_of(dep).await? == ServiceState::Running,
                None => false,
            };

            if !running {
                return Err(SupervisorError::DependencyNotReady {
                    service: id.to_string(),
                    dependency: dep.clone(),
                });
            }
        }
        Ok(())
    }

    /// Hold the maintenance lock for the duration of a lifecycle operation
    /// on the database service; other services are unaffected.
    fn maintenance_guard_for(
        &self,
        id: &str,
    ) -> Result<Option<crate::backup::MaintenanceGuard>, SupervisorError> {
        if self.db_service.as_deref() == Some(id) {
            match self.maintenance.try_acquire() {
                Some(guard) => Ok(Some(guard)),
                None => Err(SupervisorError::MaintenanceBusy(id.to_string())),
            }
        } else {
            Ok(None)
        }
    }
}
