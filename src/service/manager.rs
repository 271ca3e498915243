//! Supervises a set of services with declared start-up dependencies.
//!
//! Services without dependencies start concurrently. A service that depends
//! on others starts only after all of them are RUNNING, and is stopped
//! without ever starting if one of them does not get there. The first
//! service to reach FAILED triggers `stop_all` for the rest.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::error::{Classify, FailureClass};
use crate::event_bus::{EventBus, OperatorEvent};
use crate::service::{ManagedService, Service, ServiceError, ServiceState};

/// Default time allowed for services to stop before they are force-failed
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ServiceManagerConfig {
    pub shutdown_grace_period: Duration,
}

impl Default for ServiceManagerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_period: DEFAULT_SHUTDOWN_GRACE_PERIOD,
        }
    }
}

/// A service that ended in FAILED
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFailure {
    pub service: String,
    pub reason: String,
}

impl fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.service, self.reason)
    }
}

#[derive(Error, Debug)]
pub enum ServiceManagerError {
    #[error("duplicate service name '{0}'")]
    DuplicateService(String),

    #[error("service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("dependency cycle between services: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("service '{service}' reached {state} instead of RUNNING")]
    NotHealthy {
        service: String,
        state: ServiceState,
    },

    #[error(
        "{} service(s) failed: {}",
        .0.len(),
        .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
    )]
    ServicesFailed(Vec<ServiceFailure>),
}

impl Classify for ServiceManagerError {
    fn class(&self) -> FailureClass {
        match self {
            ServiceManagerError::DuplicateService(_)
            | ServiceManagerError::UnknownDependency { .. }
            | ServiceManagerError::DependencyCycle(_) => FailureClass::FatalStartup,
            ServiceManagerError::NotHealthy { .. } | ServiceManagerError::ServicesFailed(_) => {
                FailureClass::ServiceCrash
            }
        }
    }
}

/// Collects services and their dependencies, then validates the graph.
#[derive(Default)]
pub struct ServiceManagerBuilder {
    config: ServiceManagerConfig,
    services: Vec<(Arc<dyn Service>, Vec<String>)>,
    bus: Option<EventBus>,
}

impl ServiceManagerBuilder {
    pub fn new(config: ServiceManagerConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn service(self, service: Arc<dyn Service>) -> Self {
        self.service_with_deps(service, &[])
    }

    /// Add a service that starts only once every named dependency is RUNNING.
    pub fn service_with_deps(mut self, service: Arc<dyn Service>, deps: &[&str]) -> Self {
        self.services
            .push((service, deps.iter().map(|d| d.to_string()).collect()));
        self
    }

    /// Publish `ServiceStateChanged` events on this bus
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<ServiceManager, ServiceManagerError> {
        let mut seen = HashSet::new();
        for (svc, _) in &self.services {
            if !seen.insert(svc.name().to_string()) {
                return Err(ServiceManagerError::DuplicateService(svc.name().to_string()));
            }
        }

        let mut dependencies = HashMap::new();
        for (svc, deps) in &self.services {
            for dep in deps {
                if !seen.contains(dep) {
                    return Err(ServiceManagerError::UnknownDependency {
                        service: svc.name().to_string(),
                        dependency: dep.clone(),
                    });
                }
            }
            dependencies.insert(svc.name().to_string(), deps.clone());
        }

        if let Some(cycle) = find_cycle(&dependencies) {
            return Err(ServiceManagerError::DependencyCycle(cycle));
        }

        let services = self
            .services
            .into_iter()
            .map(|(svc, _)| ManagedService::new(svc))
            .collect();

        Ok(ServiceManager {
            inner: Arc::new(ManagerInner {
                services,
                dependencies,
                config: self.config,
                bus: self.bus,
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
            }),
        })
    }
}

/// Services left over after repeatedly removing those whose dependencies are
/// all removed; a non-empty remainder contains a cycle.
fn find_cycle(dependencies: &HashMap<String, Vec<String>>) -> Option<Vec<String>> {
    let mut remaining: HashMap<&str, &Vec<String>> = dependencies
        .iter()
        .map(|(name, deps)| (name.as_str(), deps))
        .collect();

    loop {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.iter().all(|d| !remaining.contains_key(d.as_str())))
            .map(|(name, _)| *name)
            .collect();

        if ready.is_empty() {
            break;
        }
        for name in ready {
            remaining.remove(name);
        }
    }

    if remaining.is_empty() {
        None
    } else {
        let mut names: Vec<String> = remaining.keys().map(|n| n.to_string()).collect();
        names.sort();
        Some(names)
    }
}

struct ManagerInner {
    services: Vec<Arc<ManagedService>>,
    dependencies: HashMap<String, Vec<String>>,
    config: ServiceManagerConfig,
    bus: Option<EventBus>,
    started: AtomicBool,
    stopping: AtomicBool,
}

/// Owns and supervises every service of the process.
#[derive(Clone)]
pub struct ServiceManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceManager")
            .field("services", &self.states())
            .finish()
    }
}

impl ServiceManager {
    pub fn builder(config: ServiceManagerConfig) -> ServiceManagerBuilder {
        ServiceManagerBuilder::new(config)
    }

    pub fn service(&self, name: &str) -> Option<&Arc<ManagedService>> {
        self.inner.services.iter().find(|s| s.name() == name)
    }

    /// Snapshot of every service's state, in registration order
    pub fn states(&self) -> Vec<(String, ServiceState)> {
        self.inner
            .services
            .iter()
            .map(|s| (s.name().to_string(), s.state()))
            .collect()
    }

    /// Start every service, honoring dependencies. Only the first call has an
    /// effect. Must be called from within a Tokio runtime.
    pub fn start_all(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("start_all already called");
            return;
        }
        info!(services = self.inner.services.len(), "Starting services");

        for svc in &self.inner.services {
            let manager = self.clone();
            let svc_for_monitor = Arc::clone(svc);
            tokio::spawn(
                async move { manager.monitor(svc_for_monitor).await }
                    .instrument(info_span!("monitor", service = %svc.name())),
            );
        }

        for svc in &self.inner.services {
            let deps: Vec<Arc<ManagedService>> = self
                .inner
                .dependencies
                .get(svc.name())
                .into_iter()
                .flatten()
                .filter_map(|d| self.service(d).cloned())
                .collect();

            if deps.is_empty() {
                svc.start();
                continue;
            }

            let svc = Arc::clone(svc);
            tokio::spawn(async move {
                for dep in deps {
                    let state = dep.await_started().await;
                    if state != ServiceState::Running {
                        warn!(
                            service = %svc.name(),
                            dependency = %dep.name(),
                            dependency_state = %state,
                            "Dependency did not reach RUNNING, not starting service"
                        );
                        svc.stop();
                        return;
                    }
                }
                svc.start();
            });
        }
    }

    /// Stop every service and wait up to the grace period for them to
    /// terminate. Services still running afterwards are force-failed; their
    /// names are returned.
    pub async fn stop_all(&self) -> Vec<String> {
        self.inner.stopping.store(true, Ordering::SeqCst);
        let grace = self.inner.config.shutdown_grace_period;
        info!(grace_secs = grace.as_secs_f64(), "Stopping all services");

        for svc in &self.inner.services {
            svc.stop();
        }

        let waits = join_all(self.inner.services.iter().map(|s| s.await_terminal()));
        if tokio::time::timeout(grace, waits).await.is_ok() {
            info!("All services stopped");
            return Vec::new();
        }

        let mut forced = Vec::new();
        for svc in &self.inner.services {
            if !svc.state().is_terminal() {
                error!(service = %svc.name(), state = %svc.state(), "Service did not stop within grace period");
                svc.force_fail(ServiceError::StopTimeout(grace));
                forced.push(svc.name().to_string());
            }
        }
        forced
    }

    /// Wait until every service is RUNNING.
    ///
    /// Fails as soon as a service is seen in any other state after leaving
    /// STARTING.
    pub async fn await_healthy(&self) -> Result<(), ServiceManagerError> {
        for svc in &self.inner.services {
            let state = svc.await_started().await;
            if state != ServiceState::Running {
                return Err(ServiceManagerError::NotHealthy {
                    service: svc.name().to_string(),
                    state,
                });
            }
        }
        Ok(())
    }

    /// Wait until every service is terminal; errors if any of them FAILED.
    pub async fn await_termination(&self) -> Result<(), ServiceManagerError> {
        join_all(self.inner.services.iter().map(|s| s.await_terminal())).await;

        let failures: Vec<ServiceFailure> = self
            .inner
            .services
            .iter()
            .filter(|s| s.state() == ServiceState::Failed)
            .map(|s| ServiceFailure {
                service: s.name().to_string(),
                reason: s.failure_cause().unwrap_or("unknown").to_string(),
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ServiceManagerError::ServicesFailed(failures))
        }
    }

    async fn monitor(self, svc: Arc<ManagedService>) {
        let mut rx = svc.subscribe();
        loop {
            let state = *rx.borrow_and_update();

            if let Some(bus) = &self.inner.bus {
                bus.publish(OperatorEvent::ServiceStateChanged {
                    service: svc.name().to_string(),
                    state,
                })
                .await;
            }

            if state == ServiceState::Failed {
                self.on_failure(&svc);
            }
            if state.is_terminal() || rx.changed().await.is_err() {
                break;
            }
        }
    }

    fn on_failure(&self, svc: &ManagedService) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(
            service = %svc.name(),
            reason = svc.failure_cause().unwrap_or("unknown"),
            "Service failed, stopping all services"
        );
        let manager = self.clone();
        tokio::spawn(async move {
            manager.stop_all().await;
        });
    }
}
