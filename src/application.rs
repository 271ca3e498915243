//! Process-level sequencing: version gate, then preflight, then services.
//!
//! Nothing is started until both gates pass. Once services run, the
//! application waits for either the shutdown signal or for the services to
//! terminate on their own (which only happens after a failure).

use std::future::Future;
use std::sync::Arc;

use kube::Client;
use thiserror::Error;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::{ConfigError, OperatorConfig};
use crate::controller::{
    ControllerService, KubeResourceClient, KubeWatchSource, ObservedGenerationReconciler,
};
use crate::crd::{GROUP, WATCHED_KINDS};
use crate::error::{Classify, FailureClass};
use crate::event_bus::EventBus;
use crate::health::{HealthServer, HealthState, subscribe_metrics};
use crate::preflight::checks::{
    AccessReviewCheck, CrdInstalledCheck, ResourcePermission, StorageClassCheck,
};
use crate::preflight::{AggregatedFailure, PreflightCheck, PreflightRunner};
use crate::service::leader::{LEADER_SERVICE_NAME, LeaderElectionService};
use crate::service::{
    Service, ServiceManager, ServiceManagerBuilder, ServiceManagerConfig, ServiceManagerError,
};
use crate::version::{VersionError, VersionGate, VersionSource};

/// Exit code for failures before any service started
pub const EXIT_STARTUP_FAILURE: u8 = 2;
/// Exit code when a supervised service failed
pub const EXIT_SERVICE_FAILURE: u8 = 1;

#[derive(Error, Debug)]
pub enum ApplicationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Preflight(#[from] AggregatedFailure),

    #[error(transparent)]
    Services(#[from] ServiceManagerError),
}

impl Classify for ApplicationError {
    fn class(&self) -> FailureClass {
        match self {
            ApplicationError::Config(e) => e.class(),
            ApplicationError::Version(e) => e.class(),
            ApplicationError::Preflight(e) => e.class(),
            ApplicationError::Services(e) => e.class(),
        }
    }
}

impl ApplicationError {
    pub fn exit_code(&self) -> u8 {
        if self.class() == FailureClass::FatalStartup {
            EXIT_STARTUP_FAILURE
        } else {
            EXIT_SERVICE_FAILURE
        }
    }
}

/// Assembles an [`Application`].
pub struct ApplicationBuilder {
    gate: VersionGate,
    version_source: Option<Arc<dyn VersionSource>>,
    runner: PreflightRunner,
    checks: Vec<Box<dyn PreflightCheck>>,
    bus: EventBus,
    services: ServiceManagerBuilder,
    health: Option<Arc<HealthState>>,
}

impl ApplicationBuilder {
    fn new(config: ServiceManagerConfig) -> Self {
        Self {
            gate: VersionGate::disabled(),
            version_source: None,
            runner: PreflightRunner::default(),
            checks: Vec::new(),
            bus: EventBus::default(),
            services: ServiceManager::builder(config),
            health: None,
        }
    }

    pub fn version_gate(mut self, gate: VersionGate, source: Arc<dyn VersionSource>) -> Self {
        self.gate = gate;
        self.version_source = Some(source);
        self
    }

    pub fn preflight_runner(mut self, runner: PreflightRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn check(mut self, check: Box<dyn PreflightCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// The bus services were built with; service state changes are
    /// published on it too.
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn service(mut self, service: Arc<dyn Service>) -> Self {
        self.services = self.services.service(service);
        self
    }

    pub fn service_with_deps(mut self, service: Arc<dyn Service>, deps: &[&str]) -> Self {
        self.services = self.services.service_with_deps(service, deps);
        self
    }

    /// Readiness is reported here once every service is RUNNING
    pub fn health_state(mut self, health: Arc<HealthState>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> Result<Application, ApplicationError> {
        let manager = self.services.event_bus(self.bus.clone()).build()?;
        Ok(Application {
            gate: self.gate,
            version_source: self.version_source,
            runner: self.runner,
            checks: self.checks,
            bus: self.bus,
            manager,
            health: self.health,
        })
    }
}

pub struct Application {
    gate: VersionGate,
    version_source: Option<Arc<dyn VersionSource>>,
    runner: PreflightRunner,
    checks: Vec<Box<dyn PreflightCheck>>,
    bus: EventBus,
    manager: ServiceManager,
    health: Option<Arc<HealthState>>,
}

impl Application {
    pub fn builder(config: ServiceManagerConfig) -> ApplicationBuilder {
        ApplicationBuilder::new(config)
    }

    /// Wire the operator against a live cluster.
    pub fn for_cluster(config: &OperatorConfig, client: Client) -> Result<Self, ApplicationError> {
        let bus = EventBus::new(config.event_bus.clone());
        let health = Arc::new(HealthState::new());
        subscribe_metrics(&bus, health.clone());

        let gate = match config.version_requirement {
            Some(requirement) => VersionGate::new(requirement, config.version_retry.clone()),
            None => VersionGate::disabled(),
        };

        let mut builder = Application::builder(config.manager.clone())
            .version_gate(gate, Arc::new(client.clone()))
            .preflight_runner(PreflightRunner::new(config.preflight_timeout))
            .event_bus(bus.clone())
            .health_state(health.clone())
            .service(Arc::new(HealthServer::new(health, config.health_port)));

        let mut permissions = Vec::new();
        for kind in WATCHED_KINDS {
            builder = builder.check(Box::new(CrdInstalledCheck::new(
                client.clone(),
                kind.crd_name(),
            )));
            permissions.push(ResourcePermission::new(
                GROUP,
                kind.plural,
                &["get", "list", "watch", "patch"],
            ));
        }
        if config.leader_election.is_some() {
            permissions.push(ResourcePermission::new(
                "coordination.k8s.io",
                "leases",
                &["get", "create", "update"],
            ));
        }
        builder = builder.check(Box::new(AccessReviewCheck::new(
            client.clone(),
            config.namespace.clone(),
            permissions,
        )));
        if config.require_storage_class {
            builder = builder.check(Box::new(StorageClassCheck::new(client.clone())));
        }

        let deps: &[&str] = match &config.leader_election {
            Some(leader) => {
                builder = builder.service(Arc::new(LeaderElectionService::new(
                    client.clone(),
                    leader.clone(),
                )));
                &[LEADER_SERVICE_NAME]
            }
            None => &[],
        };

        for kind in WATCHED_KINDS {
            let ar = kind.api_resource();
            let controller = ControllerService::new(
                KubeWatchSource::new(client.clone(), config.namespace.as_deref(), &ar),
                ObservedGenerationReconciler::new(KubeResourceClient::new(client.clone(), ar)),
                bus.clone(),
                config.controller.clone(),
            );
            builder = builder.service_with_deps(Arc::new(controller), deps);
        }

        builder.build()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn manager(&self) -> &ServiceManager {
        &self.manager
    }

    /// Run to completion.
    ///
    /// Returns once `shutdown` resolves and every service has stopped, or
    /// once the services terminated on their own.
    pub async fn run<S>(self, shutdown: S) -> Result<(), ApplicationError>
    where
        S: Future<Output = ()>,
    {
        let span = info_span!("application");
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner<S>(self, shutdown: S) -> Result<(), ApplicationError>
    where
        S: Future<Output = ()>,
    {
        match &self.version_source {
            Some(source) => {
                self.gate.verify(source.as_ref()).await?;
            }
            None => warn!("No version source configured, skipping Kubernetes version check"),
        }

        self.runner.run(&self.checks).await?;

        let manager = &self.manager;
        manager.start_all();

        let healthy = manager.await_healthy();
        let termination = manager.await_termination();
        tokio::pin!(shutdown, healthy, termination);
        let mut healthy_done = false;

        loop {
            tokio::select! {
                result = &mut healthy, if !healthy_done => {
                    healthy_done = true;
                    match result {
                        Ok(()) => {
                            info!("All services running, operator ready");
                            self.set_ready(true);
                        }
                        Err(e) => warn!(error = %e, "Services did not all reach RUNNING"),
                    }
                }
                result = &mut termination => {
                    self.set_ready(false);
                    if let Err(e) = &result {
                        error!(error = %e, "Services terminated");
                    }
                    return result.map_err(Into::into);
                }
                _ = &mut shutdown => {
                    info!("Received shutdown signal, initiating graceful shutdown");
                    break;
                }
            }
        }

        self.set_ready(false);
        let forced = manager.stop_all().await;
        if !forced.is_empty() {
            warn!(services = ?forced, "Services force-stopped after grace period");
        }
        manager.await_termination().await?;
        info!("All services stopped");
        Ok(())
    }

    fn set_ready(&self, ready: bool) {
        if let Some(health) = &self.health {
            health.set_ready(ready);
        }
    }
}
