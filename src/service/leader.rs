//! Leader election as a supervised service.
//!
//! The service reaches RUNNING once it holds the lease, so controllers that
//! declare it as a dependency only start on the leader. Losing the lease, or
//! failing to renew it, fails the service, which makes the manager stop
//! everything and the process exit for Kubernetes to restart it.

use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::retry::sleep_or_cancel;
use crate::service::{Service, ServiceError};

pub const LEADER_SERVICE_NAME: &str = "leader-election";

#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    pub namespace: String,
    pub holder_id: String,
    pub lease_ttl: Duration,
    pub renew_interval: Duration,
}

impl LeaderElectionConfig {
    pub fn new(namespace: impl Into<String>, holder_id: impl Into<String>) -> Self {
        Self {
            lease_name: "cassandra-operator-leader".to_string(),
            namespace: namespace.into(),
            holder_id: holder_id.into(),
            lease_ttl: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
        }
    }
}

pub struct LeaderElectionService {
    lock: LeaseLock,
    config: LeaderElectionConfig,
}

impl LeaderElectionService {
    pub fn new(client: Client, config: LeaderElectionConfig) -> Self {
        let lock = LeaseLock::new(
            client,
            &config.namespace,
            LeaseLockParams {
                holder_id: config.holder_id.clone(),
                lease_name: config.lease_name.clone(),
                lease_ttl: config.lease_ttl,
            },
        );
        Self { lock, config }
    }
}

#[async_trait]
impl Service for LeaderElectionService {
    fn name(&self) -> &str {
        LEADER_SERVICE_NAME
    }

    async fn start_up(&self, shutdown: &CancellationToken) -> Result<(), ServiceError> {
        info!(
            holder_id = %self.config.holder_id,
            namespace = %self.config.namespace,
            lease_name = %self.config.lease_name,
            "Waiting to acquire leadership"
        );

        loop {
            match self.lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {
                    info!("Acquired leadership");
                    return Ok(());
                }
                Ok(_) => info!("Another instance is leader, waiting..."),
                Err(e) => warn!(error = %e, "Failed to acquire lease, retrying"),
            }

            if !sleep_or_cancel(self.config.renew_interval, shutdown).await {
                return Err(ServiceError::Cancelled);
            }
        }
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<(), ServiceError> {
        loop {
            if !sleep_or_cancel(self.config.renew_interval, &shutdown).await {
                info!("Stopping lease renewal on shutdown");
                return Ok(());
            }

            match self.lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => {
                    error!("Lost leadership");
                    return Err(ServiceError::Crashed("lost leadership".to_string()));
                }
                Err(e) => {
                    error!(error = %e, "Failed to renew lease");
                    return Err(ServiceError::Crashed(format!("failed to renew lease: {e}")));
                }
            }
        }
    }
}
