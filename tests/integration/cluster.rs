//! Shared test cluster connection.
//!
//! Connectivity is validated once per test binary; each test then builds
//! its own client.

use std::sync::{Arc, OnceLock};

use kube::{Client, Config};
use tokio::sync::OnceCell;

static SHARED_CLUSTER: OnceCell<Arc<SharedTestCluster>> = OnceCell::const_new();

pub struct SharedTestCluster {
    git_version: String,
}

impl SharedTestCluster {
    /// Get or create the shared test cluster.
    pub async fn get() -> Arc<SharedTestCluster> {
        SHARED_CLUSTER
            .get_or_init(|| async {
                let cluster = Self::connect().await.expect(
                    "Failed to connect to Kubernetes cluster. Is your kubeconfig configured?",
                );
                Arc::new(cluster)
            })
            .await
            .clone()
    }

    pub async fn new_client(&self) -> Client {
        let config = Config::infer().await.expect("Failed to infer kube config");
        Client::try_from(config).expect("Failed to create kube client")
    }

    /// `gitVersion` reported when connectivity was checked
    pub fn git_version(&self) -> &str {
        &self.git_version
    }

    async fn connect() -> Result<Self, kube::Error> {
        let config = Config::infer()
            .await
            .map_err(|e| kube::Error::Service(std::io::Error::other(e.to_string()).into()))?;
        let client = Client::try_from(config)?;

        let version = client.apiserver_version().await?;
        tracing::info!(
            "Connected to Kubernetes cluster: {} {}",
            version.platform,
            version.git_version
        );

        Ok(Self {
            git_version: version.git_version,
        })
    }
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

pub fn init_tracing() {
    TRACING_INIT.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    });
}
