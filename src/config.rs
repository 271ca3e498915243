//! Command-line configuration.
//!
//! [`Cli`] is the raw clap surface; [`OperatorConfig`] is the validated form
//! the application is built from.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use thiserror::Error;

use crate::controller::ControllerConfig;
use crate::error::{Classify, FailureClass};
use crate::event_bus::{DispatchPolicy, EventBusConfig};
use crate::retry::RetryConfig;
use crate::service::ServiceManagerConfig;
use crate::service::leader::LeaderElectionConfig;
use crate::version::{ClusterVersion, CompatibilityRequirement, VersionError, VersionParseError};

/// Default connect timeout for the kube client
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DispatchArg {
    /// Publisher awaits each handler in turn
    Sync,
    /// Each subscription drains its own queue
    Queued,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "cassandra-operator",
    version,
    about = "Kubernetes operator for Apache Cassandra"
)]
pub struct Cli {
    /// Namespace to watch; all namespaces when unset
    #[arg(short, long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Path to a kubeconfig file; in-cluster or default config when unset.
    /// An empty path behaves like --no-kube-config
    #[arg(short = 'c', long, env = "KUBECONFIG")]
    pub kube_config: Option<String>,

    /// Ignore every kubeconfig file, including the default, and use the
    /// in-cluster service account
    #[arg(long)]
    pub no_kube_config: bool,

    /// API server URL, overriding the kubeconfig
    #[arg(long)]
    pub host: Option<String>,

    /// Skip TLS verification of the API server certificate
    #[arg(long)]
    pub insecure_tls: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Lowest supported Kubernetes version
    #[arg(long, default_value = "1.20.0")]
    pub min_k8s_version: String,

    /// Highest supported version; a .0 patch admits the whole minor line
    #[arg(long, default_value = "1.34.0")]
    pub max_k8s_version: String,

    /// Log the API server version but never refuse to start on it
    #[arg(long)]
    pub disable_k8s_version_check: bool,

    /// Attempts to reach the API server for the version check
    #[arg(long, default_value_t = 5)]
    pub version_check_attempts: u32,

    /// Consecutive LIST/WATCH failures before a controller fails (0 = unlimited)
    #[arg(long, default_value_t = 10)]
    pub watch_retry_attempts: u32,

    /// Attempts per key for transient reconcile errors
    #[arg(long, default_value_t = 5)]
    pub reconcile_retry_attempts: u32,

    /// Upper bound on any retry delay, in seconds
    #[arg(long, default_value_t = 30)]
    pub max_backoff_secs: u64,

    /// Reconcile workers per controller
    #[arg(long, default_value_t = 2)]
    pub workers: usize,

    /// Time services get to stop before they are aborted, in seconds
    #[arg(long, default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// How events are delivered to subscribers
    #[arg(long, value_enum, default_value_t = DispatchArg::Sync)]
    pub event_dispatch: DispatchArg,

    /// Longest an event handler may run before it is abandoned, in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub handler_timeout_ms: u64,

    /// Time limit for each preflight check, in seconds
    #[arg(long, default_value_t = 30)]
    pub preflight_timeout_secs: u64,

    /// Port serving /healthz, /readyz and /metrics
    #[arg(long, default_value_t = 8080)]
    pub health_port: u16,

    /// Only run controllers while holding the leader lease
    #[arg(long)]
    pub leader_election: bool,

    /// Leader election holder identity; hostname when unset
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Namespace holding the leader lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pub pod_namespace: String,

    /// Fail preflight when no StorageClass exists
    #[arg(long)]
    pub require_storage_class: bool,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid --{flag}: {source}")]
    InvalidVersion {
        flag: &'static str,
        source: VersionParseError,
    },

    #[error(transparent)]
    InvalidRequirement(#[from] VersionError),

    #[error("invalid --{flag}: {reason}")]
    InvalidValue { flag: &'static str, reason: String },

    #[error("failed to build Kubernetes client: {0}")]
    Client(String),
}

impl Classify for ConfigError {
    fn class(&self) -> FailureClass {
        FailureClass::FatalStartup
    }
}

/// Where client configuration is loaded from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource<'a> {
    /// Service account mounted into the pod
    InCluster,
    File(&'a Path),
    /// `KUBECONFIG`, `~/.kube/config`, then in-cluster
    Inferred,
}

/// How to reach the API server
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    pub kube_config: Option<PathBuf>,
    pub no_kube_config: bool,
    pub host: Option<String>,
    pub insecure_tls: bool,
}

impl ConnectionConfig {
    pub fn source(&self) -> ConfigSource<'_> {
        match &self.kube_config {
            _ if self.no_kube_config => ConfigSource::InCluster,
            Some(path) if path.as_os_str().is_empty() => ConfigSource::InCluster,
            Some(path) => ConfigSource::File(path),
            None => ConfigSource::Inferred,
        }
    }

    /// Build a kube client from the configured source
    pub async fn client(&self) -> Result<Client, ConfigError> {
        let mut config = match self.source() {
            ConfigSource::InCluster => Config::incluster()
                .map_err(|e| ConfigError::Client(format!("failed to load in-cluster config: {e}")))?,
            ConfigSource::File(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ConfigError::Client(format!("failed to read kubeconfig: {e}"))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| ConfigError::Client(format!("failed to load kubeconfig: {e}")))?
            }
            ConfigSource::Inferred => Config::infer()
                .await
                .map_err(|e| ConfigError::Client(format!("failed to infer config: {e}")))?,
        };

        if let Some(host) = &self.host {
            config.cluster_url = host.parse().map_err(|e| ConfigError::InvalidValue {
                flag: "host",
                reason: format!("{e}"),
            })?;
        }
        config.accept_invalid_certs = self.insecure_tls;
        config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);

        Client::try_from(config)
            .map_err(|e| ConfigError::Client(format!("failed to create client: {e}")))
    }
}

/// Validated operator configuration
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub namespace: Option<String>,
    pub connection: ConnectionConfig,
    pub verbosity: u8,
    /// `None` when the version check is disabled
    pub version_requirement: Option<CompatibilityRequirement>,
    pub version_retry: RetryConfig,
    pub preflight_timeout: Duration,
    pub require_storage_class: bool,
    pub controller: ControllerConfig,
    pub event_bus: EventBusConfig,
    pub manager: ServiceManagerConfig,
    pub health_port: u16,
    pub leader_election: Option<LeaderElectionConfig>,
}

fn parse_version(flag: &'static str, value: &str) -> Result<ClusterVersion, ConfigError> {
    value
        .parse()
        .map_err(|source| ConfigError::InvalidVersion { flag, source })
}

impl OperatorConfig {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        if cli.workers == 0 {
            return Err(ConfigError::InvalidValue {
                flag: "workers",
                reason: "at least one worker is required".to_string(),
            });
        }
        if cli.handler_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                flag: "handler-timeout-ms",
                reason: "handler timeout must be positive".to_string(),
            });
        }

        let version_requirement = if cli.disable_k8s_version_check {
            None
        } else {
            Some(CompatibilityRequirement::new(
                parse_version("min-k8s-version", &cli.min_k8s_version)?,
                parse_version("max-k8s-version", &cli.max_k8s_version)?,
            )?)
        };

        let max_backoff = Duration::from_secs(cli.max_backoff_secs.max(1));
        let initial_backoff = Duration::from_millis(500).min(max_backoff);
        let backoff = |attempts: u32| {
            RetryConfig::with_max_attempts(attempts).with_delays(initial_backoff, max_backoff)
        };

        let leader_election = cli.leader_election.then(|| {
            let holder = cli.pod_name.clone().unwrap_or_else(|| {
                hostname::get()
                    .map(|h| h.to_string_lossy().to_string())
                    .unwrap_or_else(|_| "unknown".to_string())
            });
            LeaderElectionConfig::new(cli.pod_namespace.clone(), holder)
        });

        Ok(Self {
            namespace: cli.namespace,
            connection: ConnectionConfig {
                kube_config: cli.kube_config.map(PathBuf::from),
                no_kube_config: cli.no_kube_config,
                host: cli.host,
                insecure_tls: cli.insecure_tls,
            },
            verbosity: cli.verbose,
            version_requirement,
            version_retry: backoff(cli.version_check_attempts.max(1)),
            preflight_timeout: Duration::from_secs(cli.preflight_timeout_secs.max(1)),
            require_storage_class: cli.require_storage_class,
            controller: ControllerConfig {
                workers: cli.workers,
                reconcile_retry: backoff(cli.reconcile_retry_attempts.max(1)),
                watch_retry: backoff(cli.watch_retry_attempts),
            },
            event_bus: EventBusConfig {
                policy: match cli.event_dispatch {
                    DispatchArg::Sync => DispatchPolicy::Synchronous,
                    DispatchArg::Queued => DispatchPolicy::Queued,
                },
                handler_timeout: Duration::from_millis(cli.handler_timeout_ms),
            },
            manager: ServiceManagerConfig {
                shutdown_grace_period: Duration::from_secs(cli.shutdown_grace_secs),
            },
            health_port: cli.health_port,
            leader_election,
        })
    }

    /// Log filter directive for this crate
    pub fn log_directive(&self) -> &'static str {
        match self.verbosity {
            0 => "cassandra_operator=info",
            1 => "cassandra_operator=debug",
            _ => "cassandra_operator=trace",
        }
    }
}
