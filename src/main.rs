//! cassandra-operator - A Kubernetes operator for Apache Cassandra.
//!
//! This is the main entry point that:
//! - Parses configuration and initializes structured logging
//! - Creates the Kubernetes client
//! - Runs the version gate and preflight checks
//! - Supervises the health server, optional leader election and controllers
//!   until SIGTERM/SIGINT or a service failure

use std::process::ExitCode;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use cassandra_operator::application::EXIT_STARTUP_FAILURE;
use cassandra_operator::{Application, ApplicationError, Classify, Cli, OperatorConfig};

fn init_tracing(config: &OperatorConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(config.log_directive().parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();
    Ok(())
}

async fn run(config: OperatorConfig) -> Result<(), ApplicationError> {
    let client = config.connection.client().await?;
    info!("Connected to Kubernetes cluster");

    Application::for_cluster(&config, client)?
        .run(shutdown_signal())
        .await
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match OperatorConfig::from_cli(Cli::parse()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cassandra-operator: {e}");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    if let Err(e) = init_tracing(&config) {
        eprintln!("cassandra-operator: failed to initialize logging: {e}");
        return ExitCode::from(EXIT_STARTUP_FAILURE);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.namespace.as_deref().unwrap_or("all"),
        "Starting cassandra-operator"
    );

    match run(config).await {
        Ok(()) => {
            info!("Operator stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, class = %e.class(), "Operator exited with error");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Note: Signal handler setup failures are fatal - the operator cannot shut down
/// gracefully without them.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
