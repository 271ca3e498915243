//! Supervised long-running services.
//!
//! A [`Service`] is a named unit of work with an optional startup phase and a
//! run phase. [`ManagedService`] wraps it with the lifecycle state machine,
//! idempotent `start`/`stop` and a state channel the [`ServiceManager`]
//! watches for failures.

pub mod leader;
pub mod lifecycle;
pub mod manager;

pub use lifecycle::{ManagedService, ServiceState};
pub use manager::{
    ServiceFailure, ServiceManager, ServiceManagerBuilder, ServiceManagerConfig,
    ServiceManagerError,
};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::controller::ControllerError;
use crate::error::{Classify, FailureClass};

/// Errors that move a service to FAILED
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("startup failed: {0}")]
    Startup(String),

    #[error("{0}")]
    Crashed(String),

    /// Startup was abandoned because a stop was requested
    #[error("cancelled before startup completed")]
    Cancelled,

    #[error("did not stop within {0:?}")]
    StopTimeout(Duration),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for ServiceError {
    fn class(&self) -> FailureClass {
        FailureClass::ServiceCrash
    }
}

/// A long-running unit supervised by the [`ServiceManager`].
///
/// The service is RUNNING once `start_up` returns `Ok`. `run` must return
/// promptly after `shutdown` is cancelled. Returning `Err` at any point, or
/// returning at all before `shutdown` is cancelled, moves the service to
/// FAILED.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn start_up(&self, _shutdown: &CancellationToken) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<(), ServiceError>;
}
