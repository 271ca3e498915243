//! Error types for the controller.
//!
//! Reconcile errors are classified for per-key retry; watch errors feed the
//! reconnect budget; `ControllerError` is what fails the controller service.

use thiserror::Error;

use crate::error::{Classify, FailureClass};

/// Error returned by a reconciler
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ReconcileError {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconcileError::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Kube(e) => {
                // Retry on network errors, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429
                ) || matches!(e, kube::Error::Service(_))
            }
            ReconcileError::Transient(_) => true,
            ReconcileError::Permanent(_) | ReconcileError::Serialization(_) => false,
        }
    }
}

impl Classify for ReconcileError {
    fn class(&self) -> FailureClass {
        if self.is_retryable() {
            FailureClass::TransientReconcile
        } else {
            FailureClass::PermanentReconcile
        }
    }
}

/// Error from a LIST or WATCH call, or from an open watch stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("watch disconnected: {0}")]
    Disconnected(String),

    /// The resource version is too old to resume from; a fresh LIST is needed
    #[error("resource version expired: {0}")]
    Expired(String),
}

impl WatchError {
    pub fn is_expired(&self) -> bool {
        matches!(self, WatchError::Expired(_))
    }
}

impl From<kube::Error> for WatchError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(api_err) if api_err.code == 410 => WatchError::Expired(e.to_string()),
            _ => WatchError::Disconnected(e.to_string()),
        }
    }
}

impl Classify for WatchError {
    fn class(&self) -> FailureClass {
        FailureClass::TransientConnectivity
    }
}

/// Unrecoverable controller failure
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("controller {controller} lost its watch after {attempts} attempt(s): {last_error}")]
    WatchLost {
        controller: String,
        attempts: u32,
        last_error: WatchError,
    },
}

impl Classify for ControllerError {
    fn class(&self) -> FailureClass {
        FailureClass::ServiceCrash
    }
}
