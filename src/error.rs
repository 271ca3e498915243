//! Failure taxonomy shared by every component.
//!
//! Each component keeps its own error enum; `FailureClass` is the common
//! vocabulary used for logging and for deciding how far a failure propagates.

use std::any::Any;
use std::fmt;

/// How a failure is handled by the orchestration core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Version mismatch or failed preflight: terminate before any controller starts
    FatalStartup,
    /// API server or watch connectivity: retried with bounded backoff
    TransientConnectivity,
    /// Reconcile failure that will be retried for the same key
    TransientReconcile,
    /// Reconcile failure surfaced without retry
    PermanentReconcile,
    /// A supervised service reached FAILED: coordinated shutdown
    ServiceCrash,
}

impl FailureClass {
    /// Whether failures of this class are retried at all
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureClass::TransientConnectivity | FailureClass::TransientReconcile
        )
    }

    /// Whether failures of this class stop the whole process
    pub fn is_fatal(&self) -> bool {
        matches!(self, FailureClass::FatalStartup | FailureClass::ServiceCrash)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::FatalStartup => write!(f, "FatalStartup"),
            FailureClass::TransientConnectivity => write!(f, "TransientConnectivity"),
            FailureClass::TransientReconcile => write!(f, "TransientReconcile"),
            FailureClass::PermanentReconcile => write!(f, "PermanentReconcile"),
            FailureClass::ServiceCrash => write!(f, "ServiceCrash"),
        }
    }
}

/// Implemented by every error type that crosses a component boundary.
pub trait Classify {
    fn class(&self) -> FailureClass;
}

/// Render a caught panic payload for diagnostics.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
