//! cassandra-operator library crate
//!
//! Startup gating and service supervision for the operator: the API server
//! version gate, preflight checks, the in-process event bus, generic
//! watch/reconcile controllers and the service manager that runs them.

pub mod application;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod event_bus;
pub mod health;
pub mod preflight;
pub mod retry;
pub mod service;
pub mod version;

pub use application::{Application, ApplicationBuilder, ApplicationError};
pub use config::{Cli, OperatorConfig};
pub use error::{Classify, FailureClass};
pub use event_bus::{EventBus, EventBusConfig, EventKind, OperatorEvent};
pub use health::HealthState;
pub use preflight::{CheckOutcome, PreflightCheck, PreflightRunner};
pub use service::{Service, ServiceManager, ServiceState};
pub use version::{ClusterVersion, CompatibilityRequirement, VersionError, VersionGate};
