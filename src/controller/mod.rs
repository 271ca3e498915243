//! Controller module for cassandra-operator.
//!
//! A controller watches one resource kind and reconciles each changed object
//! through a pluggable [`Reconciler`], one key at a time per object.
//!
//! - `service`: the watch loop and workers, run as a supervised service
//! - `queue`: per-key serialized work queue
//! - `state_machine`: controller phase transitions
//! - `source` / `reconciler`: the capabilities a controller consumes
//! - `kube_source`: their `kube` implementations

pub mod error;
pub mod key;
pub mod kube_source;
pub mod queue;
pub mod reconciler;
pub mod service;
pub mod source;
pub mod state_machine;

pub use error::{ControllerError, ReconcileError, WatchError};
pub use key::ResourceKey;
pub use kube_source::{KubeResourceClient, KubeWatchSource};
pub use reconciler::{
    FnReconciler, ObjectSnapshot, ObservedGenerationReconciler, Reconciler, ResourceClient,
    reconcile_fn,
};
pub use service::{ControllerConfig, ControllerService};
pub use source::{ListSnapshot, WatchEvent, WatchSource, WatchStream};
pub use state_machine::ControllerPhase;
