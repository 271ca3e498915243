//! Pluggable reconciliation.
//!
//! Controllers only schedule, retry and report; what a reconcile actually
//! does is supplied through [`Reconciler`].

use std::collections::BTreeMap;
use std::future::Future;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::controller::{ReconcileError, ResourceKey};

/// Annotation recording the last generation this operator observed
pub const OBSERVED_GENERATION_ANNOTATION: &str =
    "cassandraoperator.instaclustr.com/observed-generation";

/// Converges one object toward its desired state.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, key: &ResourceKey) -> Result<(), ReconcileError>;
}

/// Reconciler backed by an async closure.
pub struct FnReconciler<F> {
    f: F,
}

/// Wrap an async closure as a [`Reconciler`].
pub fn reconcile_fn<F, Fut>(f: F) -> FnReconciler<F>
where
    F: Fn(ResourceKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ReconcileError>> + Send,
{
    FnReconciler { f }
}

#[async_trait]
impl<F, Fut> Reconciler for FnReconciler<F>
where
    F: Fn(ResourceKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ReconcileError>> + Send,
{
    async fn reconcile(&self, key: &ResourceKey) -> Result<(), ReconcileError> {
        (self.f)(key.clone()).await
    }
}

/// The parts of an object a reconciler reads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectSnapshot {
    pub generation: Option<i64>,
    pub annotations: BTreeMap<String, String>,
}

/// GET/PATCH access to objects by key.
#[async_trait]
pub trait ResourceClient: Send + Sync + 'static {
    /// `None` when the object no longer exists
    async fn get(&self, key: &ResourceKey) -> Result<Option<ObjectSnapshot>, ReconcileError>;

    async fn patch_annotations(
        &self,
        key: &ResourceKey,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), ReconcileError>;
}

/// Records the observed generation on each object.
///
/// This is the placeholder body used until a kind gets its own reconciler:
/// it proves the GET/PATCH path and makes progress visible on the object.
pub struct ObservedGenerationReconciler<C> {
    client: C,
}

impl<C: ResourceClient> ObservedGenerationReconciler<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: ResourceClient> Reconciler for ObservedGenerationReconciler<C> {
    async fn reconcile(&self, key: &ResourceKey) -> Result<(), ReconcileError> {
        let Some(object) = self.client.get(key).await? else {
            debug!(key = %key, "Object deleted, nothing to reconcile");
            return Ok(());
        };

        let Some(generation) = object.generation else {
            return Ok(());
        };
        let generation = generation.to_string();

        if object.annotations.get(OBSERVED_GENERATION_ANNOTATION) == Some(&generation) {
            debug!(key = %key, generation = %generation, "Generation already observed");
            return Ok(());
        }

        let patched = self
            .client
            .patch_annotations(
                key,
                BTreeMap::from([(OBSERVED_GENERATION_ANNOTATION.to_string(), generation.clone())]),
            )
            .await;
        match patched {
            Ok(()) => {}
            // Deleted between GET and PATCH; the delete event reconciles it again
            Err(e) if e.is_not_found() => {
                debug!(key = %key, "Object deleted before patch");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        info!(key = %key, generation = %generation, "Recorded observed generation");
        Ok(())
    }
}
