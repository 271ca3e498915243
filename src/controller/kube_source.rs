//! `kube`-backed watch source and resource client for dynamic objects.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{DynamicObject, ListParams, Patch, PatchParams, WatchEvent as KubeWatchEvent, WatchParams};
use kube::discovery::ApiResource;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use crate::controller::{
    ListSnapshot, ObjectSnapshot, ReconcileError, ResourceClient, ResourceKey, WatchError,
    WatchEvent, WatchSource, WatchStream,
};

/// Server-side watch timeout; the stream ends cleanly after this and is reopened
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Create namespaced or cluster-wide API based on scope
fn scoped_api(client: Client, namespace: Option<&str>, ar: &ApiResource) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client, ns, ar),
        None => Api::all_with(client, ar),
    }
}

fn object_key(kind: &str, obj: &DynamicObject) -> ResourceKey {
    ResourceKey {
        kind: kind.to_string(),
        namespace: obj.namespace(),
        name: obj.name_any(),
    }
}

/// LIST/WATCH over one custom resource kind.
#[derive(Clone)]
pub struct KubeWatchSource {
    api: Api<DynamicObject>,
    kind: String,
}

impl KubeWatchSource {
    pub fn new(client: Client, namespace: Option<&str>, ar: &ApiResource) -> Self {
        Self {
            api: scoped_api(client, namespace, ar),
            kind: ar.kind.clone(),
        }
    }
}

fn convert_event(kind: &str, event: KubeWatchEvent<DynamicObject>) -> Result<WatchEvent, WatchError> {
    match event {
        KubeWatchEvent::Added(obj) | KubeWatchEvent::Modified(obj) => Ok(WatchEvent::Applied {
            key: object_key(kind, &obj),
            resource_version: obj.resource_version(),
        }),
        KubeWatchEvent::Deleted(obj) => Ok(WatchEvent::Deleted {
            key: object_key(kind, &obj),
            resource_version: obj.resource_version(),
        }),
        KubeWatchEvent::Bookmark(bookmark) => Ok(WatchEvent::Bookmark {
            resource_version: bookmark.metadata.resource_version,
        }),
        KubeWatchEvent::Error(e) if e.code == 410 => Err(WatchError::Expired(e.message)),
        KubeWatchEvent::Error(e) => Err(WatchError::Disconnected(format!(
            "watch error {}: {}",
            e.code, e.message
        ))),
    }
}

#[async_trait]
impl WatchSource for KubeWatchSource {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn list(&self) -> Result<ListSnapshot, WatchError> {
        let list = self.api.list(&ListParams::default()).await?;
        let keys = list
            .items
            .iter()
            .map(|obj| object_key(&self.kind, obj))
            .collect();
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        debug!(kind = %self.kind, resource_version = %resource_version, "Listed objects");
        Ok(ListSnapshot {
            keys,
            resource_version,
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream, WatchError> {
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = self.api.watch(&params, resource_version).await?;
        let kind = self.kind.clone();
        Ok(stream
            .map(move |item| match item {
                Ok(event) => convert_event(&kind, event),
                Err(e) => Err(WatchError::from(e)),
            })
            .boxed())
    }
}

/// GET/PATCH for one custom resource kind.
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
    ar: ApiResource,
    field_manager: String,
}

impl KubeResourceClient {
    pub fn new(client: Client, ar: ApiResource) -> Self {
        Self {
            client,
            ar,
            field_manager: "cassandra-operator".to_string(),
        }
    }

    fn api(&self, key: &ResourceKey) -> Api<DynamicObject> {
        scoped_api(self.client.clone(), key.namespace.as_deref(), &self.ar)
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ObjectSnapshot>, ReconcileError> {
        let obj = self.api(key).get_opt(&key.name).await?;
        Ok(obj.map(|obj| ObjectSnapshot {
            generation: obj.metadata.generation,
            annotations: obj.annotations().clone(),
        }))
    }

    async fn patch_annotations(
        &self,
        key: &ResourceKey,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), ReconcileError> {
        let patch = json!({ "metadata": { "annotations": annotations } });
        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        self.api(key)
            .patch(&key.name, &params, &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
