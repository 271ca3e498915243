//! LIST/WATCH through `KubeWatchSource` against built-in resources.

use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::discovery::ApiResource;

use cassandra_operator::controller::{KubeWatchSource, WatchSource};

use crate::{SharedTestCluster, init_tracing};

fn configmaps() -> ApiResource {
    ApiResource::erase::<ConfigMap>(&())
}

#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_list_returns_keys_and_version() {
    init_tracing();
    let client = SharedTestCluster::get().await.new_client().await;
    let source = KubeWatchSource::new(client, Some("kube-system"), &configmaps());

    assert_eq!(source.kind(), "ConfigMap");
    let snapshot = source.list().await.unwrap();
    assert!(!snapshot.resource_version.is_empty());
    // kube-root-ca.crt is published into every namespace
    assert!(
        snapshot
            .keys
            .iter()
            .any(|k| k.name == "kube-root-ca.crt" && k.namespace.as_deref() == Some("kube-system")),
        "keys: {:?}",
        snapshot.keys
    );
}

#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_watch_opens_from_listed_version() {
    init_tracing();
    let client = SharedTestCluster::get().await.new_client().await;
    let source = KubeWatchSource::new(client, Some("kube-system"), &configmaps());

    let snapshot = source.list().await.unwrap();
    let mut stream = source.watch(&snapshot.resource_version).await.unwrap();

    // An idle namespace may produce nothing; any item that does arrive must be valid
    if let Ok(Some(item)) = tokio::time::timeout(Duration::from_secs(2), stream.next()).await {
        item.unwrap();
    }
}

#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_stale_version_is_expired() {
    init_tracing();
    let client = SharedTestCluster::get().await.new_client().await;
    let source = KubeWatchSource::new(client, Some("kube-system"), &configmaps());

    // Either the open or the first event reports the version as gone
    let err = match source.watch("1").await {
        Err(e) => e,
        Ok(mut stream) => match tokio::time::timeout(Duration::from_secs(10), stream.next()).await {
            Ok(Some(Err(e))) => e,
            other => {
                eprintln!("API server accepted resource version 1 ({other:?}), skipping");
                return;
            }
        },
    };
    assert!(err.is_expired(), "got {err:?}");
}
