//! Version gate and preflight checks against a live API server.

use std::sync::Arc;

use cassandra_operator::preflight::checks::{
    AccessReviewCheck, CrdInstalledCheck, ResourcePermission,
};
use cassandra_operator::preflight::{PreflightCheck, PreflightRunner};
use cassandra_operator::retry::RetryConfig;
use cassandra_operator::version::{
    ClusterVersion, CompatibilityRequirement, VersionError, VersionGate, VersionSource,
};

use crate::{SharedTestCluster, init_tracing};

#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_server_version_parses() {
    init_tracing();
    let cluster = SharedTestCluster::get().await;
    let client = cluster.new_client().await;

    let version = client.server_version().await.unwrap();
    assert_eq!(version.major, 1);
    assert!(
        cluster.git_version().contains(&format!("1.{}", version.minor)),
        "{} does not match {}",
        version,
        cluster.git_version()
    );
}

#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_gate_accepts_wide_range() {
    init_tracing();
    let client = SharedTestCluster::get().await.new_client().await;
    let requirement =
        CompatibilityRequirement::new(ClusterVersion::new(1, 0, 0), ClusterVersion::new(1, 999, 0))
            .unwrap();

    let gate = VersionGate::new(requirement, RetryConfig::with_max_attempts(3));
    let source: Arc<dyn VersionSource> = Arc::new(client);
    let observed = gate.verify(source.as_ref()).await.unwrap();
    assert!(observed.is_some());
}

#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_gate_rejects_future_minimum() {
    init_tracing();
    let client = SharedTestCluster::get().await.new_client().await;
    let requirement =
        CompatibilityRequirement::new(ClusterVersion::new(1, 900, 0), ClusterVersion::new(1, 999, 0))
            .unwrap();

    let gate = VersionGate::new(requirement, RetryConfig::with_max_attempts(1));
    let err = gate.verify(&client).await.unwrap_err();
    assert!(matches!(err, VersionError::TooOld { .. }), "got {err:?}");
}

#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_missing_crd_fails_preflight() {
    init_tracing();
    let client = SharedTestCluster::get().await.new_client().await;

    let checks: Vec<Box<dyn PreflightCheck>> = vec![
        Box::new(CrdInstalledCheck::new(
            client.clone(),
            "nonexistents.cassandraoperator.instaclustr.com",
        )),
        Box::new(AccessReviewCheck::new(
            client,
            Some("default".to_string()),
            vec![ResourcePermission::new("", "configmaps", &["get", "list"])],
        )),
    ];

    let failure = PreflightRunner::default().run(&checks).await.unwrap_err();
    assert_eq!(
        failure.failed_names(),
        vec!["nonexistents.cassandraoperator.instaclustr.com"]
    );
    assert_eq!(failure.passed.len(), 1);
}
