//! Kubernetes-backed preflight checks.
//!
//! All checks are read-only: CRD lookups, `SelfSubjectAccessReview`s (which
//! the API server evaluates without persisting) and StorageClass listing.

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

use crate::preflight::{CheckOutcome, PreflightCheck};

/// Annotation marking the cluster default StorageClass
const DEFAULT_STORAGE_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

/// Verifies a CustomResourceDefinition is installed and established.
pub struct CrdInstalledCheck {
    client: Client,
    crd_name: String,
}

impl CrdInstalledCheck {
    pub fn new(client: Client, crd_name: impl Into<String>) -> Self {
        Self {
            client,
            crd_name: crd_name.into(),
        }
    }
}

fn is_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Established" && c.status == "True")
        })
}

#[async_trait]
impl PreflightCheck for CrdInstalledCheck {
    fn name(&self) -> &str {
        &self.crd_name
    }

    async fn check(&self) -> CheckOutcome {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        match api.get_opt(&self.crd_name).await {
            Ok(Some(crd)) if is_established(&crd) => {
                CheckOutcome::passed(format!("CRD {} is installed", self.crd_name))
            }
            Ok(Some(_)) => CheckOutcome::failed(format!(
                "CRD {} exists but is not Established",
                self.crd_name
            )),
            Ok(None) => CheckOutcome::failed(format!(
                "CRD {} is not installed; apply the operator CRD manifests first",
                self.crd_name
            )),
            Err(e) => CheckOutcome::failed(format!("failed to read CRD {}: {}", self.crd_name, e)),
        }
    }
}

/// Verbs a controller needs on one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePermission {
    pub group: String,
    pub resource: String,
    pub verbs: Vec<String>,
}

impl ResourcePermission {
    pub fn new(group: &str, resource: &str, verbs: &[&str]) -> Self {
        Self {
            group: group.to_string(),
            resource: resource.to_string(),
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
        }
    }

    fn qualified_resource(&self) -> String {
        if self.group.is_empty() {
            self.resource.clone()
        } else {
            format!("{}.{}", self.resource, self.group)
        }
    }
}

/// Verifies the operator's ServiceAccount holds every listed permission.
pub struct AccessReviewCheck {
    client: Client,
    namespace: Option<String>,
    permissions: Vec<ResourcePermission>,
}

impl AccessReviewCheck {
    pub fn new(
        client: Client,
        namespace: Option<String>,
        permissions: Vec<ResourcePermission>,
    ) -> Self {
        Self {
            client,
            namespace,
            permissions,
        }
    }

    async fn allowed(&self, permission: &ResourcePermission, verb: &str) -> Result<bool, kube::Error> {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    group: Some(permission.group.clone()),
                    resource: Some(permission.resource.clone()),
                    verb: Some(verb.to_string()),
                    namespace: self.namespace.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let response = api.create(&PostParams::default(), &review).await?;
        Ok(response.status.is_some_and(|s| s.allowed))
    }
}

#[async_trait]
impl PreflightCheck for AccessReviewCheck {
    fn name(&self) -> &str {
        "rbac"
    }

    async fn check(&self) -> CheckOutcome {
        let mut denied = Vec::new();
        let mut errors = Vec::new();

        for permission in &self.permissions {
            for verb in &permission.verbs {
                match self.allowed(permission, verb).await {
                    Ok(true) => {
                        debug!(verb = %verb, resource = %permission.qualified_resource(), "Permission granted");
                    }
                    Ok(false) => denied.push(format!("{} {}", verb, permission.qualified_resource())),
                    Err(e) => errors.push(format!(
                        "{} {}: {}",
                        verb,
                        permission.qualified_resource(),
                        e
                    )),
                }
            }
        }

        let scope = self.namespace.as_deref().unwrap_or("cluster-wide");
        if denied.is_empty() && errors.is_empty() {
            CheckOutcome::passed(format!("all required permissions granted ({scope})"))
        } else {
            let mut parts = Vec::new();
            if !denied.is_empty() {
                parts.push(format!("missing permissions ({scope}): {}", denied.join(", ")));
            }
            if !errors.is_empty() {
                parts.push(format!("access review failed: {}", errors.join(", ")));
            }
            CheckOutcome::failed(parts.join("; "))
        }
    }
}

/// Verifies at least one StorageClass exists for Cassandra data volumes.
pub struct StorageClassCheck {
    client: Client,
}

impl StorageClassCheck {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn default_class_name(classes: &[StorageClass]) -> Option<String> {
    classes
        .iter()
        .find(|sc| {
            sc.annotations()
                .get(DEFAULT_STORAGE_CLASS_ANNOTATION)
                .is_some_and(|v| v == "true")
        })
        .map(|sc| sc.name_any())
}

#[async_trait]
impl PreflightCheck for StorageClassCheck {
    fn name(&self) -> &str {
        "storageclass"
    }

    async fn check(&self) -> CheckOutcome {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        match api.list(&ListParams::default()).await {
            Ok(list) if list.items.is_empty() => {
                CheckOutcome::failed("no StorageClass found; persistent volumes cannot be provisioned")
            }
            Ok(list) => match default_class_name(&list.items) {
                Some(name) => CheckOutcome::passed(format!(
                    "{} StorageClass(es) available, default is {}",
                    list.items.len(),
                    name
                )),
                None => CheckOutcome::passed(format!(
                    "{} StorageClass(es) available, none marked default",
                    list.items.len()
                )),
            },
            Err(e) => CheckOutcome::failed(format!("failed to list StorageClasses: {e}")),
        }
    }
}
