//! Custom resource kinds watched by the operator.
//!
//! - `CassandraDataCenter`: a Cassandra data center and its racks
//! - `CassandraCluster`: groups data centers into one logical cluster
//! - `CassandraBackup`: a backup of a data center to object storage
//!
//! Objects are handled as `DynamicObject`s; controllers only need their
//! identity and metadata.

use kube::discovery::ApiResource;

pub const GROUP: &str = "cassandraoperator.instaclustr.com";
pub const VERSION: &str = "v1alpha1";

/// A namespaced custom resource kind in the operator's API group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchedKind {
    pub kind: &'static str,
    pub plural: &'static str,
}

pub const CASSANDRA_DATA_CENTER: WatchedKind = WatchedKind {
    kind: "CassandraDataCenter",
    plural: "cassandradatacenters",
};

pub const CASSANDRA_CLUSTER: WatchedKind = WatchedKind {
    kind: "CassandraCluster",
    plural: "cassandraclusters",
};

pub const CASSANDRA_BACKUP: WatchedKind = WatchedKind {
    kind: "CassandraBackup",
    plural: "cassandrabackups",
};

/// Every kind the operator runs a controller for
pub const WATCHED_KINDS: [WatchedKind; 3] =
    [CASSANDRA_DATA_CENTER, CASSANDRA_CLUSTER, CASSANDRA_BACKUP];

impl WatchedKind {
    /// Name of the CustomResourceDefinition object, e.g.
    /// `cassandradatacenters.cassandraoperator.instaclustr.com`
    pub fn crd_name(&self) -> String {
        format!("{}.{}", self.plural, GROUP)
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: GROUP.to_string(),
            version: VERSION.to_string(),
            api_version: format!("{GROUP}/{VERSION}"),
            kind: self.kind.to_string(),
            plural: self.plural.to_string(),
        }
    }
}
