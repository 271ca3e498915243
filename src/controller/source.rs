//! Abstract watch capability consumed by controllers.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::controller::{ResourceKey, WatchError};

/// A change notification for one object, or a resume-point bookmark
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Applied {
        key: ResourceKey,
        resource_version: Option<String>,
    },
    Deleted {
        key: ResourceKey,
        resource_version: Option<String>,
    },
    Bookmark {
        resource_version: String,
    },
}

impl WatchEvent {
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Applied {
                resource_version, ..
            }
            | WatchEvent::Deleted {
                resource_version, ..
            } => resource_version.as_deref(),
            WatchEvent::Bookmark { resource_version } => Some(resource_version),
        }
    }
}

/// Result of a LIST: every current object plus the version to watch from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListSnapshot {
    pub keys: Vec<ResourceKey>,
    pub resource_version: String,
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, WatchError>>;

/// LIST/WATCH access to one resource kind.
///
/// A stream that ends without an error is a server-side timeout and is
/// reopened from the last seen resource version.
#[async_trait]
pub trait WatchSource: Send + Sync + 'static {
    /// Resource kind, used for keys and logging
    fn kind(&self) -> &str;

    async fn list(&self) -> Result<ListSnapshot, WatchError>;

    async fn watch(&self, resource_version: &str) -> Result<WatchStream, WatchError>;
}
