//! Kubernetes API server version gating.
//!
//! The gate runs once, before preflight checks and before any controller is
//! started. An unreachable API server is retried with backoff; a version
//! outside the supported range is a configuration mismatch and fails at once.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::version::Info;
use semver::Version;
use thiserror::Error;
use tracing::{Instrument, info, info_span, warn};

use crate::error::{Classify, FailureClass};
use crate::retry::{RetryConfig, retry_with_backoff};

/// Semantic version of the target API server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl ClusterVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Build a version from the `/version` response.
    ///
    /// `gitVersion` carries the patch level (`v1.27.3-eks-a5565ad`); when it
    /// cannot be parsed the `major`/`minor` fields are used (`"27+"` on some
    /// managed distributions).
    pub fn from_info(info: &Info) -> Result<Self, VersionParseError> {
        if let Ok(version) = info.git_version.parse() {
            return Ok(version);
        }

        let major = info.major.trim_end_matches('+');
        let minor = info.minor.trim_end_matches('+');
        format!("{major}.{minor}").parse()
    }
}

impl fmt::Display for ClusterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ClusterVersion {
    type Err = VersionParseError;

    /// Accepts `1.20`, `v1.27.3`, `1.27.3-gke.100` and `1.28+`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('v');
        let core = trimmed.split(['-', '+']).next().unwrap_or(trimmed);

        let normalized = match core.matches('.').count() {
            0 => format!("{core}.0.0"),
            1 => format!("{core}.0"),
            _ => core.to_string(),
        };

        let version = Version::parse(&normalized).map_err(|e| VersionParseError {
            input: s.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self::new(version.major, version.minor, version.patch))
    }
}

/// A version string that could not be understood.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid version '{input}': {reason}")]
pub struct VersionParseError {
    pub input: String,
    pub reason: String,
}

/// Supported API server version range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompatibilityRequirement {
    min: ClusterVersion,
    max: ClusterVersion,
}

impl CompatibilityRequirement {
    pub fn new(min: ClusterVersion, max: ClusterVersion) -> Result<Self, VersionError> {
        if min > max {
            return Err(VersionError::InvalidRequirement { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> ClusterVersion {
        self.min
    }

    pub fn max(&self) -> ClusterVersion {
        self.max
    }

    /// A max bound with patch 0 covers the whole minor line (`1.29` admits `1.29.8`).
    fn admits_upper(&self, actual: &ClusterVersion) -> bool {
        if self.max.patch == 0 {
            (actual.major, actual.minor) <= (self.max.major, self.max.minor)
        } else {
            *actual <= self.max
        }
    }
}

impl fmt::Display for CompatibilityRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Version gate failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Kubernetes {actual} is older than the minimum supported version {min} (supported: {min} to {max})")]
    TooOld {
        actual: ClusterVersion,
        min: ClusterVersion,
        max: ClusterVersion,
    },

    #[error("Kubernetes {actual} is newer than the maximum supported version {max} (supported: {min} to {max})")]
    TooNew {
        actual: ClusterVersion,
        min: ClusterVersion,
        max: ClusterVersion,
    },

    #[error("Kubernetes API server unreachable after {attempts} attempt(s): {reason}")]
    Unreachable { attempts: u32, reason: String },

    #[error("API server reported a malformed version: {0}")]
    Malformed(VersionParseError),

    #[error("invalid version requirement: minimum {min} is greater than maximum {max}")]
    InvalidRequirement {
        min: ClusterVersion,
        max: ClusterVersion,
    },
}

impl Classify for VersionError {
    fn class(&self) -> FailureClass {
        // Unreachable is only reported once the retry budget is spent
        FailureClass::FatalStartup
    }
}

/// Errors from a single version query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionFetchError {
    #[error("{0}")]
    Unreachable(String),

    #[error(transparent)]
    Malformed(#[from] VersionParseError),
}

impl VersionFetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, VersionFetchError::Unreachable(_))
    }
}

impl Classify for VersionFetchError {
    fn class(&self) -> FailureClass {
        match self {
            VersionFetchError::Unreachable(_) => FailureClass::TransientConnectivity,
            VersionFetchError::Malformed(_) => FailureClass::FatalStartup,
        }
    }
}

/// Anything that can report the API server version.
#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn server_version(&self) -> Result<ClusterVersion, VersionFetchError>;
}

#[async_trait]
impl VersionSource for kube::Client {
    async fn server_version(&self) -> Result<ClusterVersion, VersionFetchError> {
        let info = self
            .apiserver_version()
            .await
            .map_err(|e| VersionFetchError::Unreachable(e.to_string()))?;
        Ok(ClusterVersion::from_info(&info)?)
    }
}

/// Compare an observed version against the supported range.
pub fn check(
    actual: ClusterVersion,
    requirement: &CompatibilityRequirement,
) -> Result<(), VersionError> {
    if actual < requirement.min {
        return Err(VersionError::TooOld {
            actual,
            min: requirement.min,
            max: requirement.max,
        });
    }
    if !requirement.admits_upper(&actual) {
        return Err(VersionError::TooNew {
            actual,
            min: requirement.min,
            max: requirement.max,
        });
    }
    Ok(())
}

/// Startup gate for API server compatibility.
#[derive(Debug, Clone)]
pub struct VersionGate {
    requirement: Option<CompatibilityRequirement>,
    retry: RetryConfig,
}

impl VersionGate {
    pub fn new(requirement: CompatibilityRequirement, retry: RetryConfig) -> Self {
        Self {
            requirement: Some(requirement),
            retry,
        }
    }

    /// A gate that only logs the server version.
    pub fn disabled() -> Self {
        Self {
            requirement: None,
            retry: RetryConfig::with_max_attempts(1),
        }
    }

    pub fn requirement(&self) -> Option<&CompatibilityRequirement> {
        self.requirement.as_ref()
    }

    /// Fetch the server version and check it.
    ///
    /// Returns the observed version, or `None` when the gate is disabled and
    /// the server could not be queried.
    pub async fn verify(
        &self,
        source: &dyn VersionSource,
    ) -> Result<Option<ClusterVersion>, VersionError> {
        let span = info_span!("version_gate");
        async {
            let Some(requirement) = self.requirement else {
                return match source.server_version().await {
                    Ok(version) => {
                        info!(version = %version, "Kubernetes version check disabled");
                        Ok(Some(version))
                    }
                    Err(e) => {
                        warn!(error = %e, "Kubernetes version check disabled, server version unknown");
                        Ok(None)
                    }
                };
            };

            let mut attempts = 0u32;
            let fetched = retry_with_backoff(
                &self.retry,
                "fetch_server_version",
                VersionFetchError::is_retryable,
                || {
                    attempts += 1;
                    source.server_version()
                },
            )
            .await;

            let actual = fetched.map_err(|e| match e {
                VersionFetchError::Unreachable(reason) => {
                    VersionError::Unreachable { attempts, reason }
                }
                VersionFetchError::Malformed(parse) => VersionError::Malformed(parse),
            })?;

            check(actual, &requirement)?;

            info!(
                version = %actual,
                min = %requirement.min(),
                max = %requirement.max(),
                "Kubernetes version is supported"
            );
            Ok(Some(actual))
        }
        .instrument(span)
        .await
    }
}
