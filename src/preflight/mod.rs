//! Preflight checks run once before any controller starts.
//!
//! Every check runs to completion, in input order, regardless of earlier
//! failures, so a single report surfaces all environment problems.

pub mod checks;

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tracing::{Instrument, error, info, info_span};

use crate::error::{Classify, FailureClass, panic_message};

/// Default upper bound for a single check
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a single check, with a human-readable diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Passed(String),
    Failed(String),
}

impl CheckOutcome {
    pub fn passed(diagnostic: impl Into<String>) -> Self {
        CheckOutcome::Passed(diagnostic.into())
    }

    pub fn failed(diagnostic: impl Into<String>) -> Self {
        CheckOutcome::Failed(diagnostic.into())
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, CheckOutcome::Passed(_))
    }

    pub fn diagnostic(&self) -> &str {
        match self {
            CheckOutcome::Passed(d) | CheckOutcome::Failed(d) => d,
        }
    }
}

/// A read-only inspection of the environment.
///
/// Checks must be idempotent and must not depend on each other's side effects.
#[async_trait]
pub trait PreflightCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> CheckOutcome;
}

/// Check backed by an async closure.
pub struct FnCheck<F> {
    name: String,
    f: F,
}

/// Wrap an async closure as a [`PreflightCheck`].
pub fn check_fn<F, Fut>(name: impl Into<String>, f: F) -> FnCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = CheckOutcome> + Send,
{
    FnCheck {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> PreflightCheck for FnCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = CheckOutcome> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> CheckOutcome {
        (self.f)().await
    }
}

/// Recorded result of one executed check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub diagnostic: String,
    pub duration: Duration,
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.passed { "passed" } else { "FAILED" };
        write!(f, "{} [{}]: {}", self.name, status, self.diagnostic)
    }
}

/// Results of a fully successful preflight run
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub results: Vec<CheckResult>,
}

impl PreflightReport {
    pub fn passed_names(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.name.as_str()).collect()
    }
}

/// One or more checks failed.
#[derive(Error, Debug, Clone)]
#[error(
    "{} of {} preflight check(s) failed: {}",
    .failures.len(),
    .failures.len() + .passed.len(),
    summarize(.failures)
)]
pub struct AggregatedFailure {
    /// Failing checks in input order
    pub failures: Vec<CheckResult>,
    /// Names of the checks that passed, in input order
    pub passed: Vec<String>,
}

impl AggregatedFailure {
    pub fn failed_names(&self) -> Vec<&str> {
        self.failures.iter().map(|r| r.name.as_str()).collect()
    }
}

impl Classify for AggregatedFailure {
    fn class(&self) -> FailureClass {
        FailureClass::FatalStartup
    }
}

fn summarize(failures: &[CheckResult]) -> String {
    failures
        .iter()
        .map(|r| format!("{}: {}", r.name, r.diagnostic))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Runs checks sequentially and aggregates their failures.
#[derive(Debug, Clone)]
pub struct PreflightRunner {
    check_timeout: Duration,
}

impl Default for PreflightRunner {
    fn default() -> Self {
        Self::new(DEFAULT_CHECK_TIMEOUT)
    }
}

impl PreflightRunner {
    pub fn new(check_timeout: Duration) -> Self {
        Self { check_timeout }
    }

    pub async fn run(
        &self,
        checks: &[Box<dyn PreflightCheck>],
    ) -> Result<PreflightReport, AggregatedFailure> {
        let span = info_span!("preflight", checks = checks.len());
        async {
            let mut results = Vec::with_capacity(checks.len());
            for check in checks {
                results.push(self.run_one(check.as_ref()).await);
            }

            let (passed, failures): (Vec<_>, Vec<_>) = results.into_iter().partition(|r| r.passed);

            if failures.is_empty() {
                info!(count = passed.len(), "All preflight checks passed");
                Ok(PreflightReport { results: passed })
            } else {
                let failure = AggregatedFailure {
                    failures,
                    passed: passed.into_iter().map(|r| r.name).collect(),
                };
                error!(
                    failed = ?failure.failed_names(),
                    passed = ?failure.passed,
                    "Preflight checks failed"
                );
                Err(failure)
            }
        }
        .instrument(span)
        .await
    }

    async fn run_one(&self, check: &dyn PreflightCheck) -> CheckResult {
        let name = check.name().to_string();
        let start = Instant::now();

        let outcome = tokio::time::timeout(
            self.check_timeout,
            AssertUnwindSafe(check.check()).catch_unwind(),
        )
        .await;

        let (passed, diagnostic) = match outcome {
            Ok(Ok(CheckOutcome::Passed(d))) => (true, d),
            Ok(Ok(CheckOutcome::Failed(d))) => (false, d),
            Ok(Err(panic)) => (false, format!("check panicked: {}", panic_message(panic.as_ref()))),
            Err(_) => (
                false,
                format!("check timed out after {}s", self.check_timeout.as_secs_f64()),
            ),
        };

        let duration = start.elapsed();
        if passed {
            info!(check = %name, diagnostic = %diagnostic, "Preflight check passed");
        } else {
            error!(check = %name, diagnostic = %diagnostic, "Preflight check failed");
        }

        CheckResult {
            name,
            passed,
            diagnostic,
            duration,
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn passing(name: &str) -> Box<dyn PreflightCheck> {
        Box::new(check_fn(name, || async { CheckOutcome::passed("ok") }))
    }

    fn failing(name: &str, reason: &'static str) -> Box<dyn PreflightCheck> {
        Box::new(check_fn(name, move || async move { CheckOutcome::failed(reason) }))
    }

    #[tokio::test]
    async fn test_all_pass() {
        let checks = vec![passing("crd"), passing("rbac")];
        let report = PreflightRunner::default().run(&checks).await.unwrap();
        assert_eq!(report.passed_names(), vec!["crd", "rbac"]);
    }

    #[tokio::test]
    async fn test_single_failure_is_reported_alone() {
        let checks = vec![
            passing("crd"),
            failing("rbac", "cannot watch cassandradatacenters"),
            passing("storageclass"),
        ];

        let failure = PreflightRunner::default().run(&checks).await.unwrap_err();
        assert_eq!(failure.failed_names(), vec!["rbac"]);
        assert_eq!(failure.passed, vec!["crd".to_string(), "storageclass".to_string()]);
        assert!(failure.to_string().contains("cannot watch cassandradatacenters"));
    }

    #[tokio::test]
    async fn test_no_short_circuit() {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let mut checks: Vec<Box<dyn PreflightCheck>> = Vec::new();
        for name in ["a", "b", "c", "d"] {
            let executed = executed.clone();
            checks.push(Box::new(check_fn(name, move || {
                let executed = executed.clone();
                async move {
                    executed.lock().unwrap().push(name);
                    CheckOutcome::failed("nope")
                }
            })));
        }

        let failure = PreflightRunner::default().run(&checks).await.unwrap_err();
        assert_eq!(failure.failed_names(), vec!["a", "b", "c", "d"]);
        assert_eq!(*executed.lock().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_panicking_check_is_a_failure() {
        let checks: Vec<Box<dyn PreflightCheck>> = vec![
            Box::new(check_fn("explodes", || async { panic!("kaboom") })),
            passing("after"),
        ];

        let failure = PreflightRunner::default().run(&checks).await.unwrap_err();
        assert_eq!(failure.failed_names(), vec!["explodes"]);
        assert!(failure.failures[0].diagnostic.contains("kaboom"));
        assert_eq!(failure.passed, vec!["after".to_string()]);
    }

    #[tokio::test]
    async fn test_slow_check_times_out() {
        let checks: Vec<Box<dyn PreflightCheck>> = vec![Box::new(check_fn("slow", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            CheckOutcome::passed("late")
        }))];

        let failure = PreflightRunner::new(Duration::from_millis(20))
            .run(&checks)
            .await
            .unwrap_err();
        assert!(failure.failures[0].diagnostic.contains("timed out"));
    }

    #[tokio::test]
    async fn test_empty_check_list_passes() {
        let report = PreflightRunner::default().run(&[]).await.unwrap();
        assert!(report.results.is_empty());
    }
}
