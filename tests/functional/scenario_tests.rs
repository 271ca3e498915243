//! End-to-end startup and supervision scenarios through `Application`.
//!
//! These cover the ordering guarantees between the version gate, the
//! preflight checks and the services, and the coordinated shutdown that
//! follows a controller failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::mock_state::*;
use cassandra_operator::application::{EXIT_SERVICE_FAILURE, EXIT_STARTUP_FAILURE};
use cassandra_operator::controller::{ControllerConfig, ControllerService, WatchError};
use cassandra_operator::event_bus::{EventBus, EventKind, OperatorEvent};
use cassandra_operator::preflight::{CheckOutcome, PreflightCheck, check_fn};
use cassandra_operator::service::{
    ServiceManagerConfig, ServiceManagerError, ServiceState,
};
use cassandra_operator::version::{ClusterVersion, CompatibilityRequirement, VersionError, VersionGate};
use cassandra_operator::{Application, ApplicationError, HealthState};

const WAIT: Duration = Duration::from_secs(5);

fn requirement(min_minor: u64, max_minor: u64) -> CompatibilityRequirement {
    CompatibilityRequirement::new(
        ClusterVersion::new(1, min_minor, 0),
        ClusterVersion::new(1, max_minor, 0),
    )
    .unwrap()
}

fn gate() -> VersionGate {
    VersionGate::new(requirement(20, 29), fast_retry(3))
}

/// A check that counts its executions
fn counted(name: &'static str, pass: bool, runs: &Arc<AtomicUsize>) -> Box<dyn PreflightCheck> {
    let runs = runs.clone();
    Box::new(check_fn(name, move || {
        let runs = runs.clone();
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            if pass {
                CheckOutcome::passed(format!("{name} ok"))
            } else {
                CheckOutcome::failed(format!("{name} denied"))
            }
        }
    }))
}

fn controller(
    source: ScriptedSource,
    reconciler: &RecordingReconciler,
    bus: &EventBus,
) -> Arc<ControllerService<ScriptedSource, RecordingReconciler>> {
    Arc::new(ControllerService::new(
        source,
        reconciler.clone(),
        bus.clone(),
        ControllerConfig {
            workers: 2,
            reconcile_retry: fast_retry(3),
            watch_retry: fast_retry(3),
        },
    ))
}

// ============================================================================
// Startup gating
// ============================================================================

/// Requirement 1.20..1.29, server 1.18: TooOld, and no check runs.
#[tokio::test]
async fn test_version_too_old_skips_preflight() {
    let bus = EventBus::default();
    let runs = Arc::new(AtomicUsize::new(0));
    let version = Arc::new(FixedVersion::new(1, 18, 0));
    let reconciler = RecordingReconciler::new(Duration::ZERO);
    let ctrl = controller(ScriptedSource::new(DATA_CENTER), &reconciler, &bus);

    let app = Application::builder(ServiceManagerConfig::default())
        .version_gate(gate(), version.clone())
        .check(counted("crd", true, &runs))
        .check(counted("rbac", true, &runs))
        .event_bus(bus.clone())
        .service(ctrl.clone())
        .build()
        .unwrap();
    let manager = app.manager().clone();

    let err = app.run(std::future::pending()).await.unwrap_err();
    match &err {
        ApplicationError::Version(VersionError::TooOld { actual, min, .. }) => {
            assert_eq!(*actual, ClusterVersion::new(1, 18, 0));
            assert_eq!(*min, ClusterVersion::new(1, 20, 0));
        }
        other => panic!("expected TooOld, got {other:?}"),
    }
    assert_eq!(err.exit_code(), EXIT_STARTUP_FAILURE);
    // A version mismatch is not retried
    assert_eq!(version.calls.load(Ordering::SeqCst), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(ctrl.source().list_calls.load(Ordering::SeqCst), 0);
    assert_eq!(manager.states(), vec![(
        "cassandradatacenter-controller".to_string(),
        ServiceState::New
    )]);
}

#[tokio::test]
async fn test_version_too_new_rejected() {
    let app = Application::builder(ServiceManagerConfig::default())
        .version_gate(gate(), Arc::new(FixedVersion::new(1, 31, 2)))
        .build()
        .unwrap();

    let err = app.run(std::future::pending()).await.unwrap_err();
    assert!(matches!(
        err,
        ApplicationError::Version(VersionError::TooNew { .. })
    ));
}

/// Checks crd, rbac, storageclass with rbac failing: only rbac is reported.
#[tokio::test]
async fn test_failed_preflight_lists_only_failing_check() {
    let runs = Arc::new(AtomicUsize::new(0));
    let reconciler = RecordingReconciler::new(Duration::ZERO);
    let bus = EventBus::default();
    let ctrl = controller(ScriptedSource::new(DATA_CENTER), &reconciler, &bus);

    let app = Application::builder(ServiceManagerConfig::default())
        .version_gate(gate(), Arc::new(FixedVersion::new(1, 27, 3)))
        .check(counted("crd", true, &runs))
        .check(counted("rbac", false, &runs))
        .check(counted("storageclass", true, &runs))
        .event_bus(bus)
        .service(ctrl.clone())
        .build()
        .unwrap();
    let manager = app.manager().clone();

    let err = app.run(std::future::pending()).await.unwrap_err();
    let ApplicationError::Preflight(failure) = &err else {
        panic!("expected preflight failure, got {err:?}");
    };
    assert_eq!(failure.failed_names(), vec!["rbac"]);
    assert_eq!(failure.passed, vec!["crd", "storageclass"]);
    assert!(err.to_string().contains("rbac denied"));
    assert_eq!(err.exit_code(), EXIT_STARTUP_FAILURE);

    // Every check ran, no service started
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert!(
        manager
            .states()
            .iter()
            .all(|(_, state)| *state == ServiceState::New)
    );
}

// ============================================================================
// Running and stopping
// ============================================================================

#[tokio::test]
async fn test_clean_run_and_shutdown() {
    let bus = EventBus::default();
    let states = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = states.clone();
    bus.subscribe(EventKind::ServiceStateChanged, "state-recorder", move |event| {
        let sink = sink.clone();
        async move {
            if let OperatorEvent::ServiceStateChanged { state, .. } = event.as_ref() {
                sink.lock().unwrap().push(*state);
            }
            Ok(())
        }
    });

    let health = Arc::new(HealthState::new());
    let reconciler = RecordingReconciler::new(Duration::from_millis(1));
    let source = ScriptedSource::new(DATA_CENTER).list(&["dc1", "dc2", "dc3"], "10");
    let ctrl = controller(source, &reconciler, &bus);

    let app = Application::builder(ServiceManagerConfig::default())
        .version_gate(gate(), Arc::new(FixedVersion::new(1, 29, 9)))
        .event_bus(bus.clone())
        .health_state(health.clone())
        .service(ctrl.clone())
        .build()
        .unwrap();
    let manager = app.manager().clone();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(app.run(async move {
        let _ = stop_rx.await;
    }));

    wait_until(WAIT, || reconciler.finished() == 3).await;
    wait_until(WAIT, || health.is_ready()).await;

    stop_tx.send(()).unwrap();
    running.await.unwrap().unwrap();

    assert!(!health.is_ready());
    assert_eq!(
        manager.states(),
        vec![(
            "cassandradatacenter-controller".to_string(),
            ServiceState::Terminated
        )]
    );
    // The monitor may coalesce quick transitions, but never reorders them
    let seen = states.lock().unwrap().clone();
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "not monotonic: {seen:?}");
    assert!(seen.contains(&ServiceState::Running));
    assert_eq!(seen.last(), Some(&ServiceState::Terminated));
}

/// One controller loses its watch while another runs: both end terminal and
/// only the failed one is reported.
#[tokio::test]
async fn test_controller_failure_stops_everything() {
    let bus = EventBus::default();
    let health = Arc::new(HealthState::new());
    let reconciler = RecordingReconciler::new(Duration::ZERO);

    let healthy = controller(
        ScriptedSource::new(DATA_CENTER).list(&["dc1"], "10"),
        &reconciler,
        &bus,
    );
    let failing = controller(
        ScriptedSource::new(BACKUP)
            .list(&[], "10")
            .watches_fail_with(WatchError::Disconnected("connection refused".into())),
        &reconciler,
        &bus,
    );

    let app = Application::builder(ServiceManagerConfig {
        shutdown_grace_period: Duration::from_secs(5),
    })
    .version_gate(gate(), Arc::new(FixedVersion::new(1, 25, 0)))
    .event_bus(bus.clone())
    .health_state(health.clone())
    .service(healthy.clone())
    .service(failing.clone())
    .build()
    .unwrap();
    let manager = app.manager().clone();

    let err = tokio::time::timeout(WAIT, app.run(std::future::pending()))
        .await
        .expect("application should stop on its own")
        .unwrap_err();

    let ApplicationError::Services(ServiceManagerError::ServicesFailed(failures)) = &err else {
        panic!("expected service failure, got {err:?}");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].service, "cassandrabackup-controller");
    assert_eq!(err.exit_code(), EXIT_SERVICE_FAILURE);

    let states = manager.states();
    assert!(states.iter().all(|(_, state)| state.is_terminal()));
    assert!(states.contains(&(
        "cassandradatacenter-controller".to_string(),
        ServiceState::Terminated
    )));
    assert!(!health.is_ready());
}

#[tokio::test]
async fn test_disabled_gate_still_runs_preflight() {
    let runs = Arc::new(AtomicUsize::new(0));
    let app = Application::builder(ServiceManagerConfig::default())
        .version_gate(
            VersionGate::disabled(),
            Arc::new(FixedVersion::new(1, 12, 0)),
        )
        .check(counted("crd", false, &runs))
        .build()
        .unwrap();

    let err = app.run(std::future::pending()).await.unwrap_err();
    assert!(matches!(err, ApplicationError::Preflight(_)));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
