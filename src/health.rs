//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (200 once every service is RUNNING)
//! - `/metrics` - Prometheus metrics endpoint
//!
//! Metrics are fed from the [`EventBus`] by [`subscribe_metrics`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::event_bus::{EventBus, EventKind, OperatorEvent, SubscriptionHandle};
use crate::service::{Service, ServiceError, ServiceState};

pub const HEALTH_SERVICE_NAME: &str = "health-server";

/// Labels for reconcile metrics (resource kind)
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct KindLabels {
    pub kind: String,
}

impl EncodeLabelSet for KindLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("kind", self.kind.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for per-service and per-controller metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ServiceLabels {
    pub service: String,
}

impl EncodeLabelSet for ServiceLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("service", self.service.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the operator
pub struct Metrics {
    /// Successful reconciliations
    pub reconciliations_total: Family<KindLabels, Counter>,
    /// Reconciliations that ended in ReconcileFailed
    pub reconciliation_errors_total: Family<KindLabels, Counter>,
    /// Reconciliations abandoned on shutdown
    pub reconciliations_interrupted_total: Family<KindLabels, Counter>,
    /// Reconciliation duration histogram, including retries
    pub reconcile_duration_seconds: Family<KindLabels, Histogram>,
    /// Watch reconnect attempts per controller
    pub watch_reconnects_total: Family<ServiceLabels, Counter>,
    /// Lifecycle state per service (0=NEW .. 5=FAILED)
    pub service_state: Family<ServiceLabels, Gauge>,
    /// Event handler faults (errors, panics, timeouts)
    pub event_handler_faults: Gauge,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "cassandra_operator_reconciliations",
            "Total number of successful reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "cassandra_operator_reconciliation_errors",
            "Total number of failed reconciliations",
            reconciliation_errors_total.clone(),
        );

        let reconciliations_interrupted_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "cassandra_operator_reconciliations_interrupted",
            "Total number of reconciliations interrupted by shutdown",
            reconciliations_interrupted_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<KindLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "cassandra_operator_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let watch_reconnects_total = Family::<ServiceLabels, Counter>::default();
        registry.register(
            "cassandra_operator_watch_reconnects",
            "Total number of watch reconnect attempts",
            watch_reconnects_total.clone(),
        );

        let service_state = Family::<ServiceLabels, Gauge>::default();
        registry.register(
            "cassandra_operator_service_state",
            "Lifecycle state of each supervised service (0=NEW, 1=STARTING, 2=RUNNING, 3=STOPPING, 4=TERMINATED, 5=FAILED)",
            service_state.clone(),
        );

        let event_handler_faults = Gauge::default();
        registry.register(
            "cassandra_operator_event_handler_faults",
            "Event handler faults since startup",
            event_handler_faults.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconciliations_interrupted_total,
            reconcile_duration_seconds,
            watch_reconnects_total,
            service_state,
            event_handler_faults,
            registry,
        }
    }

    fn kind(kind: &str) -> KindLabels {
        KindLabels {
            kind: kind.to_string(),
        }
    }

    fn service(name: &str) -> ServiceLabels {
        ServiceLabels {
            service: name.to_string(),
        }
    }

    /// Record a successful reconciliation
    pub fn record_reconcile(&self, kind: &str, duration_secs: f64) {
        let labels = Self::kind(kind);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, kind: &str) {
        self.reconciliation_errors_total
            .get_or_create(&Self::kind(kind))
            .inc();
    }

    pub fn record_interrupted(&self, kind: &str) {
        self.reconciliations_interrupted_total
            .get_or_create(&Self::kind(kind))
            .inc();
    }

    pub fn record_reconnect(&self, controller: &str) {
        self.watch_reconnects_total
            .get_or_create(&Self::service(controller))
            .inc();
    }

    pub fn set_service_state(&self, service: &str, state: ServiceState) {
        self.service_state
            .get_or_create(&Self::service(service))
            .set(state.as_gauge());
    }

    pub fn set_handler_faults(&self, faults: u64) {
        self.event_handler_faults
            .set(i64::try_from(faults).unwrap_or(i64::MAX));
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether every supervised service is RUNNING
    ready: AtomicBool,
    /// Metrics registry
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            metrics: Metrics::new(),
        }
    }

    /// Mark the operator as ready or not ready
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Check if the operator is ready
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Record bus events into `state.metrics`.
///
/// Dropping the returned handles keeps the subscriptions.
pub fn subscribe_metrics(bus: &EventBus, state: Arc<HealthState>) -> Vec<SubscriptionHandle> {
    let kinds = [
        EventKind::ReconcileSucceeded,
        EventKind::ReconcileFailed,
        EventKind::ReconcileInterrupted,
        EventKind::WatchReconnecting,
        EventKind::ServiceStateChanged,
    ];

    kinds
        .into_iter()
        .map(|kind| {
            let state = state.clone();
            let fault_counter = bus.fault_counter();
            bus.subscribe(kind, "metrics", move |event| {
                let state = state.clone();
                let faults = fault_counter.load(Ordering::Relaxed);
                async move {
                    let metrics = &state.metrics;
                    metrics.set_handler_faults(faults);
                    match event.as_ref() {
                        OperatorEvent::ReconcileSucceeded { key, duration, .. } => {
                            metrics.record_reconcile(&key.kind, duration.as_secs_f64())
                        }
                        OperatorEvent::ReconcileFailed { key, .. } => metrics.record_error(&key.kind),
                        OperatorEvent::ReconcileInterrupted { key, .. } => {
                            metrics.record_interrupted(&key.kind)
                        }
                        OperatorEvent::WatchReconnecting { controller, .. } => {
                            metrics.record_reconnect(controller)
                        }
                        OperatorEvent::ServiceStateChanged { service, state } => {
                            metrics.set_service_state(service, *state)
                        }
                        OperatorEvent::ResourceChanged { .. } => {}
                    }
                    Ok(())
                }
            })
        })
        .collect()
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until every service is RUNNING, and again
/// once shutdown begins.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// The health server as a supervised service.
///
/// Binding happens in `start_up`, so a port conflict fails startup instead
/// of surfacing later.
pub struct HealthServer {
    state: Arc<HealthState>,
    addr: SocketAddr,
    listener: tokio::sync::Mutex<Option<TcpListener>>,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self {
            state,
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            listener: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl Service for HealthServer {
    fn name(&self) -> &str {
        HEALTH_SERVICE_NAME
    }

    async fn start_up(&self, _shutdown: &CancellationToken) -> Result<(), ServiceError> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Health server listening");
        *self.listener.lock().await = Some(listener);
        Ok(())
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<(), ServiceError> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| ServiceError::Startup("listener not bound".to_string()))?;

        axum::serve(listener, create_router(self.state.clone()))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Health server stopped");
        Ok(())
    }
}
