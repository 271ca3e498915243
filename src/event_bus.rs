//! In-process publish/subscribe bus decoupling controllers from each other.
//!
//! Handlers are registered per [`EventKind`]. Every handler subscribed at the
//! moment `publish` is called receives the event exactly once; there is no
//! buffering or replay for later subscribers. A handler that errors, panics
//! or exceeds the handler timeout is logged and counted, and never affects
//! the publisher or the other handlers of the same event.
//!
//! Two dispatch policies are available:
//! - [`DispatchPolicy::Synchronous`]: the publisher awaits each handler in
//!   subscription order, each bounded by the handler timeout.
//! - [`DispatchPolicy::Queued`]: each subscription owns a FIFO drained by its
//!   own task, so `publish` never waits on a handler.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::controller::ResourceKey;
use crate::error::panic_message;
use crate::service::ServiceState;

/// Default upper bound for a single handler invocation
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

/// Event kinds handlers subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ResourceChanged,
    ReconcileSucceeded,
    ReconcileFailed,
    ReconcileInterrupted,
    WatchReconnecting,
    ServiceStateChanged,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::ResourceChanged => write!(f, "ResourceChanged"),
            EventKind::ReconcileSucceeded => write!(f, "ReconcileSucceeded"),
            EventKind::ReconcileFailed => write!(f, "ReconcileFailed"),
            EventKind::ReconcileInterrupted => write!(f, "ReconcileInterrupted"),
            EventKind::WatchReconnecting => write!(f, "WatchReconnecting"),
            EventKind::ServiceStateChanged => write!(f, "ServiceStateChanged"),
        }
    }
}

/// How a watched object changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Applied,
    Deleted,
}

/// Events published by controllers and the service manager.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorEvent {
    /// A watch event was received and the key was queued
    ResourceChanged { key: ResourceKey, change: ChangeType },
    ReconcileSucceeded {
        key: ResourceKey,
        attempts: u32,
        duration: Duration,
    },
    /// Permanent error, or transient error after the retry budget
    ReconcileFailed {
        key: ResourceKey,
        error: String,
        attempts: u32,
        retryable: bool,
    },
    /// The controller stopped before the key could be (re)processed
    ReconcileInterrupted { key: ResourceKey, attempts: u32 },
    WatchReconnecting {
        controller: String,
        attempt: u32,
        error: String,
    },
    ServiceStateChanged { service: String, state: ServiceState },
}

impl OperatorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            OperatorEvent::ResourceChanged { .. } => EventKind::ResourceChanged,
            OperatorEvent::ReconcileSucceeded { .. } => EventKind::ReconcileSucceeded,
            OperatorEvent::ReconcileFailed { .. } => EventKind::ReconcileFailed,
            OperatorEvent::ReconcileInterrupted { .. } => EventKind::ReconcileInterrupted,
            OperatorEvent::WatchReconnecting { .. } => EventKind::WatchReconnecting,
            OperatorEvent::ServiceStateChanged { .. } => EventKind::ServiceStateChanged,
        }
    }
}

/// Error returned by a handler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        HandlerError(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        HandlerError(s.to_string())
    }
}

type HandlerFn =
    dyn Fn(Arc<OperatorEvent>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync;

/// Handler invocation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPolicy {
    Synchronous,
    Queued,
}

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    pub policy: DispatchPolicy,
    pub handler_timeout: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            policy: DispatchPolicy::Synchronous,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }
}

/// Outcome of one `publish` call.
///
/// With queued dispatch, faults surface later in the handler task and are
/// only reflected in [`EventBus::faults`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub recipients: usize,
    pub faults: usize,
}

struct Subscription {
    id: u64,
    name: String,
    handler: Arc<HandlerFn>,
    queue: Option<mpsc::UnboundedSender<Arc<OperatorEvent>>>,
}

struct BusInner {
    subscriptions: DashMap<EventKind, Vec<Arc<Subscription>>>,
    next_id: AtomicU64,
    faults: Arc<AtomicU64>,
    config: EventBusConfig,
}

/// Cheaply cloneable handle to a shared bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("policy", &self.inner.config.policy)
            .field("handler_timeout", &self.inner.config.handler_timeout)
            .finish()
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscriptions: DashMap::new(),
                next_id: AtomicU64::new(1),
                faults: Arc::new(AtomicU64::new(0)),
                config,
            }),
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    /// Register a handler for one event kind.
    ///
    /// With [`DispatchPolicy::Queued`] this spawns the subscription's drain
    /// task and must be called from within a Tokio runtime.
    pub fn subscribe<F, Fut>(
        &self,
        kind: EventKind,
        name: impl Into<String>,
        handler: F,
    ) -> SubscriptionHandle
    where
        F: Fn(Arc<OperatorEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let name = name.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Arc<HandlerFn> = Arc::new(move |event| handler(event).boxed());

        let queue = match self.inner.config.policy {
            DispatchPolicy::Synchronous => None,
            DispatchPolicy::Queued => {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(drain_queue(
                    rx,
                    handler.clone(),
                    name.clone(),
                    kind,
                    self.inner.config.handler_timeout,
                    self.inner.faults.clone(),
                ));
                Some(tx)
            }
        };

        debug!(handler = %name, kind = %kind, id, "Subscribed event handler");

        self.inner
            .subscriptions
            .entry(kind)
            .or_default()
            .push(Arc::new(Subscription {
                id,
                name: name.clone(),
                handler,
                queue,
            }));

        SubscriptionHandle {
            id,
            kind,
            name,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every handler currently subscribed to its kind.
    pub async fn publish(&self, event: OperatorEvent) -> PublishReport {
        let kind = event.kind();
        let event = Arc::new(event);

        // Snapshot so handlers may subscribe or publish without holding the map
        let recipients: Vec<Arc<Subscription>> = self
            .inner
            .subscriptions
            .get(&kind)
            .map(|subs| subs.value().clone())
            .unwrap_or_default();

        let mut report = PublishReport {
            recipients: recipients.len(),
            faults: 0,
        };

        for sub in &recipients {
            let delivered = match &sub.queue {
                Some(tx) => tx.send(event.clone()).is_ok(),
                None => {
                    deliver(
                        sub.handler.as_ref(),
                        &sub.name,
                        kind,
                        event.clone(),
                        self.inner.config.handler_timeout,
                    )
                    .await
                }
            };
            if !delivered {
                report.faults += 1;
                self.inner.faults.fetch_add(1, Ordering::Relaxed);
            }
        }

        trace!(kind = %kind, recipients = report.recipients, faults = report.faults, "Published event");
        report
    }

    /// Number of handlers currently subscribed to `kind`
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .subscriptions
            .get(&kind)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Total handler faults observed since the bus was created
    pub fn faults(&self) -> u64 {
        self.inner.faults.load(Ordering::Relaxed)
    }

    /// Shared fault counter, readable without holding the bus
    pub fn fault_counter(&self) -> Arc<AtomicU64> {
        self.inner.faults.clone()
    }
}

/// Returned by [`EventBus::subscribe`]; dropping it keeps the subscription.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    kind: EventKind,
    name: String,
    bus: Weak<BusInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Remove the subscription. Returns false when it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(bus) = self.bus.upgrade() else {
            return false;
        };
        let Some(mut subs) = bus.subscriptions.get_mut(&self.kind) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != self.id);
        let removed = subs.len() < before;
        if removed {
            debug!(handler = %self.name, kind = %self.kind, id = self.id, "Unsubscribed event handler");
        }
        removed
    }
}

/// Invoke one handler, containing any fault. Returns true on success.
async fn deliver(
    handler: &HandlerFn,
    name: &str,
    kind: EventKind,
    event: Arc<OperatorEvent>,
    timeout: Duration,
) -> bool {
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(fut) => fut,
        Err(panic) => {
            error!(handler = %name, kind = %kind, panic = %panic_message(panic.as_ref()), "Event handler panicked");
            return false;
        }
    };

    match tokio::time::timeout(timeout, AssertUnwindSafe(fut).catch_unwind()).await {
        Ok(Ok(Ok(()))) => true,
        Ok(Ok(Err(e))) => {
            warn!(handler = %name, kind = %kind, error = %e, "Event handler failed");
            false
        }
        Ok(Err(panic)) => {
            error!(handler = %name, kind = %kind, panic = %panic_message(panic.as_ref()), "Event handler panicked");
            false
        }
        Err(_) => {
            warn!(
                handler = %name,
                kind = %kind,
                timeout_ms = timeout.as_millis() as u64,
                "Event handler timed out"
            );
            false
        }
    }
}

async fn drain_queue(
    mut rx: mpsc::UnboundedReceiver<Arc<OperatorEvent>>,
    handler: Arc<HandlerFn>,
    name: String,
    kind: EventKind,
    timeout: Duration,
    faults: Arc<AtomicU64>,
) {
    while let Some(event) = rx.recv().await {
        if !deliver(handler.as_ref(), &name, kind, event, timeout).await {
            faults.fetch_add(1, Ordering::Relaxed);
        }
    }
    debug!(handler = %name, kind = %kind, "Event handler queue closed");
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn changed(name: &str) -> OperatorEvent {
        OperatorEvent::ResourceChanged {
            key: ResourceKey::namespaced("CassandraDataCenter", "default", name),
            change: ChangeType::Applied,
        }
    }

    fn counting(bus: &EventBus, kind: EventKind, counter: &Arc<AtomicUsize>) -> SubscriptionHandle {
        let counter = counter.clone();
        bus.subscribe(kind, "counter", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_event_once() {
        let bus = EventBus::default();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            counting(&bus, EventKind::ResourceChanged, &counter);
        }

        let report = bus.publish(changed("dc1")).await;
        assert_eq!(report, PublishReport { recipients: 4, faults: 0 });
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_faulty_handlers_are_isolated() {
        let bus = EventBus::new(EventBusConfig {
            policy: DispatchPolicy::Synchronous,
            handler_timeout: Duration::from_millis(50),
        });
        let counter = Arc::new(AtomicUsize::new(0));

        counting(&bus, EventKind::ResourceChanged, &counter);
        bus.subscribe(EventKind::ResourceChanged, "errors", |_| async {
            Err(HandlerError::from("handler refused"))
        });
        bus.subscribe(EventKind::ResourceChanged, "panics", |_| async {
            panic!("handler exploded")
        });
        bus.subscribe(EventKind::ResourceChanged, "hangs", |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        counting(&bus, EventKind::ResourceChanged, &counter);

        let report = bus.publish(changed("dc1")).await;
        assert_eq!(report.recipients, 5);
        assert_eq!(report.faults, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(bus.faults(), 3);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_no_replay() {
        let bus = EventBus::default();
        let early = Arc::new(AtomicUsize::new(0));
        let late = Arc::new(AtomicUsize::new(0));

        counting(&bus, EventKind::ResourceChanged, &early);
        bus.publish(changed("dc1")).await;
        counting(&bus, EventKind::ResourceChanged, &late);

        assert_eq!(early.load(Ordering::SeqCst), 1);
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_kinds_are_isolated() {
        let bus = EventBus::default();
        let counter = Arc::new(AtomicUsize::new(0));
        counting(&bus, EventKind::ReconcileFailed, &counter);

        let report = bus.publish(changed("dc1")).await;
        assert_eq!(report.recipients, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = counting(&bus, EventKind::ResourceChanged, &counter);
        assert_eq!(bus.subscriber_count(EventKind::ResourceChanged), 1);

        assert!(handle.unsubscribe());
        assert_eq!(bus.subscriber_count(EventKind::ResourceChanged), 0);

        bus.publish(changed("dc1")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_may_publish_without_deadlock() {
        let bus = EventBus::default();
        let counter = Arc::new(AtomicUsize::new(0));
        counting(&bus, EventKind::ReconcileSucceeded, &counter);

        let inner_bus = bus.clone();
        bus.subscribe(EventKind::ResourceChanged, "forwarder", move |event| {
            let bus = inner_bus.clone();
            async move {
                if let OperatorEvent::ResourceChanged { key, .. } = event.as_ref() {
                    bus.publish(OperatorEvent::ReconcileSucceeded {
                        key: key.clone(),
                        attempts: 1,
                        duration: Duration::ZERO,
                    })
                    .await;
                }
                Ok(())
            }
        });

        let report = bus.publish(changed("dc1")).await;
        assert_eq!(report.faults, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queued_dispatch_preserves_order_per_handler() {
        let bus = EventBus::new(EventBusConfig {
            policy: DispatchPolicy::Queued,
            handler_timeout: Duration::from_secs(1),
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let sink = seen.clone();
        bus.subscribe(EventKind::ResourceChanged, "recorder", move |event| {
            let sink = sink.clone();
            let done_tx = done_tx.clone();
            async move {
                if let OperatorEvent::ResourceChanged { key, .. } = event.as_ref() {
                    // Yield so out-of-order delivery would show up
                    tokio::task::yield_now().await;
                    sink.lock().unwrap().push(key.name.clone());
                }
                let _ = done_tx.send(());
                Ok(())
            }
        });

        for i in 0..20 {
            let report = bus.publish(changed(&format!("dc{i}"))).await;
            assert_eq!(report.recipients, 1);
        }
        for _ in 0..20 {
            done_rx.recv().await.unwrap();
        }

        let expected: Vec<String> = (0..20).map(|i| format!("dc{i}")).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_queued_publish_does_not_wait_for_handler() {
        let bus = EventBus::new(EventBusConfig {
            policy: DispatchPolicy::Queued,
            handler_timeout: Duration::from_secs(60),
        });
        bus.subscribe(EventKind::ResourceChanged, "slow", |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });

        let published = tokio::time::timeout(Duration::from_secs(1), bus.publish(changed("dc1"))).await;
        assert!(published.is_ok());
    }

    #[test]
    fn test_event_kind_mapping() {
        assert_eq!(changed("x").kind(), EventKind::ResourceChanged);
        let failed = OperatorEvent::ReconcileFailed {
            key: ResourceKey::namespaced("CassandraBackup", "ns", "b"),
            error: "boom".into(),
            attempts: 3,
            retryable: true,
        };
        assert_eq!(failed.kind(), EventKind::ReconcileFailed);
        assert_eq!(EventKind::ReconcileFailed.to_string(), "ReconcileFailed");
    }
}
