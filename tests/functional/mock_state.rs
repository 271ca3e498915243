//! Mock infrastructure for driving the orchestration core without a cluster.
//!
//! - [`ScriptedSource`] stands in for LIST/WATCH: each call pops the next
//!   scripted response, and a watch can be fed live through a channel.
//! - [`FixedVersion`] reports a constant API server version.
//! - [`RecordingReconciler`] records every reconcile interval per key and
//!   fails on demand.
//!
//! Streams that run out of scripted events stay open, the way an idle watch
//! does, so controllers only see a disconnect when a test asks for one.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{StreamExt, stream};

use cassandra_operator::controller::{
    ListSnapshot, ReconcileError, Reconciler, ResourceKey, WatchError, WatchEvent, WatchSource,
    WatchStream,
};
use cassandra_operator::event_bus::{EventBus, EventKind, OperatorEvent};
use cassandra_operator::retry::RetryConfig;
use cassandra_operator::version::{ClusterVersion, VersionFetchError, VersionSource};

pub const DATA_CENTER: &str = "CassandraDataCenter";
pub const BACKUP: &str = "CassandraBackup";

pub fn key(name: &str) -> ResourceKey {
    ResourceKey::namespaced(DATA_CENTER, "default", name)
}

pub fn applied(name: &str, resource_version: &str) -> Result<WatchEvent, WatchError> {
    Ok(WatchEvent::Applied {
        key: key(name),
        resource_version: Some(resource_version.to_string()),
    })
}

/// Millisecond backoff so retry paths finish quickly
pub fn fast_retry(attempts: u32) -> RetryConfig {
    RetryConfig::with_max_attempts(attempts)
        .with_delays(Duration::from_millis(1), Duration::from_millis(5))
        .without_jitter()
}

// ============================================================================
// Watch source
// ============================================================================

/// One scripted response to `watch`
pub enum WatchScript {
    /// The watch cannot be opened
    Refuse(WatchError),
    /// These events, then an idle stream
    Events(Vec<Result<WatchEvent, WatchError>>),
    /// Events pushed by the test through a [`WatchFeed`]
    Live(mpsc::UnboundedReceiver<Result<WatchEvent, WatchError>>),
}

/// Sender half of a [`WatchScript::Live`] stream
#[derive(Clone)]
pub struct WatchFeed(mpsc::UnboundedSender<Result<WatchEvent, WatchError>>);

impl WatchFeed {
    pub fn send(&self, event: Result<WatchEvent, WatchError>) {
        self.0.unbounded_send(event).unwrap();
    }

    pub fn apply(&self, name: &str, resource_version: &str) {
        self.send(applied(name, resource_version));
    }
}

pub struct ScriptedSource {
    kind: &'static str,
    lists: Mutex<VecDeque<Result<ListSnapshot, WatchError>>>,
    /// Returned once `lists` runs out; an empty snapshot when unset
    list_fallback: Option<WatchError>,
    watches: Mutex<VecDeque<WatchScript>>,
    /// Returned once `watches` runs out; an idle stream when unset
    watch_fallback: Option<WatchError>,
    pub list_calls: AtomicUsize,
    pub watch_calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            lists: Mutex::new(VecDeque::new()),
            list_fallback: None,
            watches: Mutex::new(VecDeque::new()),
            watch_fallback: None,
            list_calls: AtomicUsize::new(0),
            watch_calls: AtomicUsize::new(0),
        }
    }

    pub fn list(self, names: &[&str], resource_version: &str) -> Self {
        let snapshot = ListSnapshot {
            keys: names
                .iter()
                .map(|n| ResourceKey::namespaced(self.kind, "default", n))
                .collect(),
            resource_version: resource_version.to_string(),
        };
        self.lists.lock().unwrap().push_back(Ok(snapshot));
        self
    }

    pub fn list_error(self, error: WatchError) -> Self {
        self.lists.lock().unwrap().push_back(Err(error));
        self
    }

    /// Every LIST beyond the scripted ones fails with `error`
    pub fn lists_fail_with(mut self, error: WatchError) -> Self {
        self.list_fallback = Some(error);
        self
    }

    pub fn watch(self, script: WatchScript) -> Self {
        self.watches.lock().unwrap().push_back(script);
        self
    }

    /// Open a live watch and return its feed
    pub fn live_watch(self) -> (Self, WatchFeed) {
        let (tx, rx) = mpsc::unbounded();
        (self.watch(WatchScript::Live(rx)), WatchFeed(tx))
    }

    /// Every WATCH beyond the scripted ones is refused with `error`
    pub fn watches_fail_with(mut self, error: WatchError) -> Self {
        self.watch_fallback = Some(error);
        self
    }
}

#[async_trait]
impl WatchSource for ScriptedSource {
    fn kind(&self) -> &str {
        self.kind
    }

    async fn list(&self) -> Result<ListSnapshot, WatchError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.lists.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => match &self.list_fallback {
                Some(error) => Err(error.clone()),
                None => Ok(ListSnapshot {
                    keys: Vec::new(),
                    resource_version: "1".to_string(),
                }),
            },
        }
    }

    async fn watch(&self, _resource_version: &str) -> Result<WatchStream, WatchError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.watches.lock().unwrap().pop_front();
        match next {
            Some(WatchScript::Refuse(error)) => Err(error),
            Some(WatchScript::Events(events)) => {
                Ok(stream::iter(events).chain(stream::pending()).boxed())
            }
            Some(WatchScript::Live(rx)) => Ok(rx.boxed()),
            None => match &self.watch_fallback {
                Some(error) => Err(error.clone()),
                None => Ok(stream::pending().boxed()),
            },
        }
    }
}

// ============================================================================
// Version source
// ============================================================================

pub struct FixedVersion {
    version: ClusterVersion,
    pub calls: AtomicUsize,
}

impl FixedVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            version: ClusterVersion::new(major, minor, patch),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl VersionSource for FixedVersion {
    async fn server_version(&self) -> Result<ClusterVersion, VersionFetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.version)
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// How the reconciler responds to a key
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Succeed,
    /// Fail permanently this many times, then succeed
    FailPermanently(u32),
    /// Fail transiently this many times, then succeed
    FailTransiently(u32),
}

/// A finished reconcile of one key
#[derive(Debug, Clone)]
pub struct Interval {
    pub key: ResourceKey,
    pub start: Instant,
    pub end: Instant,
}

#[derive(Default)]
struct Recorded {
    intervals: Vec<Interval>,
    started: Vec<ResourceKey>,
    running: HashMap<ResourceKey, usize>,
    max_same_key: usize,
}

#[derive(Clone)]
pub struct RecordingReconciler {
    delay: Duration,
    behavior: Arc<Mutex<HashMap<String, Behavior>>>,
    recorded: Arc<Mutex<Recorded>>,
}

impl RecordingReconciler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            behavior: Arc::new(Mutex::new(HashMap::new())),
            recorded: Arc::new(Mutex::new(Recorded::default())),
        }
    }

    pub fn set(&self, name: &str, behavior: Behavior) {
        self.behavior
            .lock()
            .unwrap()
            .insert(name.to_string(), behavior);
    }

    pub fn intervals(&self) -> Vec<Interval> {
        self.recorded.lock().unwrap().intervals.clone()
    }

    pub fn intervals_for(&self, name: &str) -> Vec<Interval> {
        self.intervals()
            .into_iter()
            .filter(|i| i.key.name == name)
            .collect()
    }

    pub fn started(&self, name: &str) -> usize {
        self.recorded
            .lock()
            .unwrap()
            .started
            .iter()
            .filter(|k| k.name == name)
            .count()
    }

    pub fn finished(&self) -> usize {
        self.recorded.lock().unwrap().intervals.len()
    }

    /// Highest number of concurrent reconciles seen for any single key
    pub fn max_same_key(&self) -> usize {
        self.recorded.lock().unwrap().max_same_key
    }

    fn outcome(&self, name: &str) -> Result<(), ReconcileError> {
        let mut behavior = self.behavior.lock().unwrap();
        let Some(current) = behavior.get_mut(name) else {
            return Ok(());
        };
        let (next, result) = match *current {
            Behavior::Succeed | Behavior::FailPermanently(0) | Behavior::FailTransiently(0) => {
                (Behavior::Succeed, Ok(()))
            }
            Behavior::FailPermanently(n) => (
                Behavior::FailPermanently(n - 1),
                Err(ReconcileError::Permanent(format!("{name} is invalid"))),
            ),
            Behavior::FailTransiently(n) => (
                Behavior::FailTransiently(n - 1),
                Err(ReconcileError::Transient(format!("{name} is busy"))),
            ),
        };
        *current = next;
        result
    }
}

#[async_trait]
impl Reconciler for RecordingReconciler {
    async fn reconcile(&self, key: &ResourceKey) -> Result<(), ReconcileError> {
        let start = Instant::now();
        {
            let mut recorded = self.recorded.lock().unwrap();
            recorded.started.push(key.clone());
            let running = recorded.running.entry(key.clone()).or_default();
            *running += 1;
            let running = *running;
            recorded.max_same_key = recorded.max_same_key.max(running);
        }

        tokio::time::sleep(self.delay).await;

        let mut recorded = self.recorded.lock().unwrap();
        if let Some(running) = recorded.running.get_mut(key) {
            *running -= 1;
        }
        recorded.intervals.push(Interval {
            key: key.clone(),
            start,
            end: Instant::now(),
        });
        drop(recorded);

        self.outcome(&key.name)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Collect every event of the given kinds published on `bus`
pub fn record_events(bus: &EventBus, kinds: &[EventKind]) -> Arc<Mutex<Vec<Arc<OperatorEvent>>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    for kind in kinds {
        let sink = events.clone();
        bus.subscribe(*kind, format!("recorder-{kind}"), move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event);
                Ok(())
            }
        });
    }
    events
}

/// Poll `condition` until it holds, panicking after `timeout`
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
