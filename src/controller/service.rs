//! Generic watch-then-reconcile controller, supervised as a [`Service`].
//!
//! One watch loop reads LIST/WATCH results into the [`WorkQueue`]; a fixed
//! number of workers drain it through the [`Reconciler`]. Connection losses
//! go through the reconnect budget; exhausting it fails the service.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashSet;
use futures::future::join_all;
use futures::{FutureExt, StreamExt};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::controller::queue::{Enqueued, WorkQueue};
use crate::controller::state_machine::{
    ControllerEvent, ControllerPhase, ControllerStateMachine, TransitionContext, TransitionResult,
};
use crate::controller::{
    ControllerError, ReconcileError, Reconciler, ResourceKey, WatchError, WatchEvent, WatchSource,
    WatchStream,
};
use crate::error::panic_message;
use crate::event_bus::{ChangeType, EventBus, OperatorEvent};
use crate::retry::{RetryConfig, sleep_or_cancel};
use crate::service::{Service, ServiceError};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Concurrent reconciles for distinct keys
    pub workers: usize,
    /// Per-key budget for transient reconcile errors
    pub reconcile_retry: RetryConfig,
    /// Budget for consecutive LIST/WATCH failures
    pub watch_retry: RetryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            reconcile_retry: RetryConfig::default(),
            watch_retry: RetryConfig::with_max_attempts(10),
        }
    }
}

/// How a single watch stream ended
enum StreamEnd {
    Cancelled,
    /// Server-side timeout; reopen from the last version
    Closed(String),
    Failed(WatchError, String),
}

pub struct ControllerService<W, R> {
    name: String,
    source: W,
    reconciler: R,
    bus: EventBus,
    config: ControllerConfig,
    queue: WorkQueue,
    machine: ControllerStateMachine,
    phase: watch::Sender<ControllerPhase>,
    in_flight: AtomicUsize,
    failed_keys: DashSet<ResourceKey>,
    /// Version from the initial LIST, consumed by the watch loop
    resume_from: Mutex<Option<String>>,
}

impl<W: WatchSource, R: Reconciler> ControllerService<W, R> {
    pub fn new(source: W, reconciler: R, bus: EventBus, config: ControllerConfig) -> Self {
        let name = format!("{}-controller", source.kind().to_lowercase());
        let (phase, _) = watch::channel(ControllerPhase::Init);
        Self {
            name,
            source,
            reconciler,
            bus,
            config,
            queue: WorkQueue::new(),
            machine: ControllerStateMachine::new(),
            phase,
            in_flight: AtomicUsize::new(0),
            failed_keys: DashSet::new(),
            resume_from: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &W {
        &self.source
    }

    pub fn phase(&self) -> ControllerPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ControllerPhase> {
        self.phase.subscribe()
    }

    /// Keys whose last reconcile failed and have seen no watch event since
    pub fn failed_keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = self.failed_keys.iter().map(|k| k.clone()).collect();
        keys.sort();
        keys
    }

    fn fire(&self, event: ControllerEvent, attempts: u32) {
        let ctx = TransitionContext::new(attempts, self.config.watch_retry.max_attempts)
            .with_in_flight(self.in_flight.load(Ordering::SeqCst));

        let mut outcome = None;
        self.phase.send_if_modified(|phase| {
            let result = self.machine.transition(phase, event, &ctx);
            let changed = match &result {
                TransitionResult::Success { to, .. } => {
                    let changed = *phase != *to;
                    *phase = *to;
                    changed
                }
                _ => false,
            };
            outcome = Some(result);
            changed
        });

        match outcome {
            Some(TransitionResult::Success {
                from,
                to,
                description,
                ..
            }) if from != to => {
                info!(from = %from, to = %to, event = %event, "{}", description);
            }
            Some(TransitionResult::GuardFailed { reason, .. }) => {
                debug!(event = %event, reason = %reason, "Phase transition blocked");
            }
            _ => {}
        }
    }

    async fn enqueue(&self, key: ResourceKey, change: ChangeType) {
        // A new event clears the failed mark
        self.failed_keys.remove(&key);

        let outcome = self.queue.add(key.clone());
        debug!(key = %key, ?change, ?outcome, "Watch event");
        if outcome != Enqueued::Rejected {
            self.bus
                .publish(OperatorEvent::ResourceChanged { key, change })
                .await;
        }
    }

    async fn list_and_enqueue(&self) -> Result<String, WatchError> {
        let snapshot = self.source.list().await?;
        info!(
            objects = snapshot.keys.len(),
            resource_version = %snapshot.resource_version,
            "Listed current objects"
        );
        for key in snapshot.keys {
            self.enqueue(key, ChangeType::Applied).await;
        }
        Ok(snapshot.resource_version)
    }

    /// Initial LIST under the reconnect budget
    async fn initial_list(&self, shutdown: &CancellationToken) -> Result<String, ServiceError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(ServiceError::Cancelled),
                result = self.list_and_enqueue() => result,
            };

            match result {
                Ok(version) => return Ok(version),
                Err(e) if self.config.watch_retry.allows_retry(attempt) => {
                    let delay = self.config.watch_retry.delay_for_attempt(attempt);
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "Initial list failed, retrying");
                    if !sleep_or_cancel(delay, shutdown).await {
                        return Err(ServiceError::Cancelled);
                    }
                }
                Err(e) => {
                    error!(attempt, error = %e, "Initial list failed, giving up");
                    self.fire(ControllerEvent::ConnectionLost, attempt);
                    self.fire(ControllerEvent::RetryBudgetExhausted, attempt);
                    return Err(ControllerError::WatchLost {
                        controller: self.name.clone(),
                        attempts: attempt,
                        last_error: e,
                    }
                    .into());
                }
            }
        }
    }

    async fn consume(
        &self,
        mut stream: WatchStream,
        from: String,
        stop: &CancellationToken,
        received: &mut bool,
    ) -> StreamEnd {
        let mut last = from;
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => return StreamEnd::Cancelled,
                next = stream.next() => next,
            };

            match next {
                None => return StreamEnd::Closed(last),
                Some(Err(e)) => return StreamEnd::Failed(e, last),
                Some(Ok(event)) => {
                    *received = true;
                    if let Some(version) = event.resource_version() {
                        last = version.to_string();
                    }
                    match event {
                        WatchEvent::Applied { key, .. } => {
                            self.enqueue(key, ChangeType::Applied).await
                        }
                        WatchEvent::Deleted { key, .. } => {
                            self.enqueue(key, ChangeType::Deleted).await
                        }
                        WatchEvent::Bookmark { .. } => {}
                    }
                }
            }
        }
    }

    /// Keep a watch open until `stop` fires or the reconnect budget runs out.
    async fn watch_loop(&self, stop: &CancellationToken) -> Result<(), ControllerError> {
        let mut resume = self.resume_from.lock().await.take();
        let mut failures = 0u32;

        loop {
            if stop.is_cancelled() {
                return Ok(());
            }

            let version = match resume.take() {
                Some(version) => Ok(version),
                None => self.list_and_enqueue().await,
            };

            let error = match version {
                Err(e) => e,
                Ok(version) => {
                    let opened = tokio::select! {
                        biased;
                        _ = stop.cancelled() => return Ok(()),
                        opened = self.source.watch(&version) => opened,
                    };

                    match opened {
                        Err(e) => {
                            resume = Some(version);
                            e
                        }
                        Ok(stream) => {
                            self.fire(ControllerEvent::WatchEstablished, failures);
                            debug!(resource_version = %version, "Watch opened");

                            // An open that never yields an event does not count as a reconnect
                            let mut received = false;
                            let end = self.consume(stream, version, stop, &mut received).await;
                            if received {
                                failures = 0;
                            }

                            match end {
                                StreamEnd::Cancelled => return Ok(()),
                                StreamEnd::Closed(last) => {
                                    debug!(resource_version = %last, "Watch stream closed, reopening");
                                    resume = Some(last);
                                    continue;
                                }
                                StreamEnd::Failed(e, last) => {
                                    resume = Some(last);
                                    e
                                }
                            }
                        }
                    }
                }
            };

            if error.is_expired() {
                info!(error = %error, "Resource version expired, re-listing");
                resume = None;
            }

            failures += 1;
            self.fire(ControllerEvent::ConnectionLost, failures);

            if !self.config.watch_retry.allows_retry(failures) {
                error!(attempts = failures, error = %error, "Watch retry budget exhausted");
                self.fire(ControllerEvent::RetryBudgetExhausted, failures);
                return Err(ControllerError::WatchLost {
                    controller: self.name.clone(),
                    attempts: failures,
                    last_error: error,
                });
            }

            let delay = self.config.watch_retry.delay_for_attempt(failures);
            warn!(
                attempt = failures,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Watch lost, reconnecting"
            );
            self.bus
                .publish(OperatorEvent::WatchReconnecting {
                    controller: self.name.clone(),
                    attempt: failures,
                    error: error.to_string(),
                })
                .await;

            if !sleep_or_cancel(delay, stop).await {
                return Ok(());
            }
        }
    }

    async fn worker(&self, stop: &CancellationToken) {
        while let Some(key) = self.queue.next().await {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) == 0 {
                self.fire(ControllerEvent::WorkStarted, 0);
            }

            self.process(&key, stop)
                .instrument(info_span!("reconcile", key = %key))
                .await;
            self.queue.done(&key);

            if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.fire(ControllerEvent::WorkDrained, 0);
            }
        }
    }

    async fn process(&self, key: &ResourceKey, stop: &CancellationToken) {
        let start = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = AssertUnwindSafe(self.reconciler.reconcile(key))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(ReconcileError::Permanent(format!(
                        "reconciler panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                });

            let error = match result {
                Ok(()) => {
                    debug!(attempts = attempt, "Reconciled");
                    self.bus
                        .publish(OperatorEvent::ReconcileSucceeded {
                            key: key.clone(),
                            attempts: attempt,
                            duration: start.elapsed(),
                        })
                        .await;
                    return;
                }
                Err(e) => e,
            };

            let retryable = error.is_retryable();
            if retryable && self.config.reconcile_retry.allows_retry(attempt) {
                let delay = self.config.reconcile_retry.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Reconcile failed, retrying"
                );
                if sleep_or_cancel(delay, stop).await {
                    continue;
                }
                warn!(attempts = attempt, "Reconcile interrupted by shutdown");
                self.bus
                    .publish(OperatorEvent::ReconcileInterrupted {
                        key: key.clone(),
                        attempts: attempt,
                    })
                    .await;
                return;
            }

            error!(attempts = attempt, retryable, error = %error, "Reconcile failed");
            self.failed_keys.insert(key.clone());
            self.bus
                .publish(OperatorEvent::ReconcileFailed {
                    key: key.clone(),
                    error: error.to_string(),
                    attempts: attempt,
                    retryable,
                })
                .await;
            return;
        }
    }
}

#[async_trait]
impl<W: WatchSource, R: Reconciler> Service for ControllerService<W, R> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start_up(&self, shutdown: &CancellationToken) -> Result<(), ServiceError> {
        let version = self
            .initial_list(shutdown)
            .instrument(info_span!("controller", name = %self.name))
            .await?;
        *self.resume_from.lock().await = Some(version);
        Ok(())
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<(), ServiceError> {
        let span = info_span!("controller", name = %self.name);
        // Cancelled on a stop request or when the watch is lost for good
        let stop = shutdown.child_token();

        let watch = async {
            let result = self.watch_loop(&stop).await;
            stop.cancel();
            for key in self.queue.shutdown() {
                debug!(key = %key, "Dropping queued key on shutdown");
                self.bus
                    .publish(OperatorEvent::ReconcileInterrupted { key, attempts: 0 })
                    .await;
            }
            result
        };

        let workers = join_all((0..self.config.workers.max(1)).map(|id| {
            self.worker(&stop)
                .instrument(info_span!("worker", id))
        }));

        let (result, _) = async { tokio::join!(watch, workers) }
            .instrument(span)
            .await;

        match result {
            Ok(()) => {
                self.fire(ControllerEvent::StopRequested, 0);
                info!(controller = %self.name, "Controller stopped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
