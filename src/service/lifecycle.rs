//! Service lifecycle state machine.
//!
//! States only move forward:
//!
//! ```text
//! NEW ──► STARTING ──► RUNNING ──► STOPPING ──► TERMINATED
//!  │          │           │            │
//!  │          └───────────┴────────────┴──────► FAILED
//!  └──────────────────────────────────────────► TERMINATED (stopped before start)
//! ```
//!
//! The current state is published on a `tokio::sync::watch` channel so the
//! manager (and anyone else) can await transitions without polling.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span};

use crate::error::panic_message;
use crate::service::{Service, ServiceError};

/// Lifecycle state of a supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceState {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl ServiceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Terminated | ServiceState::Failed)
    }

    /// Whether the transition table allows `self -> to`
    pub fn can_transition_to(&self, to: ServiceState) -> bool {
        TRANSITIONS.iter().any(|t| t.from == *self && t.to == to)
    }

    /// Description of the `self -> to` transition, if it is allowed
    pub fn transition_description(&self, to: ServiceState) -> Option<&'static str> {
        TRANSITIONS
            .iter()
            .find(|t| t.from == *self && t.to == to)
            .map(|t| t.description)
    }

    /// Numeric encoding used by the state gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            ServiceState::New => 0,
            ServiceState::Starting => 1,
            ServiceState::Running => 2,
            ServiceState::Stopping => 3,
            ServiceState::Terminated => 4,
            ServiceState::Failed => 5,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::New => write!(f, "NEW"),
            ServiceState::Starting => write!(f, "STARTING"),
            ServiceState::Running => write!(f, "RUNNING"),
            ServiceState::Stopping => write!(f, "STOPPING"),
            ServiceState::Terminated => write!(f, "TERMINATED"),
            ServiceState::Failed => write!(f, "FAILED"),
        }
    }
}

/// A permitted state transition
#[derive(Debug)]
pub struct Transition {
    pub from: ServiceState,
    pub to: ServiceState,
    pub description: &'static str,
}

impl Transition {
    const fn new(from: ServiceState, to: ServiceState, description: &'static str) -> Self {
        Self {
            from,
            to,
            description,
        }
    }
}

/// Complete transition table; anything not listed is rejected.
pub const TRANSITIONS: &[Transition] = &[
    Transition::new(ServiceState::New, ServiceState::Starting, "Service start requested"),
    Transition::new(ServiceState::New, ServiceState::Terminated, "Stopped before it was started"),
    Transition::new(ServiceState::Starting, ServiceState::Running, "Startup completed"),
    Transition::new(ServiceState::Starting, ServiceState::Stopping, "Stop requested during startup"),
    Transition::new(ServiceState::Starting, ServiceState::Failed, "Startup failed"),
    Transition::new(ServiceState::Running, ServiceState::Stopping, "Stop requested"),
    Transition::new(ServiceState::Running, ServiceState::Failed, "Service crashed"),
    Transition::new(ServiceState::Stopping, ServiceState::Terminated, "Service stopped"),
    Transition::new(ServiceState::Stopping, ServiceState::Failed, "Service failed while stopping"),
];

/// A [`Service`] together with its lifecycle state.
pub struct ManagedService {
    name: String,
    service: Arc<dyn Service>,
    state: watch::Sender<ServiceState>,
    shutdown: CancellationToken,
    task: OnceLock<AbortHandle>,
    failure: OnceLock<String>,
}

impl fmt::Debug for ManagedService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedService")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ManagedService {
    pub fn new(service: Arc<dyn Service>) -> Arc<Self> {
        let (state, _) = watch::channel(ServiceState::New);
        Arc::new(Self {
            name: service.name().to_string(),
            service,
            state,
            shutdown: CancellationToken::new(),
            task: OnceLock::new(),
            failure: OnceLock::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// Why the service failed, when it did
    pub fn failure_cause(&self) -> Option<&str> {
        self.failure.get().map(String::as_str)
    }

    /// Start the service. Only the first call has an effect.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self: &Arc<Self>) -> bool {
        if !self.transition(ServiceState::Starting) {
            debug!(service = %self.name, state = %self.state(), "Start ignored");
            return false;
        }

        let this = Arc::clone(self);
        let span = info_span!("service", name = %self.name);
        let handle = tokio::spawn(async move { this.drive().await }.instrument(span));
        let _ = self.task.set(handle.abort_handle());
        true
    }

    /// Request a stop. Only the first effective call changes state.
    pub fn stop(&self) -> bool {
        self.shutdown.cancel();

        let mut from = None;
        let changed = self.state.send_if_modified(|state| {
            let target = match *state {
                ServiceState::New => ServiceState::Terminated,
                ServiceState::Starting | ServiceState::Running => ServiceState::Stopping,
                _ => return false,
            };
            from = Some(*state);
            *state = target;
            true
        });

        if let (true, Some(from)) = (changed, from) {
            info!(service = %self.name, from = %from, to = %self.state(), "Service stop requested");
        }
        changed
    }

    /// Abort the service task and record it as FAILED.
    pub fn force_fail(&self, reason: ServiceError) {
        if let Some(task) = self.task.get() {
            task.abort();
        }
        self.fail(reason.to_string());
    }

    /// Wait until the service is TERMINATED or FAILED
    pub async fn await_terminal(&self) -> ServiceState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Wait until the service leaves NEW/STARTING and return the state it reached
    pub async fn await_started(&self) -> ServiceState {
        let mut rx = self.state.subscribe();
        match rx
            .wait_for(|s| !matches!(s, ServiceState::New | ServiceState::Starting))
            .await
        {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    fn transition(&self, to: ServiceState) -> bool {
        let mut from = None;
        let changed = self.state.send_if_modified(|state| {
            if state.can_transition_to(to) {
                from = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });

        if let (true, Some(from)) = (changed, from) {
            info!(
                service = %self.name,
                from = %from,
                to = %to,
                reason = from.transition_description(to).unwrap_or_default(),
                "Service state changed"
            );
        }
        changed
    }

    fn fail(&self, reason: String) {
        let _ = self.failure.set(reason.clone());
        if self.transition(ServiceState::Failed) {
            error!(service = %self.name, reason = %reason, "Service failed");
        }
    }

    async fn drive(self: Arc<Self>) {
        match AssertUnwindSafe(self.lifecycle()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(ServiceError::Cancelled)) if self.shutdown.is_cancelled() => {
                self.transition(ServiceState::Terminated);
            }
            Ok(Err(e)) => self.fail(e.to_string()),
            Err(panic) => self.fail(format!(
                "service task panicked: {}",
                panic_message(panic.as_ref())
            )),
        }
    }

    async fn lifecycle(&self) -> Result<(), ServiceError> {
        self.service.start_up(&self.shutdown).await?;

        if !self.transition(ServiceState::Running) {
            // Stop was requested while starting up
            self.transition(ServiceState::Terminated);
            return Ok(());
        }

        self.service.run(self.shutdown.clone()).await?;

        // The rest of the system still depends on a service that stops unasked
        if !self.shutdown.is_cancelled() {
            return Err(ServiceError::Crashed(
                "exited without a stop request".to_string(),
            ));
        }
        self.transition(ServiceState::Terminated);
        Ok(())
    }
}
