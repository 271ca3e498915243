//! Finite state machine for a controller's watch/reconcile phase.
//!
//! ```text
//! INIT ──► WATCHING ⇄ RECONCILING
//!   │         │           │
//!   │         └─────┬─────┘
//!   └──────────► RECONNECTING ──► WATCHING
//!                   │
//!                   └──► FAILED (retry budget exhausted)
//!
//! any non-terminal phase ──► STOPPED (stop requested)
//! ```
//!
//! Only valid transitions are applied; anything else is reported as
//! `InvalidTransition` and leaves the phase unchanged.

use std::fmt;

/// Phase of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerPhase {
    Init,
    Watching,
    Reconciling,
    Reconnecting,
    Failed,
    Stopped,
}

impl ControllerPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ControllerPhase::Failed | ControllerPhase::Stopped)
    }
}

impl fmt::Display for ControllerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerPhase::Init => write!(f, "Init"),
            ControllerPhase::Watching => write!(f, "Watching"),
            ControllerPhase::Reconciling => write!(f, "Reconciling"),
            ControllerPhase::Reconnecting => write!(f, "Reconnecting"),
            ControllerPhase::Failed => write!(f, "Failed"),
            ControllerPhase::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Events that trigger phase transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerEvent {
    /// A watch stream was opened
    WatchEstablished,
    /// The first reconcile started while none was in flight
    WorkStarted,
    /// The last in-flight reconcile finished
    WorkDrained,
    /// LIST or WATCH failed, or the stream reported an error
    ConnectionLost,
    /// Reconnect attempts used up the retry budget
    RetryBudgetExhausted,
    StopRequested,
}

impl fmt::Display for ControllerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerEvent::WatchEstablished => write!(f, "WatchEstablished"),
            ControllerEvent::WorkStarted => write!(f, "WorkStarted"),
            ControllerEvent::WorkDrained => write!(f, "WorkDrained"),
            ControllerEvent::ConnectionLost => write!(f, "ConnectionLost"),
            ControllerEvent::RetryBudgetExhausted => write!(f, "RetryBudgetExhausted"),
            ControllerEvent::StopRequested => write!(f, "StopRequested"),
        }
    }
}

/// Context checked by transition guards
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Consecutive failed connection attempts
    pub reconnect_attempts: u32,
    /// Retry budget; 0 means unlimited
    pub max_attempts: u32,
    /// Reconciles currently running
    pub in_flight: usize,
}

impl TransitionContext {
    pub fn new(reconnect_attempts: u32, max_attempts: u32) -> Self {
        Self {
            reconnect_attempts,
            max_attempts,
            in_flight: 0,
        }
    }

    pub fn with_in_flight(mut self, in_flight: usize) -> Self {
        self.in_flight = in_flight;
        self
    }

    pub fn budget_exhausted(&self) -> bool {
        self.max_attempts != 0 && self.reconnect_attempts >= self.max_attempts
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: ControllerPhase,
    pub to: ControllerPhase,
    pub event: ControllerEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: ControllerPhase,
        to: ControllerPhase,
        event: ControllerEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionResult {
    Success {
        from: ControllerPhase,
        to: ControllerPhase,
        event: ControllerEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: ControllerPhase,
        event: ControllerEvent,
    },
    GuardFailed {
        from: ControllerPhase,
        to: ControllerPhase,
        event: ControllerEvent,
        reason: String,
    },
}

/// Transition table for controller phases
pub struct ControllerStateMachine {
    transitions: Vec<Transition>,
}

impl Default for ControllerStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerStateMachine {
    pub fn new() -> Self {
        use ControllerEvent as E;
        use ControllerPhase as P;

        Self {
            transitions: vec![
                // === Init ===
                Transition::new(P::Init, P::Watching, E::WatchEstablished, "Initial watch established"),
                Transition::new(P::Init, P::Reconnecting, E::ConnectionLost, "Initial watch could not be opened"),
                Transition::new(P::Init, P::Stopped, E::StopRequested, "Stopped before watching"),
                // === Watching ===
                Transition::new(P::Watching, P::Reconciling, E::WorkStarted, "Reconcile started"),
                Transition::new(P::Watching, P::Reconnecting, E::ConnectionLost, "Watch stream lost"),
                Transition::new(P::Watching, P::Stopped, E::StopRequested, "Stop requested"),
                // === Reconciling ===
                Transition::new(P::Reconciling, P::Watching, E::WorkDrained, "All reconciles finished"),
                Transition::new(P::Reconciling, P::Reconnecting, E::ConnectionLost, "Watch stream lost while reconciling"),
                Transition::new(P::Reconciling, P::Stopped, E::StopRequested, "Stop requested while reconciling"),
                // === Reconnecting ===
                Transition::new(P::Reconnecting, P::Watching, E::WatchEstablished, "Watch re-established"),
                Transition::new(P::Reconnecting, P::Reconnecting, E::ConnectionLost, "Reconnect attempt failed"),
                Transition::new(P::Reconnecting, P::Failed, E::RetryBudgetExhausted, "Reconnect retry budget exhausted"),
                Transition::new(P::Reconnecting, P::Stopped, E::StopRequested, "Stop requested while reconnecting"),
                // Failed and Stopped are terminal
            ],
        }
    }

    /// Attempt to transition to a new phase based on an event
    pub fn transition(
        &self,
        current: &ControllerPhase,
        event: ControllerEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => match self.check_guard(t, ctx) {
                Some(reason) => TransitionResult::GuardFailed {
                    from: t.from,
                    to: t.to,
                    event,
                    reason,
                },
                None => TransitionResult::Success {
                    from: t.from,
                    to: t.to,
                    event,
                    description: t.description,
                },
            },
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &ControllerPhase, event: &ControllerEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// Get all valid events for a given phase
    pub fn valid_events(&self, phase: &ControllerPhase) -> Vec<&ControllerEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *phase)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            ControllerEvent::RetryBudgetExhausted if !ctx.budget_exhausted() => Some(format!(
                "Retry budget not exhausted: {}/{} attempts",
                ctx.reconnect_attempts, ctx.max_attempts
            )),
            ControllerEvent::WorkDrained if ctx.in_flight > 0 => Some(format!(
                "{} reconcile(s) still in flight",
                ctx.in_flight
            )),
            _ => None,
        }
    }
}
