//! Unit tests for cassandra-operator.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components in isolation.

mod service_state_tests {
    use cassandra_operator::service::ServiceState;
    use cassandra_operator::service::lifecycle::TRANSITIONS;

    const ALL: [ServiceState; 6] = [
        ServiceState::New,
        ServiceState::Starting,
        ServiceState::Running,
        ServiceState::Stopping,
        ServiceState::Terminated,
        ServiceState::Failed,
    ];

    #[test]
    fn test_state_display() {
        assert_eq!(ServiceState::New.to_string(), "NEW");
        assert_eq!(ServiceState::Starting.to_string(), "STARTING");
        assert_eq!(ServiceState::Running.to_string(), "RUNNING");
        assert_eq!(ServiceState::Stopping.to_string(), "STOPPING");
        assert_eq!(ServiceState::Terminated.to_string(), "TERMINATED");
        assert_eq!(ServiceState::Failed.to_string(), "FAILED");
    }

    #[test]
    fn test_happy_path() {
        assert!(ServiceState::New.can_transition_to(ServiceState::Starting));
        assert!(ServiceState::Starting.can_transition_to(ServiceState::Running));
        assert!(ServiceState::Running.can_transition_to(ServiceState::Stopping));
        assert!(ServiceState::Stopping.can_transition_to(ServiceState::Terminated));
    }

    #[test]
    fn test_failure_edges() {
        assert!(ServiceState::Starting.can_transition_to(ServiceState::Failed));
        assert!(ServiceState::Running.can_transition_to(ServiceState::Failed));
        assert!(ServiceState::Stopping.can_transition_to(ServiceState::Failed));
        // Never started, so nothing could fail
        assert!(!ServiceState::New.can_transition_to(ServiceState::Failed));
    }

    #[test]
    fn test_no_restart() {
        for state in [ServiceState::Running, ServiceState::Stopping] {
            assert!(!state.can_transition_to(ServiceState::Starting));
            assert!(!state.can_transition_to(ServiceState::New));
        }
        assert!(!ServiceState::Stopping.can_transition_to(ServiceState::Running));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for terminal in [ServiceState::Terminated, ServiceState::Failed] {
            assert!(terminal.is_terminal());
            for to in ALL {
                assert!(
                    !terminal.can_transition_to(to),
                    "{terminal} should not transition to {to}"
                );
            }
        }
    }

    #[test]
    fn test_every_transition_has_description() {
        for t in TRANSITIONS {
            assert_eq!(t.from.transition_description(t.to), Some(t.description));
            assert!(!t.description.is_empty());
        }
        assert_eq!(
            ServiceState::Failed.transition_description(ServiceState::Running),
            None
        );
    }

    #[test]
    fn test_gauge_values_distinct() {
        let mut values: Vec<i64> = ALL.iter().map(|s| s.as_gauge()).collect();
        values.dedup();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
    }
}

mod controller_state_machine_tests {
    use cassandra_operator::controller::ControllerPhase;
    use cassandra_operator::controller::state_machine::{
        ControllerEvent, ControllerStateMachine, TransitionContext, TransitionResult,
    };

    #[test]
    fn test_valid_events_from_init() {
        let sm = ControllerStateMachine::new();
        assert!(sm.can_transition(&ControllerPhase::Init, &ControllerEvent::WatchEstablished));
        assert!(sm.can_transition(&ControllerPhase::Init, &ControllerEvent::ConnectionLost));
        assert!(sm.can_transition(&ControllerPhase::Init, &ControllerEvent::StopRequested));
        // Nothing to reconcile before the first watch
        assert!(!sm.can_transition(&ControllerPhase::Init, &ControllerEvent::WorkStarted));
    }

    #[test]
    fn test_valid_events_from_watching() {
        let sm = ControllerStateMachine::new();
        assert!(sm.can_transition(&ControllerPhase::Watching, &ControllerEvent::WorkStarted));
        assert!(sm.can_transition(&ControllerPhase::Watching, &ControllerEvent::ConnectionLost));
        assert!(sm.can_transition(&ControllerPhase::Watching, &ControllerEvent::StopRequested));
        assert!(!sm.can_transition(
            &ControllerPhase::Watching,
            &ControllerEvent::RetryBudgetExhausted
        ));
    }

    #[test]
    fn test_valid_events_from_reconnecting() {
        let sm = ControllerStateMachine::new();
        let events = sm.valid_events(&ControllerPhase::Reconnecting);
        assert_eq!(events.len(), 4);
        assert!(events.contains(&&ControllerEvent::WatchEstablished));
        assert!(events.contains(&&ControllerEvent::RetryBudgetExhausted));
    }

    #[test]
    fn test_terminal_phases() {
        let sm = ControllerStateMachine::new();
        for phase in [ControllerPhase::Failed, ControllerPhase::Stopped] {
            assert!(phase.is_terminal());
            assert!(
                sm.valid_events(&phase).is_empty(),
                "{phase} should have no valid events"
            );
        }
    }

    #[test]
    fn test_stop_from_every_live_phase() {
        let sm = ControllerStateMachine::new();
        for phase in [
            ControllerPhase::Init,
            ControllerPhase::Watching,
            ControllerPhase::Reconciling,
            ControllerPhase::Reconnecting,
        ] {
            assert!(
                sm.can_transition(&phase, &ControllerEvent::StopRequested),
                "Should be able to stop from {:?}",
                phase
            );
        }
    }

    #[test]
    fn test_budget_guard() {
        let sm = ControllerStateMachine::new();
        let blocked = sm.transition(
            &ControllerPhase::Reconnecting,
            ControllerEvent::RetryBudgetExhausted,
            &TransitionContext::new(3, 10),
        );
        assert!(matches!(blocked, TransitionResult::GuardFailed { .. }));

        let allowed = sm.transition(
            &ControllerPhase::Reconnecting,
            ControllerEvent::RetryBudgetExhausted,
            &TransitionContext::new(10, 10),
        );
        assert!(matches!(
            allowed,
            TransitionResult::Success {
                to: ControllerPhase::Failed,
                ..
            }
        ));
    }

    #[test]
    fn test_unlimited_budget_never_exhausts() {
        assert!(!TransitionContext::new(u32::MAX, 0).budget_exhausted());
    }

    #[test]
    fn test_drain_guard() {
        let sm = ControllerStateMachine::new();
        let busy = TransitionContext::default().with_in_flight(2);
        assert!(matches!(
            sm.transition(&ControllerPhase::Reconciling, ControllerEvent::WorkDrained, &busy),
            TransitionResult::GuardFailed { .. }
        ));
        assert!(matches!(
            sm.transition(
                &ControllerPhase::Reconciling,
                ControllerEvent::WorkDrained,
                &TransitionContext::default()
            ),
            TransitionResult::Success {
                to: ControllerPhase::Watching,
                ..
            }
        ));
    }
}

mod error_tests {
    use cassandra_operator::FailureClass;
    use cassandra_operator::controller::{ReconcileError, WatchError};
    use cassandra_operator::error::Classify;

    #[test]
    fn test_reconcile_error_is_retryable() {
        let kube_err = ReconcileError::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "timeout".to_string(),
            reason: "Timeout".to_string(),
            code: 504,
        }));
        assert!(kube_err.is_retryable());
        assert_eq!(kube_err.class(), FailureClass::TransientReconcile);

        let permanent = ReconcileError::Permanent("invalid spec".to_string());
        assert!(!permanent.is_retryable());
        assert_eq!(permanent.class(), FailureClass::PermanentReconcile);
    }

    #[test]
    fn test_expired_watch_from_gone() {
        let err: WatchError = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "too old resource version".to_string(),
            reason: "Expired".to_string(),
            code: 410,
        })
        .into();
        assert!(err.is_expired());
        assert_eq!(err.class(), FailureClass::TransientConnectivity);
    }
}
