use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::handlers::{HandlerTable, TransitionContext};
use super::states::{CaseState, StateTransition};
use crate::metrics::MetricsCollector;
use crate::scheduler::Payload;

/// Serializable view of a case machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseSnapshot {
    pub case_id: String,
    pub current_state: CaseState,
    pub created_at: DateTime<Utc>,
    pub is_terminal: bool,
    pub duration_in_state_secs: f64,
    pub total_duration_secs: f64,
    pub transitions: Vec<StateTransition>,
}

/// Lifecycle of one case.
///
/// Moves are validated against [`CaseState::valid_transitions`]; every
/// accepted move is appended to an immutable history and then handed to the
/// handlers registered for the new state.
pub struct CaseStateMachine {
    case_id: String,
    current_state: CaseState,
    created_at: DateTime<Utc>,
    state_entered_at: DateTime<Utc>,
    transitions: Vec<StateTransition>,
    handlers: Arc<HandlerTable>,
    metrics: MetricsCollector,
}

impl CaseStateMachine {
    /// Creates a machine in PENDING with no handlers.
    pub fn new(case_id: impl Into<String>) -> Self {
        Self::with_handlers(case_id, Arc::new(HandlerTable::new()))
    }

    pub fn with_handlers(case_id: impl Into<String>, handlers: Arc<HandlerTable>) -> Self {
        let now = Utc::now();
        Self {
            case_id: case_id.into(),
            current_state: CaseState::Pending,
            created_at: now,
            state_entered_at: now,
            transitions: Vec::new(),
            handlers,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    pub fn current_state(&self) -> CaseState {
        self.current_state
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    pub fn can_transition(&self, to: CaseState) -> bool {
        self.current_state.can_transition_to(to)
    }

    pub fn valid_transitions(&self) -> &'static [CaseState] {
        self.current_state.valid_transitions()
    }

    /// Moves the case to `new_state`.
    ///
    /// Returns false, leaving the machine untouched, when the move is not in
    /// the adjacency table. Handler failures are logged and do not affect the
    /// return value.
    pub async fn transition(
        &mut self,
        new_state: CaseState,
        reason: &str,
        metadata: Option<Payload>,
    ) -> bool {
        if !self.can_transition(new_state) {
            warn!(
                case_id = %self.case_id,
                from = %self.current_state,
                to = %new_state,
                reason = %reason,
                "Invalid case transition rejected"
            );
            return false;
        }

        let transition = StateTransition {
            from: self.current_state,
            to: new_state,
            timestamp: Utc::now(),
            reason: reason.to_string(),
            metadata: metadata.unwrap_or_default(),
        };
        self.current_state = new_state;
        self.state_entered_at = transition.timestamp;
        self.transitions.push(transition.clone());
        self.metrics.record_case_transition(new_state.as_str());

        debug!(
            case_id = %self.case_id,
            from = %transition.from,
            to = %new_state,
            "Case transitioned"
        );

        let ctx = TransitionContext {
            case_id: self.case_id.clone(),
            transition,
        };
        self.handlers.dispatch(&ctx).await;
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }

    /// Time spent in the current state.
    pub fn get_duration_in_state(&self) -> Duration {
        elapsed_since(self.state_entered_at)
    }

    /// Time since the machine was created.
    pub fn get_total_duration(&self) -> Duration {
        elapsed_since(self.created_at)
    }

    pub fn snapshot(&self) -> CaseSnapshot {
        CaseSnapshot {
            case_id: self.case_id.clone(),
            current_state: self.current_state,
            created_at: self.created_at,
            is_terminal: self.is_terminal(),
            duration_in_state_secs: self.get_duration_in_state().as_secs_f64(),
            total_duration_secs: self.get_total_duration().as_secs_f64(),
            transitions: self.transitions.clone(),
        }
    }
}

fn elapsed_since(at: DateTime<Utc>) -> Duration {
    (Utc::now() - at).to_std().unwrap_or_default()
}
