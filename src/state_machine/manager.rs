use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use super::handlers::{HandlerTable, StateHandler};
use super::machine::{CaseSnapshot, CaseStateMachine};
use super::states::CaseState;
use crate::scheduler::Payload;

/// Shared handle to one case machine.
pub type SharedMachine = Arc<Mutex<CaseStateMachine>>;

/// Owns one [`CaseStateMachine`] per case id.
///
/// Handlers are registered on the manager before it is shared and are
/// handed to every machine it creates. Handlers run while the case's machine
/// is locked, so they must not transition the same case.
#[derive(Default)]
pub struct StateMachineManager {
    machines: RwLock<HashMap<String, SharedMachine>>,
    handlers: Arc<HandlerTable>,
}

impl StateMachineManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handlers(handlers: HandlerTable) -> Self {
        Self {
            machines: RwLock::new(HashMap::new()),
            handlers: Arc::new(handlers),
        }
    }

    /// Adds a handler for machines created after this call.
    pub fn register_handler(&mut self, state: CaseState, handler: Arc<dyn StateHandler>) -> bool {
        Arc::make_mut(&mut self.handlers).register(state, handler)
    }

    /// Creates the machine for `case_id`, or returns the existing one.
    pub async fn create_machine(&self, case_id: &str) -> SharedMachine {
        let mut machines = self.machines.write().await;
        if let Some(existing) = machines.get(case_id) {
            warn!(case_id = %case_id, "State machine already exists for case");
            return Arc::clone(existing);
        }

        let machine = Arc::new(Mutex::new(CaseStateMachine::with_handlers(
            case_id,
            Arc::clone(&self.handlers),
        )));
        machines.insert(case_id.to_string(), Arc::clone(&machine));
        info!(case_id = %case_id, "Created case state machine");
        machine
    }

    pub async fn get_machine(&self, case_id: &str) -> Option<SharedMachine> {
        self.machines.read().await.get(case_id).cloned()
    }

    /// Transitions a case. Returns false for unknown cases and rejected moves.
    pub async fn transition(
        &self,
        case_id: &str,
        new_state: CaseState,
        reason: &str,
        metadata: Option<Payload>,
    ) -> bool {
        let Some(machine) = self.get_machine(case_id).await else {
            error!(case_id = %case_id, to = %new_state, "No state machine for case");
            return false;
        };
        let mut machine = machine.lock().await;
        machine.transition(new_state, reason, metadata).await
    }

    /// Move a case forward along PENDING → INVESTIGATING → VALIDATING →
    /// REMEDIATING → RESOLVED until it reaches `target`, creating its machine
    /// if needed. Cases already at or past `target`, or in a terminal state,
    /// are left alone.
    pub async fn advance_to(&self, case_id: &str, target: CaseState, reason: &str) {
        let machine = self.machine_for(case_id).await;
        let mut machine = machine.lock().await;

        while machine.current_state() < target {
            let next = match machine.current_state() {
                CaseState::Pending => CaseState::Investigating,
                CaseState::Investigating => CaseState::Validating,
                CaseState::Validating => CaseState::Remediating,
                CaseState::Remediating => CaseState::Resolved,
                _ => break,
            };
            if !machine.transition(next, reason, None).await {
                break;
            }
        }
    }

    /// Mark a case FAILED, creating its machine if needed. A PENDING case is
    /// opened first since it cannot fail directly. Returns false when the case
    /// had already finished.
    pub async fn fail_case(&self, case_id: &str, reason: &str) -> bool {
        let machine = self.machine_for(case_id).await;
        let mut machine = machine.lock().await;

        if machine.is_terminal() {
            return false;
        }
        if machine.current_state() == CaseState::Pending
            && !machine.transition(CaseState::Investigating, reason, None).await
        {
            return false;
        }
        machine.transition(CaseState::Failed, reason, None).await
    }

    async fn machine_for(&self, case_id: &str) -> SharedMachine {
        match self.get_machine(case_id).await {
            Some(machine) => machine,
            None => self.create_machine(case_id).await,
        }
    }

    pub async fn get_case_state(&self, case_id: &str) -> Option<CaseSnapshot> {
        let machine = self.get_machine(case_id).await?;
        let machine = machine.lock().await;
        Some(machine.snapshot())
    }

    /// Snapshots of every case, keyed by case id.
    pub async fn get_all_states(&self) -> BTreeMap<String, CaseSnapshot> {
        let machines: Vec<(String, SharedMachine)> = self
            .machines
            .read()
            .await
            .iter()
            .map(|(id, machine)| (id.clone(), Arc::clone(machine)))
            .collect();

        let mut states = BTreeMap::new();
        for (id, machine) in machines {
            states.insert(id, machine.lock().await.snapshot());
        }
        states
    }

    pub async fn remove_machine(&self, case_id: &str) -> bool {
        self.machines.write().await.remove(case_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.machines.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.machines.read().await.is_empty()
    }
}
