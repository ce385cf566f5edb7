use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::resilience::RetryPolicy;
use crate::scheduler::Payload;
use crate::state_machine::CaseState;

/// Default per-attempt timeout for a step, in seconds.
pub const DEFAULT_STEP_TIMEOUT_SECS: f64 = 30.0;

fn default_timeout_secs() -> f64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

/// One service call in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique within the workflow.
    pub id: String,
    /// Registered service name.
    pub service: String,
    pub action: String,
    /// Steps whose results this step needs, in merge order.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// Overrides the orchestrator's default policy.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, service: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            action: action.into(),
            depends_on: Vec::new(),
            payload: Payload::new(),
            timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            retry_policy: None,
        }
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Rejects a non-positive timeout and retry policies whose delays would
    /// shrink between attempts.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if !self.timeout_secs.is_finite() || self.timeout_secs <= 0.0 {
            return Err(WorkflowError::InvalidStep {
                step_id: self.id.clone(),
                message: format!("timeout_secs must be positive, got {}", self.timeout_secs),
            });
        }
        if let Some(policy) = &self.retry_policy {
            policy.validate().map_err(|message| WorkflowError::InvalidStep {
                step_id: self.id.clone(),
                message: format!("retry_policy: {message}"),
            })?;
        }
        Ok(())
    }

    /// Per-attempt timeout. Invalid values fall back to the default.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(DEFAULT_STEP_TIMEOUT_SECS))
    }
}

/// Execution status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    /// Not run because a dependency failed.
    Skipped,
}

impl StepStatus {
    /// Whether dependents can never run after this outcome.
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, StepStatus::Failed | StepStatus::Timeout | StepStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Timeout => "timeout",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of a DAG of steps for a case.
#[derive(Debug, Clone)]
pub struct WorkflowInstance {
    pub id: String,
    pub case_id: String,
    pub state: CaseState,
    /// Steps in declaration order.
    pub steps: Vec<WorkflowStep>,
    pub step_results: HashMap<String, Value>,
    pub step_status: HashMap<String, StepStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn new(case_id: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        let now = Utc::now();
        let step_status = steps
            .iter()
            .map(|step| (step.id.clone(), StepStatus::Pending))
            .collect();
        Self {
            id: Uuid::new_v4().to_string(),
            case_id: case_id.into(),
            state: CaseState::Pending,
            steps,
            step_results: HashMap::new(),
            step_status,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    pub fn status_of(&self, step_id: &str) -> StepStatus {
        self.step_status
            .get(step_id)
            .copied()
            .unwrap_or(StepStatus::Pending)
    }

    pub fn set_step_status(&mut self, step_id: &str, status: StepStatus) {
        self.step_status.insert(step_id.to_string(), status);
        self.touch();
    }

    pub fn set_state(&mut self, state: CaseState) {
        self.state = state;
        self.touch();
    }

    /// The step's own payload plus `{dep}_result` for every completed
    /// dependency.
    pub fn payload_for(&self, step: &WorkflowStep) -> Payload {
        let mut payload = step.payload.clone();
        for dep in &step.depends_on {
            if let Some(result) = self.step_results.get(dep) {
                payload.insert(format!("{dep}_result"), result.clone());
            }
        }
        payload
    }

    pub fn all_completed(&self) -> bool {
        self.steps
            .iter()
            .all(|step| self.status_of(&step.id) == StepStatus::Completed)
    }

    pub fn status(&self) -> WorkflowStatus {
        WorkflowStatus {
            workflow_id: self.id.clone(),
            case_id: self.case_id.clone(),
            state: self.state,
            step_status: self
                .step_status
                .iter()
                .map(|(id, status)| (id.clone(), *status))
                .collect(),
            step_results: self
                .step_results
                .iter()
                .map(|(id, result)| (id.clone(), result.clone()))
                .collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Read-only view of a workflow for dashboards and callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowStatus {
    pub workflow_id: String,
    pub case_id: String,
    pub state: CaseState,
    pub step_status: BTreeMap<String, StepStatus>,
    pub step_results: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Workflow file format accepted by the CLI.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub case_id: Option<String>,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    /// Checks step ids and every step's settings. The dependency graph is
    /// checked when the workflow runs.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        super::dag::check_unique_ids(&self.steps)?;
        self.steps.iter().try_for_each(WorkflowStep::validate)
    }
}
