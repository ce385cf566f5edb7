//! Workflow records kept in the queue's store.
//!
//! A workflow is split across three hashes so that workers in different
//! processes can update different steps without overwriting each other:
//!
//! - `{ns}:workflows`: workflow id → header (case, steps, state, timestamps)
//! - `{ns}:workflow_steps`: `{workflow_id}:{step_id}` → status and result
//! - `{ns}:workflow_claims`: `{workflow_id}:{step_id}` → the runner that
//!   claimed the step, written with HSETNX

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{StepStatus, WorkflowInstance, WorkflowStep};
use crate::error::QueueError;
use crate::scheduler::{MemoryBackend, QueueBackend};
use crate::state_machine::CaseState;

#[derive(Debug, Serialize, Deserialize)]
struct WorkflowHeader {
    id: String,
    case_id: String,
    state: CaseState,
    steps: Vec<WorkflowStep>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StepRecord {
    status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    updated_at: DateTime<Utc>,
}

/// Who is running a step, as recorded by [`WorkflowStore::claim_step`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepClaim {
    pub owner: String,
    pub claimed_at: DateTime<Utc>,
}

/// Persists [`WorkflowInstance`]s through a [`QueueBackend`].
#[derive(Clone)]
pub struct WorkflowStore {
    backend: Arc<dyn QueueBackend>,
    workflows_key: String,
    steps_key: String,
    claims_key: String,
}

impl WorkflowStore {
    /// Store records under `namespace`, normally the queue name.
    pub fn new(backend: Arc<dyn QueueBackend>, namespace: &str) -> Self {
        Self {
            backend,
            workflows_key: format!("{namespace}:workflows"),
            steps_key: format!("{namespace}:workflow_steps"),
            claims_key: format!("{namespace}:workflow_claims"),
        }
    }

    /// A store private to this process.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), "local")
    }

    /// Write a whole workflow: header and every step record.
    pub async fn insert(&self, workflow: &WorkflowInstance) -> Result<(), QueueError> {
        for step in &workflow.steps {
            self.save_step(
                &workflow.id,
                &step.id,
                workflow.status_of(&step.id),
                workflow.step_results.get(&step.id),
            )
            .await?;
        }
        self.save_header(workflow).await
    }

    pub async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowInstance>, QueueError> {
        let Some(raw) = self.backend.hget(&self.workflows_key, workflow_id).await? else {
            return Ok(None);
        };
        let header: WorkflowHeader = serde_json::from_str(&raw)?;

        let mut step_status = HashMap::with_capacity(header.steps.len());
        let mut step_results = HashMap::new();
        for step in &header.steps {
            let field = step_field(workflow_id, &step.id);
            let record = match self.backend.hget(&self.steps_key, &field).await? {
                Some(raw) => serde_json::from_str::<StepRecord>(&raw)?,
                None => continue,
            };
            step_status.insert(step.id.clone(), record.status);
            if let Some(result) = record.result {
                step_results.insert(step.id.clone(), result);
            }
        }

        Ok(Some(WorkflowInstance {
            id: header.id,
            case_id: header.case_id,
            state: header.state,
            steps: header.steps,
            step_results,
            step_status,
            created_at: header.created_at,
            updated_at: header.updated_at,
        }))
    }

    /// Write the workflow-level fields. Step records are left alone.
    pub async fn save_header(&self, workflow: &WorkflowInstance) -> Result<(), QueueError> {
        let header = WorkflowHeader {
            id: workflow.id.clone(),
            case_id: workflow.case_id.clone(),
            state: workflow.state,
            steps: workflow.steps.clone(),
            created_at: workflow.created_at,
            updated_at: workflow.updated_at,
        };
        let raw = serde_json::to_string(&header)?;
        self.backend.hset(&self.workflows_key, &workflow.id, raw).await
    }

    pub async fn save_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        status: StepStatus,
        result: Option<&Value>,
    ) -> Result<(), QueueError> {
        let record = StepRecord {
            status,
            result: result.cloned(),
            updated_at: Utc::now(),
        };
        let raw = serde_json::to_string(&record)?;
        self.backend
            .hset(&self.steps_key, &step_field(workflow_id, step_id), raw)
            .await
    }

    /// Atomically claim a step for `owner`. Only the first caller for a given
    /// step gets `true`; a claim is never released.
    pub async fn claim_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        owner: &str,
    ) -> Result<bool, QueueError> {
        let claim = StepClaim {
            owner: owner.to_string(),
            claimed_at: Utc::now(),
        };
        let raw = serde_json::to_string(&claim)?;
        self.backend
            .hset_nx(&self.claims_key, &step_field(workflow_id, step_id), raw)
            .await
    }

    pub async fn step_claim(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<Option<StepClaim>, QueueError> {
        match self
            .backend
            .hget(&self.claims_key, &step_field(workflow_id, step_id))
            .await?
        {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

fn step_field(workflow_id: &str, step_id: &str) -> String {
    format!("{workflow_id}:{step_id}")
}
