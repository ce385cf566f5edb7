use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::WorkflowError;
use crate::scheduler::{PermanentFailure, Task, TaskHandler};
use crate::state_machine::{CaseState, StateMachineManager};

use super::orchestrator::{StepRun, WorkflowOrchestrator};

/// Task type used for queued workflow steps.
pub const WORKFLOW_STEP_TASK: &str = "workflow_step";

/// Runs one workflow step per queued task.
///
/// The task payload carries `workflow_id` and `step_id`. Errors that can clear
/// up on their own (dependencies outstanding, step held by another runner,
/// store unavailable) go back to the queue's backoff; anything else is
/// reported as a [`PermanentFailure`] so the task is dead-lettered at once.
///
/// With a case manager attached, the case behind the workflow is moved to
/// RESOLVED or FAILED when the workflow finishes.
pub struct WorkflowStepHandler {
    orchestrator: Arc<WorkflowOrchestrator>,
    cases: Option<Arc<StateMachineManager>>,
}

impl WorkflowStepHandler {
    pub fn new(orchestrator: Arc<WorkflowOrchestrator>) -> Self {
        Self {
            orchestrator,
            cases: None,
        }
    }

    pub fn with_case_manager(mut self, cases: Arc<StateMachineManager>) -> Self {
        self.cases = Some(cases);
        self
    }

    async fn sync_case(&self, workflow_id: &str) {
        let Some(cases) = &self.cases else {
            return;
        };
        let status = match self.orchestrator.get_workflow_status(workflow_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(workflow_id = %workflow_id, error = %e, "Cannot read workflow to update case");
                return;
            }
        };
        match status.state {
            CaseState::Resolved => {
                cases
                    .advance_to(&status.case_id, CaseState::Resolved, "workflow resolved")
                    .await
            }
            CaseState::Failed => {
                cases.fail_case(&status.case_id, "workflow failed").await;
            }
            _ => {}
        }
    }
}

#[async_trait]
impl TaskHandler for WorkflowStepHandler {
    async fn handle(&self, task: &Task) -> anyhow::Result<Option<Value>> {
        let (Some(workflow_id), Some(step_id)) =
            (task.payload_str("workflow_id"), task.payload_str("step_id"))
        else {
            return Err(anyhow::Error::new(PermanentFailure::new(
                "workflow_step task needs workflow_id and step_id",
            )));
        };

        let outcome = self.orchestrator.run_step(workflow_id, step_id).await;
        if !matches!(&outcome, Err(e) if e.is_retryable()) {
            self.sync_case(workflow_id).await;
        }

        match outcome {
            Ok(StepRun::Completed(result)) => Ok(Some(result)),
            Ok(StepRun::AlreadyCompleted | StepRun::Skipped) => Ok(None),
            Err(e) => Err(classify(e))
                .with_context(|| format!("workflow {workflow_id} step {step_id}")),
        }
    }
}

fn classify(err: WorkflowError) -> anyhow::Error {
    if err.is_retryable() {
        anyhow!(err)
    } else {
        anyhow::Error::new(PermanentFailure::new(err))
    }
}
