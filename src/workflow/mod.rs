//! Workflow execution.
//!
//! A workflow is a DAG of [`WorkflowStep`]s for one case. Steps run in
//! dependency order and each step's result is merged into the payload of its
//! dependents as `{step_id}_result`:
//!
//! ```text
//! classify ──▶ rerun_job ──▶ notify
//!     └──────────────────────▲
//! ```
//!
//! Workflows can run inline with [`WorkflowOrchestrator::execute_workflow`] or
//! step by step through the task queue with [`WorkflowStepHandler`]. Records
//! live in a [`WorkflowStore`]; pointing it at the queue's backend lets a
//! worker in another process pick up workflows created by the producer.

pub mod dag;
pub mod orchestrator;
pub mod step_handler;
pub mod store;
pub mod types;

pub use dag::execution_order;
pub use orchestrator::{StepRun, WorkflowOrchestrator};
pub use step_handler::{WorkflowStepHandler, WORKFLOW_STEP_TASK};
pub use store::{StepClaim, WorkflowStore};
pub use types::{
    StepStatus, WorkflowDefinition, WorkflowInstance, WorkflowStatus, WorkflowStep,
    DEFAULT_STEP_TIMEOUT_SECS,
};
