//! Error types for case orchestration.
//!
//! Defines error types for the major subsystems:
//! - Task queue storage and task lookup
//! - Calls to downstream services
//! - Workflow graph validation and execution
//! - The orchestration engine facade

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during task queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Task '{0}' not found in queue")]
    TaskNotFound(String),

    #[error("Task '{task_id}' is {status} and cannot be {operation}")]
    InvalidTaskState {
        task_id: String,
        status: String,
        operation: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::StorageUnavailable(err.to_string())
    }
}

/// Errors returned by the service call layer.
///
/// Transport failures are always mapped into one of these variants, so callers
/// never see raw HTTP client errors.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("Service '{0}' is not registered")]
    NotRegistered(String),

    #[error("Call to {service}/{action} timed out after {after:?}")]
    Timeout {
        service: String,
        action: String,
        after: Duration,
    },

    #[error("Connection to service '{service}' failed: {message}")]
    Connection { service: String, message: String },

    #[error("Service '{service}' returned HTTP {status}: {message}")]
    Application {
        service: String,
        status: u16,
        message: String,
    },

    #[error("Service '{service}' returned an invalid response: {message}")]
    InvalidResponse { service: String, message: String },

    #[error("Circuit breaker for '{0}' is open")]
    CircuitOpen(String),
}

impl ServiceError {
    /// Whether the failure may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Timeout { .. } | ServiceError::Connection { .. } => true,
            ServiceError::Application { status, .. } => *status == 429 || *status >= 500,
            ServiceError::NotRegistered(_)
            | ServiceError::InvalidResponse { .. }
            | ServiceError::CircuitOpen(_) => false,
        }
    }

    /// Whether the failure was a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ServiceError::Timeout { .. })
    }
}

/// Errors that can occur during workflow creation and execution.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("Step '{step_id}' not found in workflow '{workflow_id}'")]
    StepNotFound {
        workflow_id: String,
        step_id: String,
    },

    #[error("Duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("Dependency cycle detected at step '{0}'")]
    CycleDetected(String),

    #[error("Step '{step_id}' depends on unknown step '{dependency}'")]
    UnknownDependency { step_id: String, dependency: String },

    #[error("Workflow '{workflow_id}' is {state} and cannot be executed")]
    InvalidWorkflowState { workflow_id: String, state: String },

    #[error("Workflow '{0}' was cancelled")]
    Cancelled(String),

    #[error("Step '{0}' has dependencies that have not completed")]
    DependenciesPending(String),

    #[error("Step '{step_id}' of workflow '{workflow_id}' is already running")]
    StepInProgress {
        workflow_id: String,
        step_id: String,
    },

    #[error("Step '{step_id}' is invalid: {message}")]
    InvalidStep { step_id: String, message: String },

    #[error("Workflow storage error: {0}")]
    Storage(#[from] QueueError),

    #[error("Step '{step_id}' failed: {source}")]
    StepFailed {
        step_id: String,
        #[source]
        source: ServiceError,
    },
}

impl WorkflowError {
    /// Whether delivering the same step again later may succeed.
    ///
    /// Everything else is final for the step: the workflow is missing, its
    /// graph is broken, or the step already ran and failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::DependenciesPending(_)
                | WorkflowError::StepInProgress { .. }
                | WorkflowError::Storage(_)
        )
    }
}

/// Errors surfaced by the orchestration engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Alert '{0}' not found")]
    AlertNotFound(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}
