//! case_orchestrator: remediation case orchestration.
//!
//! This library turns incident alerts into prioritised, retried work:
//! a Redis-backed priority task queue with dead-lettering, DAG workflows
//! over downstream services, a per-case lifecycle state machine and
//! circuit-breaker protected service calls.

// Core modules
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod resilience;
pub mod scheduler;
pub mod services;
pub mod state_machine;
pub mod workflow;

// Re-export commonly used types
pub use config::{ConfigError, OrchestratorConfig};
pub use engine::{Alert, AlertType, OrchestrationEngine, Proposition, UserDecision};
pub use error::{EngineError, QueueError, ServiceError, WorkflowError};
pub use scheduler::{Task, TaskPriority, TaskQueue, TaskStatus, WorkerPool};
pub use state_machine::{CaseState, StateMachineManager};
pub use workflow::{WorkflowOrchestrator, WorkflowStep};
