//! Alert intake and proposition handling.
//!
//! [`OrchestrationEngine`] registers alerts, asks a [`Recommender`] for
//! candidate remediations, logs every operator decision and turns accepted
//! propositions into queued tasks.

pub mod alert;
pub mod engine;
pub mod proposition;
pub mod recommender;

pub use alert::{Alert, AlertType};
pub use engine::{
    AlertResponse, AlertSummary, ApplyResult, ApplyStatus, Execution, OrchestrationEngine,
    QueuedWorkflow, DEFAULT_STEP_TASK_RETRIES,
};
pub use proposition::{ActionKind, Proposition, PropositionLog, UserDecision};
pub use recommender::{HttpRecommender, PropositionRequest, Recommender, StaticRecommender};
