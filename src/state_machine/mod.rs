//! Case lifecycle state machines.
//!
//! Every case moves through a fixed adjacency table:
//!
//! ```text
//! PENDING ──► INVESTIGATING ──► VALIDATING ──► REMEDIATING ──► RESOLVED
//!    │              │                │               │
//!    │              └───────┬────────┴───────────────┴──► FAILED
//!    └──────────────────────┴─────────────────────────► CANCELLED
//! ```
//!
//! RESOLVED, FAILED and CANCELLED are terminal. Rejected transitions return
//! `false` and are logged; they never raise.

pub mod handlers;
pub mod machine;
pub mod manager;
pub mod states;

pub use handlers::{
    AuditTrailHandler, EnqueueTaskHandler, HandlerTable, StateHandler, TransitionContext,
    MAX_HANDLERS_PER_STATE,
};
pub use machine::{CaseSnapshot, CaseStateMachine};
pub use manager::{SharedMachine, StateMachineManager};
pub use states::{CaseState, StateTransition};
