//! Entry handlers run when a case enters a state.
//!
//! Handlers live in a [`HandlerTable`]: for each state, an ordered list of
//! handlers fixed before any machine is created. Dispatch is isolated, so a
//! failing or panicking handler is logged and the remaining handlers still
//! run. The transition itself has already been recorded by then.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::{error, info};

use super::states::{CaseState, StateTransition};
use crate::scheduler::{Payload, TaskPriority, TaskQueue};

/// Upper bound on handlers registered for one state.
pub const MAX_HANDLERS_PER_STATE: usize = 16;

/// What a handler sees about the transition that triggered it.
#[derive(Debug, Clone)]
pub struct TransitionContext {
    pub case_id: String,
    pub transition: StateTransition,
}

/// Side effect attached to entering a state.
#[async_trait]
pub trait StateHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn on_enter(&self, ctx: &TransitionContext) -> anyhow::Result<()>;
}

/// Ordered handlers per state.
#[derive(Default, Clone)]
pub struct HandlerTable {
    entries: HashMap<CaseState, Vec<Arc<dyn StateHandler>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler for `state`. Returns false when the state already
    /// holds [`MAX_HANDLERS_PER_STATE`] handlers.
    pub fn register(&mut self, state: CaseState, handler: Arc<dyn StateHandler>) -> bool {
        let handlers = self.entries.entry(state).or_default();
        if handlers.len() >= MAX_HANDLERS_PER_STATE {
            error!(
                state = %state,
                handler = handler.name(),
                "Handler limit reached, registration ignored"
            );
            return false;
        }
        handlers.push(handler);
        true
    }

    pub fn handlers_for(&self, state: CaseState) -> &[Arc<dyn StateHandler>] {
        self.entries.get(&state).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Runs every handler for the entered state in registration order.
    ///
    /// Returns the number of handlers that failed.
    pub async fn dispatch(&self, ctx: &TransitionContext) -> usize {
        let mut failures = 0;
        for handler in self.handlers_for(ctx.transition.to) {
            let outcome = AssertUnwindSafe(handler.on_enter(ctx)).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    error!(
                        case_id = %ctx.case_id,
                        state = %ctx.transition.to,
                        handler = handler.name(),
                        error = %format!("{e:#}"),
                        "State handler failed"
                    );
                }
                Err(_) => {
                    failures += 1;
                    error!(
                        case_id = %ctx.case_id,
                        state = %ctx.transition.to,
                        handler = handler.name(),
                        "State handler panicked"
                    );
                }
            }
        }
        failures
    }
}

/// Writes one structured log line per entered state.
#[derive(Debug, Default)]
pub struct AuditTrailHandler;

#[async_trait]
impl StateHandler for AuditTrailHandler {
    fn name(&self) -> &str {
        "audit_trail"
    }

    async fn on_enter(&self, ctx: &TransitionContext) -> anyhow::Result<()> {
        info!(
            case_id = %ctx.case_id,
            from = %ctx.transition.from,
            to = %ctx.transition.to,
            reason = %ctx.transition.reason,
            at = %ctx.transition.timestamp,
            "Case transition"
        );
        Ok(())
    }
}

/// Enqueues a task whenever a case enters the state it is registered for.
///
/// The task payload carries the case id, both states, the reason and the
/// transition metadata.
pub struct EnqueueTaskHandler {
    queue: Arc<TaskQueue>,
    task_type: String,
    priority: TaskPriority,
    max_retries: u32,
}

impl EnqueueTaskHandler {
    pub fn new(queue: Arc<TaskQueue>, task_type: impl Into<String>, priority: TaskPriority) -> Self {
        Self {
            queue,
            task_type: task_type.into(),
            priority,
            max_retries: crate::scheduler::DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[async_trait]
impl StateHandler for EnqueueTaskHandler {
    fn name(&self) -> &str {
        &self.task_type
    }

    async fn on_enter(&self, ctx: &TransitionContext) -> anyhow::Result<()> {
        let mut payload = Payload::new();
        payload.insert("case_id".into(), json!(ctx.case_id));
        payload.insert("from_state".into(), json!(ctx.transition.from));
        payload.insert("to_state".into(), json!(ctx.transition.to));
        payload.insert("reason".into(), json!(ctx.transition.reason));
        payload.insert(
            "metadata".into(),
            Value::Object(ctx.transition.metadata.clone()),
        );

        self.queue
            .enqueue(&self.task_type, payload, self.priority, None, self.max_retries)
            .await?;
        Ok(())
    }
}
