//! The orchestration facade: alerts in, queued work and tracked decisions out.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use super::alert::{Alert, AlertType};
use super::proposition::{ActionKind, Proposition, PropositionLog, UserDecision};
use super::recommender::{PropositionRequest, Recommender};
use crate::error::{EngineError, ServiceError};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
use crate::scheduler::{Payload, Task, TaskPriority, TaskQueue, DEFAULT_MAX_RETRIES};
use crate::state_machine::{CaseState, StateMachineManager};
use crate::workflow::{WorkflowOrchestrator, WorkflowStatus, WorkflowStep, WORKFLOW_STEP_TASK};

/// Retry budget for queued workflow steps. Covers waiting on dependencies
/// under the queue's exponential backoff.
pub const DEFAULT_STEP_TASK_RETRIES: u32 = 8;

/// Response to [`OrchestrationEngine::process_alert`].
#[derive(Debug, Clone, Serialize)]
pub struct AlertResponse {
    pub request_id: String,
    pub alert_id: String,
    pub alert_type: AlertType,
    pub status: String,
    pub propositions: Vec<Proposition>,
    /// True when the recommender could not be reached and the list is empty
    /// for that reason.
    pub degraded: bool,
}

/// Overall result of applying a proposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyStatus {
    Executed,
    Rejected,
    Ignored,
    Pending,
}

/// What an executor did with an accepted proposition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Execution {
    Enqueued {
        action_type: String,
        task_id: String,
        priority: TaskPriority,
    },
    /// The `ignore` executor; nothing was queued.
    NoAction { action_type: String },
    UnknownActionType { action_type: String },
}

/// Response to [`OrchestrationEngine::apply_proposition`].
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    pub request_id: String,
    pub alert_id: String,
    pub proposition_id: String,
    pub user_decision: UserDecision,
    pub status: ApplyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<Execution>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertSummary {
    pub total_active: usize,
    pub alert_types: BTreeMap<String, usize>,
    pub total_propositions_tracked: usize,
    pub total_actions_executed: u64,
}

/// A workflow whose steps were pushed onto the task queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedWorkflow {
    pub workflow_id: String,
    pub case_id: String,
    /// One task per step, in execution order.
    pub task_ids: Vec<String>,
}

/// Turns alerts into queued work and tracks operator decisions.
///
/// Recommender calls go through a circuit breaker and a jittered retry
/// policy. When either gives up the alert is still processed, with an empty
/// proposition list.
pub struct OrchestrationEngine {
    queue: Arc<TaskQueue>,
    recommender: Arc<dyn Recommender>,
    orchestrator: Arc<WorkflowOrchestrator>,
    cases: Arc<StateMachineManager>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    task_max_retries: u32,
    step_max_retries: u32,
    active_alerts: RwLock<HashMap<String, Alert>>,
    proposition_logs: RwLock<Vec<PropositionLog>>,
    actions_executed: AtomicU64,
}

impl OrchestrationEngine {
    pub fn new(
        queue: Arc<TaskQueue>,
        recommender: Arc<dyn Recommender>,
        orchestrator: Arc<WorkflowOrchestrator>,
    ) -> Self {
        Self {
            queue,
            recommender,
            orchestrator,
            cases: Arc::new(StateMachineManager::new()),
            breaker: CircuitBreaker::new("recommender", CircuitBreakerConfig::default()),
            retry: RetryPolicy::new(3).with_jitter(true),
            task_max_retries: DEFAULT_MAX_RETRIES,
            step_max_retries: DEFAULT_STEP_TASK_RETRIES,
            active_alerts: RwLock::new(HashMap::new()),
            proposition_logs: RwLock::new(Vec::new()),
            actions_executed: AtomicU64::new(0),
        }
    }

    /// Use a manager with pre-registered state handlers.
    pub fn with_case_manager(mut self, cases: Arc<StateMachineManager>) -> Self {
        self.cases = cases;
        self
    }

    pub fn with_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = CircuitBreaker::new("recommender", config);
        self
    }

    pub fn with_recommender_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Retry budget for tasks created by executors.
    pub fn with_task_max_retries(mut self, max_retries: u32) -> Self {
        self.task_max_retries = max_retries;
        self
    }

    pub fn with_step_max_retries(mut self, max_retries: u32) -> Self {
        self.step_max_retries = max_retries;
        self
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn orchestrator(&self) -> &Arc<WorkflowOrchestrator> {
        &self.orchestrator
    }

    pub fn cases(&self) -> &Arc<StateMachineManager> {
        &self.cases
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Register an alert, open its case and fetch propositions for it.
    ///
    /// Never fails: recommender problems yield an empty, `degraded` list.
    pub async fn process_alert(&self, alert: Alert) -> AlertResponse {
        let request_id = Uuid::new_v4().to_string();
        info!(
            alert_id = %alert.id,
            alert_type = %alert.alert_type,
            severity = %alert.severity,
            request_id = %request_id,
            "Processing alert"
        );

        self.active_alerts
            .write()
            .await
            .insert(alert.id.clone(), alert.clone());
        self.cases.advance_to(&alert.id, CaseState::Investigating, "alert received")
            .await;

        let (propositions, degraded) = self.fetch_propositions(&alert).await;
        info!(
            alert_id = %alert.id,
            propositions = propositions.len(),
            degraded,
            "Alert processed"
        );

        AlertResponse {
            request_id,
            alert_id: alert.id,
            alert_type: alert.alert_type,
            status: "processed".to_string(),
            propositions,
            degraded,
        }
    }

    async fn fetch_propositions(&self, alert: &Alert) -> (Vec<Proposition>, bool) {
        if !self.breaker.can_attempt() {
            warn!(alert_id = %alert.id, "Recommender circuit open, skipping propositions");
            return (Vec::new(), true);
        }

        let request = PropositionRequest::from(alert);
        let recommender = self.recommender.as_ref();
        let request_ref = &request;
        let result = self
            .retry
            .execute(
                move |_attempt| async move { recommender.propositions(request_ref).await },
                ServiceError::is_transient,
            )
            .await;

        match result {
            Ok(mut propositions) => {
                self.breaker.record_success();
                propositions.sort_by(|a, b| {
                    a.priority.cmp(&b.priority).then(
                        b.confidence_score
                            .partial_cmp(&a.confidence_score)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                });
                (propositions, false)
            }
            Err(e) => {
                self.breaker.record_failure();
                warn!(alert_id = %alert.id, error = %e, "Recommender unavailable, continuing without propositions");
                (Vec::new(), true)
            }
        }
    }

    /// Log the operator's decision on a proposition and, when accepted,
    /// dispatch it to its executor.
    pub async fn apply_proposition(
        &self,
        alert_id: &str,
        proposition: &Proposition,
        request_id: &str,
        decision: UserDecision,
    ) -> Result<ApplyResult, EngineError> {
        let alert = self
            .active_alerts
            .read()
            .await
            .get(alert_id)
            .cloned()
            .ok_or_else(|| EngineError::AlertNotFound(alert_id.to_string()))?;

        let now = Utc::now();
        self.proposition_logs.write().await.push(PropositionLog {
            request_id: request_id.to_string(),
            alert_id: alert_id.to_string(),
            proposition_id: proposition.id.clone(),
            action_type: proposition.action_type.clone(),
            presented_at: now,
            user_decision: decision,
            decision_timestamp: (decision != UserDecision::Pending).then_some(now),
            feedback: None,
            outcome: None,
        });
        info!(
            alert_id = %alert_id,
            proposition_id = %proposition.id,
            decision = %decision,
            "Recorded proposition decision"
        );

        let (status, execution) = match decision {
            UserDecision::Accepted => {
                let execution = self.execute(&alert, proposition, request_id).await?;
                (ApplyStatus::Executed, Some(execution))
            }
            UserDecision::Rejected => (ApplyStatus::Rejected, None),
            UserDecision::Ignored => (ApplyStatus::Ignored, None),
            UserDecision::Pending => (ApplyStatus::Pending, None),
        };

        Ok(ApplyResult {
            request_id: request_id.to_string(),
            alert_id: alert_id.to_string(),
            proposition_id: proposition.id.clone(),
            user_decision: decision,
            status,
            execution,
        })
    }

    async fn execute(
        &self,
        alert: &Alert,
        proposition: &Proposition,
        request_id: &str,
    ) -> Result<Execution, EngineError> {
        let Some(kind) = proposition.action_kind() else {
            warn!(
                proposition_id = %proposition.id,
                action_type = %proposition.action_type,
                "Unknown action type"
            );
            return Ok(Execution::UnknownActionType {
                action_type: proposition.action_type.clone(),
            });
        };

        let (priority, case_target) = match kind {
            ActionKind::AutoFix => (proposition.task_priority(), Some(CaseState::Remediating)),
            ActionKind::ManualReview => (TaskPriority::Normal, Some(CaseState::Validating)),
            ActionKind::Escalate => (TaskPriority::Critical, None),
            ActionKind::Ignore => {
                self.actions_executed.fetch_add(1, Ordering::Relaxed);
                return Ok(Execution::NoAction {
                    action_type: kind.to_string(),
                });
            }
        };

        let mut payload = Payload::new();
        payload.insert("alert_id".into(), json!(alert.id));
        payload.insert("alert_type".into(), json!(alert.alert_type));
        payload.insert("request_id".into(), json!(request_id));
        payload.insert("proposition_id".into(), json!(proposition.id));
        payload.insert("title".into(), json!(proposition.title));
        payload.insert("parameters".into(), json!(proposition.parameters));

        let task = self
            .queue
            .enqueue(kind.as_str(), payload, priority, None, self.task_max_retries)
            .await?;
        self.actions_executed.fetch_add(1, Ordering::Relaxed);

        if let Some(target) = case_target {
            self.cases.advance_to(&alert.id, target, &format!("{kind} accepted"))
                .await;
        }

        info!(
            alert_id = %alert.id,
            task_id = %task.task_id,
            action_type = %kind,
            priority = %priority,
            "Proposition executed"
        );
        Ok(Execution::Enqueued {
            action_type: kind.to_string(),
            task_id: task.task_id,
            priority,
        })
    }

    /// Annotate the latest log entry for `proposition_id`. Returns false if
    /// the proposition was never logged.
    pub async fn record_outcome(
        &self,
        proposition_id: &str,
        outcome: &str,
        feedback: Option<String>,
    ) -> bool {
        let mut logs = self.proposition_logs.write().await;
        match logs
            .iter_mut()
            .rev()
            .find(|log| log.proposition_id == proposition_id)
        {
            Some(log) => {
                log.outcome = Some(outcome.to_string());
                if feedback.is_some() {
                    log.feedback = feedback;
                }
                true
            }
            None => false,
        }
    }

    /// Remove an alert from the active set.
    pub async fn close_alert(&self, alert_id: &str) -> Result<Alert, EngineError> {
        let alert = self
            .active_alerts
            .write()
            .await
            .remove(alert_id)
            .ok_or_else(|| EngineError::AlertNotFound(alert_id.to_string()))?;
        info!(alert_id = %alert_id, "Alert closed");
        Ok(alert)
    }

    pub async fn get_alert(&self, alert_id: &str) -> Option<Alert> {
        self.active_alerts.read().await.get(alert_id).cloned()
    }

    pub async fn get_alert_summary(&self) -> AlertSummary {
        let alerts = self.active_alerts.read().await;
        let mut alert_types = BTreeMap::new();
        for alert in alerts.values() {
            *alert_types
                .entry(alert.alert_type.as_str().to_string())
                .or_insert(0) += 1;
        }
        AlertSummary {
            total_active: alerts.len(),
            alert_types,
            total_propositions_tracked: self.proposition_logs.read().await.len(),
            total_actions_executed: self.actions_executed.load(Ordering::Relaxed),
        }
    }

    /// The most recent `limit` log entries, optionally for one alert, oldest
    /// first.
    pub async fn get_proposition_logs(&self, alert_id: Option<&str>, limit: usize) -> Vec<PropositionLog> {
        let logs = self.proposition_logs.read().await;
        let mut recent: Vec<PropositionLog> = logs
            .iter()
            .rev()
            .filter(|log| alert_id.map_or(true, |id| log.alert_id == id))
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    /// Run a workflow inline and drive the case to RESOLVED or FAILED.
    pub async fn run_workflow(
        &self,
        case_id: &str,
        steps: Vec<WorkflowStep>,
    ) -> Result<WorkflowStatus, EngineError> {
        self.cases.advance_to(case_id, CaseState::Investigating, "workflow started")
            .await;
        let workflow = match self.orchestrator.create_workflow(case_id, steps).await {
            Ok(workflow) => workflow,
            Err(e) => {
                self.cases.fail_case(case_id, &e.to_string()).await;
                return Err(e.into());
            }
        };

        match self.orchestrator.execute_workflow(&workflow.id).await {
            Ok(status) => {
                self.cases.advance_to(case_id, CaseState::Resolved, "workflow resolved")
                    .await;
                Ok(status)
            }
            Err(e) => {
                self.cases.fail_case(case_id, &e.to_string()).await;
                Err(e.into())
            }
        }
    }

    /// Push each step of a new workflow onto the queue as a
    /// `workflow_step` task, in execution order.
    pub async fn enqueue_workflow(
        &self,
        case_id: &str,
        steps: Vec<WorkflowStep>,
        priority: TaskPriority,
    ) -> Result<QueuedWorkflow, EngineError> {
        let workflow = self.orchestrator.create_workflow(case_id, steps).await?;
        let order = match self.orchestrator.execution_order(&workflow.id).await {
            Ok(order) => order,
            Err(e) => {
                if let Err(cancel_err) = self.orchestrator.cancel_workflow(&workflow.id).await {
                    warn!(workflow_id = %workflow.id, error = %cancel_err, "Failed to cancel workflow");
                }
                return Err(e.into());
            }
        };
        self.cases.advance_to(case_id, CaseState::Investigating, "workflow queued")
            .await;

        let mut task_ids = Vec::with_capacity(order.len());
        for step_id in order {
            let mut payload = Payload::new();
            payload.insert("workflow_id".into(), json!(workflow.id));
            payload.insert("step_id".into(), json!(step_id));
            payload.insert("case_id".into(), json!(case_id));
            let task: Task = self
                .queue
                .enqueue(WORKFLOW_STEP_TASK, payload, priority, None, self.step_max_retries)
                .await?;
            task_ids.push(task.task_id);
        }

        info!(
            workflow_id = %workflow.id,
            case_id = %case_id,
            steps = task_ids.len(),
            "Workflow queued"
        );
        Ok(QueuedWorkflow {
            workflow_id: workflow.id,
            case_id: case_id.to_string(),
            task_ids,
        })
    }
}
