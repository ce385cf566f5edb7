//! DAG workflow execution against registered services.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ServiceError, WorkflowError};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
use crate::scheduler::Payload;
use crate::services::{ServiceClient, ServiceTarget};
use crate::state_machine::CaseState;

use super::dag;
use super::store::WorkflowStore;
use super::types::{StepStatus, WorkflowInstance, WorkflowStatus, WorkflowStep};

/// Workflow states from which a workflow can still fail or be cancelled.
const ACTIVE_STATES: [CaseState; 2] = [CaseState::Pending, CaseState::Investigating];

/// Outcome of [`WorkflowOrchestrator::run_step`].
#[derive(Debug, Clone, PartialEq)]
pub enum StepRun {
    /// The step ran and produced this result.
    Completed(Value),
    /// The step had already completed; nothing was called.
    AlreadyCompleted,
    /// The workflow is terminal or a dependency failed; the step will never run.
    Skipped,
}

struct RegisteredService {
    target: ServiceTarget,
    breaker: Arc<CircuitBreaker>,
}

/// Runs workflows step by step, threading results into dependents.
///
/// Workflow records live in a [`WorkflowStore`]. Orchestrators in different
/// processes sharing one store see the same workflows, and a step is claimed
/// atomically before its service is called, so it runs at most once.
/// Every registered service gets its own circuit breaker.
pub struct WorkflowOrchestrator {
    client: Arc<dyn ServiceClient>,
    services: RwLock<HashMap<String, RegisteredService>>,
    breaker_config: CircuitBreakerConfig,
    store: WorkflowStore,
    // Serializes workflow state read-modify-write within this process.
    state_lock: Mutex<()>,
    runner_id: String,
    default_retry: RetryPolicy,
}

impl WorkflowOrchestrator {
    /// Orchestrator with a private in-memory store.
    pub fn new(client: Arc<dyn ServiceClient>) -> Self {
        Self {
            client,
            services: RwLock::new(HashMap::new()),
            breaker_config: CircuitBreakerConfig::default(),
            store: WorkflowStore::in_memory(),
            state_lock: Mutex::new(()),
            runner_id: Uuid::new_v4().to_string(),
            default_retry: RetryPolicy::default(),
        }
    }

    /// Keep workflows in `store`, typically one shared with the task queue.
    pub fn with_store(mut self, store: WorkflowStore) -> Self {
        self.store = store;
        self
    }

    /// Breaker thresholds for services registered after this call.
    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Policy used by steps that do not carry their own.
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Identifies this orchestrator in step claims.
    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    pub async fn register_service(&self, name: impl Into<String>, endpoint: impl Into<String>) {
        let target = ServiceTarget::new(name, endpoint);
        info!(service = %target.name, endpoint = %target.endpoint, "Registered service");
        let breaker = Arc::new(CircuitBreaker::new(
            format!("service:{}", target.name),
            self.breaker_config.clone(),
        ));
        self.services
            .write()
            .await
            .insert(target.name.clone(), RegisteredService { target, breaker });
    }

    /// Registered service names, sorted.
    pub async fn registered_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// The breaker guarding calls to `service`.
    pub async fn service_breaker(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.services
            .read()
            .await
            .get(service)
            .map(|entry| Arc::clone(&entry.breaker))
    }

    /// Store a new PENDING workflow. Step ids must be unique and every step
    /// valid; the dependency graph is checked when the workflow runs.
    pub async fn create_workflow(
        &self,
        case_id: &str,
        steps: Vec<WorkflowStep>,
    ) -> Result<WorkflowInstance, WorkflowError> {
        dag::check_unique_ids(&steps)?;
        steps.iter().try_for_each(WorkflowStep::validate)?;
        let workflow = WorkflowInstance::new(case_id, steps);
        self.store.insert(&workflow).await?;
        info!(
            workflow_id = %workflow.id,
            case_id = %case_id,
            steps = workflow.steps.len(),
            "Created workflow"
        );
        Ok(workflow)
    }

    pub async fn get_workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatus, WorkflowError> {
        Ok(self.load(workflow_id).await?.status())
    }

    /// Step ids in the order `execute_workflow` would run them.
    pub async fn execution_order(&self, workflow_id: &str) -> Result<Vec<String>, WorkflowError> {
        let workflow = self.load(workflow_id).await?;
        let order = dag::execution_order(&workflow.steps)?;
        Ok(order
            .into_iter()
            .map(|i| workflow.steps[i].id.clone())
            .collect())
    }

    /// Run every step in dependency order.
    ///
    /// The first failing step stops the run and marks the workflow FAILED;
    /// results gathered so far stay visible through
    /// [`get_workflow_status`](Self::get_workflow_status).
    pub async fn execute_workflow(&self, workflow_id: &str) -> Result<WorkflowStatus, WorkflowError> {
        let workflow = self.load(workflow_id).await?;
        if workflow.state != CaseState::Pending {
            return Err(invalid_state(&workflow));
        }

        let order = match dag::execution_order(&workflow.steps) {
            Ok(order) => order,
            Err(e) => {
                error!(workflow_id = %workflow_id, error = %e, "Invalid workflow graph");
                self.move_state(workflow_id, &[CaseState::Pending], CaseState::Failed)
                    .await?;
                return Err(e);
            }
        };

        if !self
            .move_state(workflow_id, &[CaseState::Pending], CaseState::Investigating)
            .await?
        {
            return Err(invalid_state(&self.load(workflow_id).await?));
        }

        let ordered: Vec<WorkflowStep> = order
            .into_iter()
            .map(|i| workflow.steps[i].clone())
            .collect();
        info!(workflow_id = %workflow_id, steps = ordered.len(), "Executing workflow");

        for step in &ordered {
            let current = self.load(workflow_id).await?;
            if current.state != CaseState::Investigating {
                warn!(workflow_id = %workflow_id, step_id = %step.id, "Workflow cancelled before step");
                return Err(WorkflowError::Cancelled(workflow_id.to_string()));
            }
            let payload = self.begin_step(&current, step).await?;
            let outcome = self.run_with_retry(step, &payload).await;
            self.record_outcome(workflow_id, step, outcome).await?;
        }

        if !self
            .move_state(workflow_id, &[CaseState::Investigating], CaseState::Resolved)
            .await?
        {
            return Err(WorkflowError::Cancelled(workflow_id.to_string()));
        }
        info!(workflow_id = %workflow_id, case_id = %workflow.case_id, "Workflow resolved");
        self.get_workflow_status(workflow_id).await
    }

    /// Run a single step whose dependencies have completed.
    ///
    /// Used when steps are delivered through the task queue. Returns
    /// [`WorkflowError::DependenciesPending`] while dependencies are still
    /// outstanding and [`WorkflowError::StepInProgress`] when another runner
    /// holds the step, so the caller can retry later.
    pub async fn run_step(&self, workflow_id: &str, step_id: &str) -> Result<StepRun, WorkflowError> {
        let workflow = self.load(workflow_id).await?;
        let step = workflow
            .step(step_id)
            .cloned()
            .ok_or_else(|| WorkflowError::StepNotFound {
                workflow_id: workflow_id.to_string(),
                step_id: step_id.to_string(),
            })?;

        match workflow.status_of(step_id) {
            StepStatus::Completed => return Ok(StepRun::AlreadyCompleted),
            StepStatus::Skipped => return Ok(StepRun::Skipped),
            StepStatus::Running => {
                return Err(WorkflowError::StepInProgress {
                    workflow_id: workflow_id.to_string(),
                    step_id: step_id.to_string(),
                })
            }
            _ => {}
        }

        if workflow.state.is_terminal() {
            debug!(workflow_id = %workflow_id, step_id = %step_id, state = %workflow.state, "Skipping step of finished workflow");
            if workflow.status_of(step_id) == StepStatus::Pending {
                self.store
                    .save_step(workflow_id, step_id, StepStatus::Skipped, None)
                    .await?;
            }
            return Ok(StepRun::Skipped);
        }

        let mut pending = false;
        for dep in &step.depends_on {
            if workflow.step(dep).is_none() {
                return Err(WorkflowError::UnknownDependency {
                    step_id: step_id.to_string(),
                    dependency: dep.clone(),
                });
            }
            let status = workflow.status_of(dep);
            if status.blocks_dependents() {
                warn!(
                    workflow_id = %workflow_id,
                    step_id = %step_id,
                    dependency = %dep,
                    dependency_status = %status,
                    "Dependency failed, skipping step"
                );
                self.store
                    .save_step(workflow_id, step_id, StepStatus::Skipped, None)
                    .await?;
                self.move_state(workflow_id, &ACTIVE_STATES, CaseState::Failed)
                    .await?;
                return Ok(StepRun::Skipped);
            }
            if status != StepStatus::Completed {
                pending = true;
            }
        }
        if pending {
            return Err(WorkflowError::DependenciesPending(step_id.to_string()));
        }

        self.move_state(workflow_id, &[CaseState::Pending], CaseState::Investigating)
            .await?;
        let payload = self.begin_step(&workflow, &step).await?;
        let outcome = self.run_with_retry(&step, &payload).await;
        let result = self.record_outcome(workflow_id, &step, outcome).await?;

        let latest = self.load(workflow_id).await?;
        if latest.state == CaseState::Investigating
            && latest.all_completed()
            && self
                .move_state(workflow_id, &[CaseState::Investigating], CaseState::Resolved)
                .await?
        {
            info!(workflow_id = %workflow_id, case_id = %latest.case_id, "Workflow resolved");
        }
        Ok(StepRun::Completed(result))
    }

    /// Stop a workflow that has not finished. Steps already in flight are
    /// allowed to complete; no further steps start. Returns false for unknown
    /// or finished workflows.
    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<bool, WorkflowError> {
        match self
            .move_state(workflow_id, &ACTIVE_STATES, CaseState::Failed)
            .await
        {
            Ok(true) => {
                info!(workflow_id = %workflow_id, "Workflow cancelled");
                Ok(true)
            }
            Ok(false) => {
                warn!(workflow_id = %workflow_id, "Cannot cancel finished workflow");
                Ok(false)
            }
            Err(WorkflowError::WorkflowNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Call `action` on a registered service through its circuit breaker.
    pub async fn call_service(
        &self,
        service: &str,
        action: &str,
        payload: &Payload,
    ) -> Result<Value, ServiceError> {
        self.guarded_call(service, action, payload, None).await
    }

    async fn guarded_call(
        &self,
        service: &str,
        action: &str,
        payload: &Payload,
        timeout: Option<Duration>,
    ) -> Result<Value, ServiceError> {
        let (target, breaker) = {
            let services = self.services.read().await;
            let entry = services
                .get(service)
                .ok_or_else(|| ServiceError::NotRegistered(service.to_string()))?;
            (entry.target.clone(), Arc::clone(&entry.breaker))
        };

        if !breaker.can_attempt() {
            debug!(service = %service, action = %action, "Circuit open, failing fast");
            return Err(ServiceError::CircuitOpen(service.to_string()));
        }

        debug!(service = %service, action = %action, "Calling service");
        let call = self.client.call(&target, action, payload);
        let result = match timeout {
            Some(after) => tokio::time::timeout(after, call)
                .await
                .unwrap_or_else(|_| {
                    Err(ServiceError::Timeout {
                        service: service.to_string(),
                        action: action.to_string(),
                        after,
                    })
                }),
            None => call.await,
        };

        match &result {
            Err(e) if e.is_transient() => breaker.record_failure(),
            // The service answered, even if it rejected the request.
            _ => breaker.record_success(),
        }
        result
    }

    async fn run_with_retry(&self, step: &WorkflowStep, payload: &Payload) -> Result<Value, ServiceError> {
        let policy = step.retry_policy.as_ref().unwrap_or(&self.default_retry);
        let timeout = step.timeout();
        policy
            .execute(
                move |_attempt| async move {
                    self.guarded_call(&step.service, &step.action, payload, Some(timeout))
                        .await
                },
                ServiceError::is_transient,
            )
            .await
    }

    async fn load(&self, workflow_id: &str) -> Result<WorkflowInstance, WorkflowError> {
        self.store
            .load(workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Move the workflow to `to` if it is currently in one of `from`.
    async fn move_state(
        &self,
        workflow_id: &str,
        from: &[CaseState],
        to: CaseState,
    ) -> Result<bool, WorkflowError> {
        let _guard = self.state_lock.lock().await;
        let mut workflow = self.load(workflow_id).await?;
        if !from.contains(&workflow.state) {
            return Ok(false);
        }
        workflow.set_state(to);
        self.store.save_header(&workflow).await?;
        Ok(true)
    }

    /// Claim the step for this runner and mark it running. Returns the
    /// step's payload with dependency results merged in.
    async fn begin_step(
        &self,
        workflow: &WorkflowInstance,
        step: &WorkflowStep,
    ) -> Result<Payload, WorkflowError> {
        if !self
            .store
            .claim_step(&workflow.id, &step.id, &self.runner_id)
            .await?
        {
            let owner = self
                .store
                .step_claim(&workflow.id, &step.id)
                .await?
                .map(|claim| claim.owner);
            warn!(
                workflow_id = %workflow.id,
                step_id = %step.id,
                owner = owner.as_deref().unwrap_or("-"),
                "Step already claimed by another runner"
            );
            return Err(WorkflowError::StepInProgress {
                workflow_id: workflow.id.clone(),
                step_id: step.id.clone(),
            });
        }
        self.store
            .save_step(&workflow.id, &step.id, StepStatus::Running, None)
            .await?;
        Ok(workflow.payload_for(step))
    }

    /// Store a step's outcome. A failure marks the workflow FAILED unless it
    /// already reached a terminal state.
    async fn record_outcome(
        &self,
        workflow_id: &str,
        step: &WorkflowStep,
        outcome: Result<Value, ServiceError>,
    ) -> Result<Value, WorkflowError> {
        match outcome {
            Ok(result) => {
                self.store
                    .save_step(workflow_id, &step.id, StepStatus::Completed, Some(&result))
                    .await?;
                debug!(workflow_id = %workflow_id, step_id = %step.id, "Step completed");
                Ok(result)
            }
            Err(source) => {
                let status = if source.is_timeout() {
                    StepStatus::Timeout
                } else {
                    StepStatus::Failed
                };
                self.store
                    .save_step(workflow_id, &step.id, status, None)
                    .await?;
                self.move_state(workflow_id, &ACTIVE_STATES, CaseState::Failed)
                    .await?;
                error!(
                    workflow_id = %workflow_id,
                    step_id = %step.id,
                    status = %status,
                    error = %source,
                    "Step failed"
                );
                Err(WorkflowError::StepFailed {
                    step_id: step.id.clone(),
                    source,
                })
            }
        }
    }
}

fn invalid_state(workflow: &WorkflowInstance) -> WorkflowError {
    WorkflowError::InvalidWorkflowState {
        workflow_id: workflow.id.clone(),
        state: workflow.state.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;
    use crate::scheduler::{MemoryBackend, QueueBackend};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Echoes the payload back and records call order.
    #[derive(Default)]
    struct EchoClient {
        calls: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ServiceClient for EchoClient {
        async fn call(
            &self,
            target: &ServiceTarget,
            action: &str,
            payload: &Payload,
        ) -> Result<Value, ServiceError> {
            self.calls
                .lock()
                .expect("lock not poisoned")
                .push(format!("{}/{}", target.name, action));
            Ok(json!({ "action": action, "input": payload }))
        }
    }

    /// Fails with a connection error a fixed number of times, then succeeds.
    struct FlakyClient {
        failures: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ServiceClient for FlakyClient {
        async fn call(
            &self,
            target: &ServiceTarget,
            _action: &str,
            _payload: &Payload,
        ) -> Result<Value, ServiceError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(ServiceError::Connection {
                    service: target.name.clone(),
                    message: "refused".into(),
                })
            } else {
                Ok(json!({"attempt": n}))
            }
        }
    }

    struct SlowClient;

    #[async_trait]
    impl ServiceClient for SlowClient {
        async fn call(&self, _: &ServiceTarget, _: &str, _: &Payload) -> Result<Value, ServiceError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    async fn orchestrator(client: Arc<dyn ServiceClient>) -> WorkflowOrchestrator {
        let orch = WorkflowOrchestrator::new(client).with_default_retry(RetryPolicy::immediate(2));
        orch.register_service("svc", "http://svc.local").await;
        orch
    }

    #[tokio::test]
    async fn test_execute_threads_results() {
        let client = Arc::new(EchoClient::default());
        let orch = orchestrator(client.clone()).await;
        let wf = orch
            .create_workflow(
                "case-1",
                vec![
                    WorkflowStep::new("b", "svc", "second").depends_on("a"),
                    WorkflowStep::new("a", "svc", "first"),
                ],
            )
            .await
            .expect("created");

        let status = orch.execute_workflow(&wf.id).await.expect("resolved");
        assert_eq!(status.state, CaseState::Resolved);
        assert_eq!(status.step_status["a"], StepStatus::Completed);
        assert_eq!(status.step_results["b"]["input"]["a_result"]["action"], "first");

        let calls = client.calls.lock().expect("lock not poisoned").clone();
        assert_eq!(calls, vec!["svc/first", "svc/second"]);
    }

    #[tokio::test]
    async fn test_execute_twice_rejected() {
        let orch = orchestrator(Arc::new(EchoClient::default())).await;
        let wf = orch
            .create_workflow("c", vec![WorkflowStep::new("a", "svc", "x")])
            .await
            .expect("created");
        orch.execute_workflow(&wf.id).await.expect("first run");
        assert!(matches!(
            orch.execute_workflow(&wf.id).await,
            Err(WorkflowError::InvalidWorkflowState { .. })
        ));
    }

    #[tokio::test]
    async fn test_transient_errors_retried() {
        let client = Arc::new(FlakyClient {
            failures: 2,
            attempts: AtomicUsize::new(0),
        });
        let orch = orchestrator(client.clone()).await;
        let wf = orch
            .create_workflow("c", vec![WorkflowStep::new("a", "svc", "x")])
            .await
            .expect("created");

        let status = orch.execute_workflow(&wf.id).await.expect("resolved");
        assert_eq!(status.step_results["a"]["attempt"], 2);
        assert_eq!(client.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unregistered_service_fails_without_retry() {
        let client = Arc::new(EchoClient::default());
        let orch = orchestrator(client.clone()).await;
        let wf = orch
            .create_workflow("c", vec![WorkflowStep::new("a", "missing", "x")])
            .await
            .expect("created");

        match orch.execute_workflow(&wf.id).await {
            Err(WorkflowError::StepFailed { step_id, source }) => {
                assert_eq!(step_id, "a");
                assert!(matches!(source, ServiceError::NotRegistered(_)));
            }
            other => panic!("expected step failure, got {other:?}"),
        }
        let status = orch.get_workflow_status(&wf.id).await.expect("exists");
        assert_eq!(status.state, CaseState::Failed);
        assert_eq!(status.step_status["a"], StepStatus::Failed);
        assert!(client.calls.lock().expect("lock not poisoned").is_empty());
    }

    #[tokio::test]
    async fn test_step_timeout_marks_timeout() {
        let orch = WorkflowOrchestrator::new(Arc::new(SlowClient))
            .with_default_retry(RetryPolicy::immediate(0));
        orch.register_service("svc", "http://svc.local").await;
        let wf = orch
            .create_workflow(
                "c",
                vec![WorkflowStep::new("a", "svc", "x").with_timeout(Duration::from_millis(20))],
            )
            .await
            .expect("created");

        let err = orch.execute_workflow(&wf.id).await.expect_err("times out");
        assert!(matches!(err, WorkflowError::StepFailed { .. }));
        let status = orch.get_workflow_status(&wf.id).await.expect("exists");
        assert_eq!(status.step_status["a"], StepStatus::Timeout);
    }

    #[tokio::test]
    async fn test_cycle_fails_workflow() {
        let orch = orchestrator(Arc::new(EchoClient::default())).await;
        let wf = orch
            .create_workflow(
                "c",
                vec![
                    WorkflowStep::new("a", "svc", "x").depends_on("b"),
                    WorkflowStep::new("b", "svc", "y").depends_on("a"),
                ],
            )
            .await
            .expect("created");

        assert!(matches!(
            orch.execute_workflow(&wf.id).await,
            Err(WorkflowError::CycleDetected(_))
        ));
        let status = orch.get_workflow_status(&wf.id).await.expect("exists");
        assert_eq!(status.state, CaseState::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_steps_rejected() {
        let orch = orchestrator(Arc::new(EchoClient::default())).await;
        let result = orch
            .create_workflow(
                "c",
                vec![WorkflowStep::new("a", "svc", "x"), WorkflowStep::new("a", "svc", "y")],
            )
            .await;
        assert!(matches!(result, Err(WorkflowError::DuplicateStep(_))));
    }

    #[tokio::test]
    async fn test_cancel_rules() {
        let orch = orchestrator(Arc::new(EchoClient::default())).await;
        let wf = orch
            .create_workflow("c", vec![WorkflowStep::new("a", "svc", "x")])
            .await
            .expect("created");

        assert!(orch.cancel_workflow(&wf.id).await.expect("cancel"));
        assert!(!orch.cancel_workflow(&wf.id).await.expect("cancel"));
        assert!(!orch.cancel_workflow("unknown").await.expect("cancel"));
        assert!(matches!(
            orch.execute_workflow(&wf.id).await,
            Err(WorkflowError::InvalidWorkflowState { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_step_waits_for_dependencies() {
        let orch = orchestrator(Arc::new(EchoClient::default())).await;
        let wf = orch
            .create_workflow(
                "c",
                vec![
                    WorkflowStep::new("a", "svc", "x"),
                    WorkflowStep::new("b", "svc", "y").depends_on("a"),
                ],
            )
            .await
            .expect("created");

        assert!(matches!(
            orch.run_step(&wf.id, "b").await,
            Err(WorkflowError::DependenciesPending(_))
        ));
        assert!(matches!(orch.run_step(&wf.id, "a").await, Ok(StepRun::Completed(_))));
        assert_eq!(orch.run_step(&wf.id, "a").await.expect("ok"), StepRun::AlreadyCompleted);

        match orch.run_step(&wf.id, "b").await.expect("ran") {
            StepRun::Completed(result) => assert_eq!(result["input"]["a_result"]["action"], "x"),
            other => panic!("expected completion, got {other:?}"),
        }
        let status = orch.get_workflow_status(&wf.id).await.expect("exists");
        assert_eq!(status.state, CaseState::Resolved);
    }

    #[tokio::test]
    async fn test_run_step_skips_after_dependency_failure() {
        let orch = orchestrator(Arc::new(EchoClient::default())).await;
        let wf = orch
            .create_workflow(
                "c",
                vec![
                    WorkflowStep::new("a", "nowhere", "x"),
                    WorkflowStep::new("b", "svc", "y").depends_on("a"),
                ],
            )
            .await
            .expect("created");

        assert!(orch.run_step(&wf.id, "a").await.is_err());
        assert_eq!(orch.run_step(&wf.id, "b").await.expect("ok"), StepRun::Skipped);
        let status = orch.get_workflow_status(&wf.id).await.expect("exists");
        assert_eq!(status.state, CaseState::Failed);
        assert_eq!(status.step_status["b"], StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_registered_services_sorted() {
        let orch = orchestrator(Arc::new(EchoClient::default())).await;
        orch.register_service("alpha", "http://a").await;
        assert_eq!(orch.registered_services().await, vec!["alpha", "svc"]);
    }

    /// Takes a while to answer and counts its calls.
    #[derive(Default)]
    struct CountingClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ServiceClient for CountingClient {
        async fn call(&self, _: &ServiceTarget, action: &str, _: &Payload) -> Result<Value, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!({ "done": action }))
        }
    }

    /// Always refuses the connection.
    #[derive(Default)]
    struct DownClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ServiceClient for DownClient {
        async fn call(&self, target: &ServiceTarget, _: &str, _: &Payload) -> Result<Value, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::Connection {
                service: target.name.clone(),
                message: "refused".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_call_service_once() {
        let client = Arc::new(CountingClient::default());
        let orch = orchestrator(client.clone()).await;
        let wf = orch
            .create_workflow("c", vec![WorkflowStep::new("a", "svc", "x")])
            .await
            .expect("created");

        let (first, second) = tokio::join!(orch.run_step(&wf.id, "a"), orch.run_step(&wf.id, "a"));
        let outcomes = [first, second];
        let completed = outcomes
            .iter()
            .filter(|r| matches!(r, Ok(StepRun::Completed(_))))
            .count();
        let in_progress = outcomes
            .iter()
            .filter(|r| matches!(r, Err(WorkflowError::StepInProgress { .. })))
            .count();

        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(completed, 1);
        assert_eq!(in_progress, 1);
        assert_eq!(orch.run_step(&wf.id, "a").await.expect("ok"), StepRun::AlreadyCompleted);
    }

    #[tokio::test]
    async fn test_orchestrators_share_workflows_through_store() {
        let backend: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::new());
        let producer = WorkflowOrchestrator::new(Arc::new(EchoClient::default()))
            .with_store(WorkflowStore::new(Arc::clone(&backend), "cases"));
        let client = Arc::new(EchoClient::default());
        let worker = WorkflowOrchestrator::new(client.clone())
            .with_store(WorkflowStore::new(backend, "cases"));
        worker.register_service("svc", "http://svc.local").await;

        let wf = producer
            .create_workflow(
                "case-7",
                vec![
                    WorkflowStep::new("a", "svc", "x"),
                    WorkflowStep::new("b", "svc", "y").depends_on("a"),
                ],
            )
            .await
            .expect("created");

        assert!(matches!(worker.run_step(&wf.id, "a").await, Ok(StepRun::Completed(_))));
        match worker.run_step(&wf.id, "b").await.expect("ran") {
            StepRun::Completed(result) => assert_eq!(result["input"]["a_result"]["action"], "x"),
            other => panic!("expected completion, got {other:?}"),
        }

        let status = producer.get_workflow_status(&wf.id).await.expect("visible");
        assert_eq!(status.state, CaseState::Resolved);
        assert_eq!(status.case_id, "case-7");
        assert_eq!(status.step_status["b"], StepStatus::Completed);
        assert_eq!(client.calls.lock().expect("lock not poisoned").len(), 2);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast() {
        let client = Arc::new(DownClient::default());
        let orch = WorkflowOrchestrator::new(client.clone())
            .with_default_retry(RetryPolicy::immediate(0))
            .with_breaker_config(
                CircuitBreakerConfig::default()
                    .with_failure_threshold(2)
                    .with_timeout(Duration::from_secs(60)),
            );
        orch.register_service("svc", "http://svc.local").await;

        for _ in 0..2 {
            let err = orch
                .call_service("svc", "ping", &Payload::new())
                .await
                .expect_err("down");
            assert!(matches!(err, ServiceError::Connection { .. }));
        }
        let breaker = orch.service_breaker("svc").await.expect("registered");
        assert_eq!(breaker.state(), CircuitState::Open);

        let wf = orch
            .create_workflow("c", vec![WorkflowStep::new("a", "svc", "x")])
            .await
            .expect("created");
        match orch.execute_workflow(&wf.id).await {
            Err(WorkflowError::StepFailed { source, .. }) => {
                assert!(matches!(source, ServiceError::CircuitOpen(_)));
            }
            other => panic!("expected open circuit, got {other:?}"),
        }
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejections_do_not_trip_breaker() {
        struct RejectingClient;

        #[async_trait]
        impl ServiceClient for RejectingClient {
            async fn call(&self, target: &ServiceTarget, _: &str, _: &Payload) -> Result<Value, ServiceError> {
                Err(ServiceError::Application {
                    service: target.name.clone(),
                    status: 400,
                    message: "bad input".into(),
                })
            }
        }

        let orch = WorkflowOrchestrator::new(Arc::new(RejectingClient))
            .with_breaker_config(CircuitBreakerConfig::default().with_failure_threshold(1));
        orch.register_service("svc", "http://svc.local").await;
        for _ in 0..3 {
            assert!(orch.call_service("svc", "x", &Payload::new()).await.is_err());
        }
        let breaker = orch.service_breaker("svc").await.expect("registered");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_invalid_retry_policy_rejected() {
        let orch = orchestrator(Arc::new(EchoClient::default())).await;
        let result = orch
            .create_workflow(
                "c",
                vec![WorkflowStep::new("a", "svc", "x").with_retry_policy(RetryPolicy::new(2).with_base(0.1))],
            )
            .await;
        assert!(matches!(result, Err(WorkflowError::InvalidStep { .. })));
    }
}
