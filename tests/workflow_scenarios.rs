//! Workflow execution scenarios, inline and through the worker pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use case_orchestrator::error::{ServiceError, WorkflowError};
use case_orchestrator::resilience::RetryPolicy;
use case_orchestrator::scheduler::{
    HandlerRegistry, Payload, TaskPriority, TaskQueue, WorkerPool, WorkerPoolConfig,
};
use case_orchestrator::services::{ServiceClient, ServiceTarget};
use case_orchestrator::state_machine::CaseState;
use case_orchestrator::workflow::{
    StepStatus, WorkflowOrchestrator, WorkflowStep, WorkflowStepHandler, WORKFLOW_STEP_TASK,
};
use serde_json::{json, Value};

/// Succeeds for every action except those listed in `failing`, recording the
/// order of calls.
#[derive(Default)]
struct ScriptedClient {
    failing: Vec<String>,
    calls: Mutex<Vec<String>>,
    attempts: AtomicUsize,
}

impl ScriptedClient {
    fn failing(actions: &[&str]) -> Self {
        Self {
            failing: actions.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock not poisoned").clone()
    }
}

#[async_trait]
impl ServiceClient for ScriptedClient {
    async fn call(
        &self,
        target: &ServiceTarget,
        action: &str,
        payload: &Payload,
    ) -> Result<Value, ServiceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.calls
            .lock()
            .expect("lock not poisoned")
            .push(action.to_string());
        if self.failing.iter().any(|f| f == action) {
            return Err(ServiceError::Application {
                service: target.name.clone(),
                status: 503,
                message: "unavailable".into(),
            });
        }
        Ok(json!({ "action": action, "inputs": payload.keys().cloned().collect::<Vec<_>>() }))
    }
}

async fn orchestrator(client: Arc<ScriptedClient>) -> WorkflowOrchestrator {
    let orch = WorkflowOrchestrator::new(client).with_default_retry(RetryPolicy::immediate(2));
    orch.register_service("ci", "http://ci.local").await;
    orch
}

#[tokio::test]
async fn test_failing_middle_step_stops_workflow() {
    let client = Arc::new(ScriptedClient::failing(&["step2"]));
    let orch = orchestrator(client.clone()).await;
    let wf = orch
        .create_workflow(
            "case-1",
            vec![
                WorkflowStep::new("step1", "ci", "step1"),
                WorkflowStep::new("step2", "ci", "step2").depends_on("step1"),
                WorkflowStep::new("step3", "ci", "step3")
                    .depends_on("step1")
                    .depends_on("step2"),
            ],
        )
        .await
        .expect("created");

    assert_eq!(
        orch.execution_order(&wf.id).await.expect("acyclic"),
        vec!["step1", "step2", "step3"]
    );

    let err = orch.execute_workflow(&wf.id).await.expect_err("step2 fails");
    match err {
        WorkflowError::StepFailed { step_id, source } => {
            assert_eq!(step_id, "step2");
            assert!(source.is_transient());
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let status = orch.get_workflow_status(&wf.id).await.expect("exists");
    assert_eq!(status.state, CaseState::Failed);
    assert_eq!(status.step_status["step1"], StepStatus::Completed);
    assert_eq!(status.step_status["step2"], StepStatus::Failed);
    assert_eq!(status.step_status["step3"], StepStatus::Pending);
    assert_eq!(status.step_results.keys().collect::<Vec<_>>(), vec!["step1"]);

    // step2 retried twice, step3 never attempted.
    let calls = client.calls();
    assert_eq!(calls, vec!["step1", "step2", "step2", "step2"]);
}

#[tokio::test]
async fn test_dependents_run_after_dependencies() {
    let client = Arc::new(ScriptedClient::default());
    let orch = orchestrator(client.clone()).await;
    let wf = orch
        .create_workflow(
            "case-2",
            vec![
                WorkflowStep::new("C", "ci", "C").depends_on("A").depends_on("B"),
                WorkflowStep::new("B", "ci", "B").depends_on("A"),
                WorkflowStep::new("A", "ci", "A"),
            ],
        )
        .await
        .expect("created");

    let status = orch.execute_workflow(&wf.id).await.expect("resolved");
    assert_eq!(status.state, CaseState::Resolved);
    assert_eq!(client.calls(), vec!["A", "B", "C"]);
    assert_eq!(status.step_results["C"]["inputs"], json!(["A_result", "B_result"]));
}

#[tokio::test]
async fn test_queued_workflow_resolves_through_worker_pool() {
    let client = Arc::new(ScriptedClient::default());
    let orch = Arc::new(orchestrator(client.clone()).await);
    let wf = orch
        .create_workflow(
            "case-3",
            vec![
                WorkflowStep::new("notify", "ci", "notify").depends_on("rerun"),
                WorkflowStep::new("rerun", "ci", "rerun"),
            ],
        )
        .await
        .expect("created");

    // Short fixed backoff so the waiting step yields to its dependency.
    let backoff = RetryPolicy::new(0)
        .with_initial_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_millis(50));
    let queue = Arc::new(
        TaskQueue::in_memory("wf-pool")
            .with_poll_interval(Duration::from_millis(5))
            .with_backoff(backoff),
    );
    // Enqueue the dependent first: it has to wait for its dependency.
    for step_id in ["notify", "rerun"] {
        let mut payload = Payload::new();
        payload.insert("workflow_id".into(), json!(wf.id));
        payload.insert("step_id".into(), json!(step_id));
        queue
            .enqueue(WORKFLOW_STEP_TASK, payload, TaskPriority::Normal, None, 5)
            .await
            .expect("enqueued");
    }

    let handlers = HandlerRegistry::new()
        .with_handler(WORKFLOW_STEP_TASK, Arc::new(WorkflowStepHandler::new(Arc::clone(&orch))));
    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(1)
            .with_poll_interval(Duration::from_millis(5))
            .with_shutdown_timeout(Duration::from_secs(5)),
        Arc::clone(&queue),
        handlers,
    );
    pool.start().await.expect("started");

    let mut resolved = false;
    for _ in 0..100 {
        let status = orch.get_workflow_status(&wf.id).await.expect("exists");
        if status.state == CaseState::Resolved {
            resolved = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    pool.shutdown().await.expect("stopped");

    assert!(resolved, "workflow did not resolve");
    assert_eq!(client.calls(), vec!["rerun", "notify"]);
    let stats = queue.get_stats().await.expect("stats");
    assert_eq!(stats.dead_lettered, 0);
}

#[tokio::test]
async fn test_cancel_before_execution() {
    let client = Arc::new(ScriptedClient::default());
    let orch = orchestrator(client.clone()).await;
    let wf = orch
        .create_workflow("case-4", vec![WorkflowStep::new("a", "ci", "a")])
        .await
        .expect("created");

    assert!(orch.cancel_workflow(&wf.id).await.expect("cancel"));
    assert!(orch.execute_workflow(&wf.id).await.is_err());
    assert_eq!(client.attempts.load(Ordering::SeqCst), 0);
}
