//! End-to-end alert handling through the engine.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use case_orchestrator::engine::{
    Alert, AlertType, ApplyStatus, Execution, OrchestrationEngine, Proposition,
    PropositionRequest, Recommender, StaticRecommender, UserDecision,
};
use case_orchestrator::error::ServiceError;
use case_orchestrator::resilience::{CircuitBreakerConfig, CircuitState, RetryPolicy};
use case_orchestrator::scheduler::{Payload, TaskPriority, TaskQueue};
use case_orchestrator::services::{ServiceClient, ServiceTarget};
use case_orchestrator::state_machine::{
    AuditTrailHandler, CaseState, EnqueueTaskHandler, HandlerTable, StateMachineManager,
};
use case_orchestrator::workflow::WorkflowOrchestrator;
use serde_json::{json, Value};

struct NullClient;

#[async_trait]
impl ServiceClient for NullClient {
    async fn call(&self, _: &ServiceTarget, _: &str, _: &Payload) -> Result<Value, ServiceError> {
        Ok(json!({}))
    }
}

/// Fails while `down` is set.
struct SwitchableRecommender {
    down: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl Recommender for SwitchableRecommender {
    async fn propositions(&self, _request: &PropositionRequest) -> Result<Vec<Proposition>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            Err(ServiceError::Timeout {
                service: "recommender".into(),
                action: "propositions".into(),
                after: Duration::from_secs(1),
            })
        } else {
            Ok(vec![Proposition::new("p1", "Rerun job", "auto_fix")])
        }
    }
}

fn orchestrator() -> Arc<WorkflowOrchestrator> {
    Arc::new(WorkflowOrchestrator::new(Arc::new(NullClient)))
}

fn scam_alert() -> Alert {
    let mut metadata = Payload::new();
    metadata.insert("url".into(), json!("http://fake-bank.example"));
    Alert::new("scam-1", AlertType::ScamIncident, "Phishing attempt detected")
        .with_severity("critical")
        .with_source("security_scanner")
        .with_metadata(metadata)
}

#[tokio::test]
async fn test_alert_to_remediation_task() {
    let queue = Arc::new(TaskQueue::in_memory("engine-e2e"));

    let mut handlers = HandlerTable::new();
    handlers.register(CaseState::Remediating, Arc::new(AuditTrailHandler));
    handlers.register(
        CaseState::Remediating,
        Arc::new(EnqueueTaskHandler::new(
            Arc::clone(&queue),
            "notify_remediation",
            TaskPriority::Low,
        )),
    );
    let cases = Arc::new(StateMachineManager::with_handlers(handlers));

    let recommender = Arc::new(StaticRecommender::new(vec![
        Proposition::new("block", "Block sender domain", "auto_fix")
            .with_priority(2)
            .with_confidence(0.92),
        Proposition::new("review", "Send to analyst", "manual_review").with_priority(3),
    ]));
    let engine = OrchestrationEngine::new(Arc::clone(&queue), recommender, orchestrator())
        .with_case_manager(Arc::clone(&cases));

    let response = engine.process_alert(scam_alert()).await;
    assert_eq!(response.alert_type, AlertType::ScamIncident);
    assert_eq!(response.propositions[0].id, "block");

    let result = engine
        .apply_proposition(
            &response.alert_id,
            &response.propositions[0],
            &response.request_id,
            UserDecision::Accepted,
        )
        .await
        .expect("applied");
    assert_eq!(result.status, ApplyStatus::Executed);
    assert!(matches!(
        result.execution,
        Some(Execution::Enqueued { priority: TaskPriority::High, .. })
    ));

    let case = cases.get_case_state("scam-1").await.expect("case");
    assert_eq!(case.current_state, CaseState::Remediating);
    let path: Vec<CaseState> = case.transitions.iter().map(|t| t.to).collect();
    assert_eq!(
        path,
        vec![CaseState::Investigating, CaseState::Validating, CaseState::Remediating]
    );

    // The auto_fix task comes out first (HIGH), then the notification (LOW).
    let first = queue.try_dequeue().await.expect("store").expect("auto_fix task");
    assert_eq!(first.task_type, "auto_fix");
    assert_eq!(first.payload_str("alert_id"), Some("scam-1"));
    let second = queue.try_dequeue().await.expect("store").expect("notification task");
    assert_eq!(second.task_type, "notify_remediation");
    assert_eq!(second.payload_str("case_id"), Some("scam-1"));

    let summary = engine.get_alert_summary().await;
    assert_eq!(summary.total_active, 1);
    assert_eq!(summary.alert_types["scam_incident"], 1);
    assert_eq!(summary.total_propositions_tracked, 1);
    assert_eq!(summary.total_actions_executed, 1);
}

#[tokio::test]
async fn test_recommender_breaker_recovers() {
    let recommender = Arc::new(SwitchableRecommender {
        down: AtomicBool::new(true),
        calls: AtomicUsize::new(0),
    });
    let engine = OrchestrationEngine::new(
        Arc::new(TaskQueue::in_memory("breaker")),
        recommender.clone(),
        orchestrator(),
    )
    .with_recommender_retry(RetryPolicy::immediate(0))
    .with_breaker(
        CircuitBreakerConfig::default()
            .with_failure_threshold(2)
            .with_success_threshold(1)
            .with_timeout(Duration::from_millis(100)),
    );

    for i in 0..2 {
        let response = engine
            .process_alert(Alert::new(format!("a{i}"), AlertType::CiFailure, "Build failed"))
            .await;
        assert!(response.degraded);
    }
    assert_eq!(engine.breaker().state(), CircuitState::Open);

    // Open: fails fast without calling.
    let response = engine
        .process_alert(Alert::new("a2", AlertType::CiFailure, "Build failed"))
        .await;
    assert!(response.degraded);
    assert_eq!(recommender.calls.load(Ordering::SeqCst), 2);

    recommender.down.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let response = engine
        .process_alert(Alert::new("a3", AlertType::CiFailure, "Build failed"))
        .await;
    assert!(!response.degraded);
    assert_eq!(response.propositions.len(), 1);
    assert_eq!(engine.breaker().state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_closed_alert_rejects_propositions() {
    let engine = OrchestrationEngine::new(
        Arc::new(TaskQueue::in_memory("closed")),
        Arc::new(StaticRecommender::default()),
        orchestrator(),
    );
    let response = engine.process_alert(scam_alert()).await;
    assert!(response.propositions.is_empty());
    assert!(!response.degraded);

    engine.close_alert("scam-1").await.expect("closed");
    let prop = Proposition::new("p", "t", "escalate");
    assert!(engine
        .apply_proposition("scam-1", &prop, &response.request_id, UserDecision::Accepted)
        .await
        .is_err());
    assert_eq!(engine.get_alert_summary().await.total_active, 0);
}
