//! Queue delivery, retry and dead-letter behaviour against the in-memory
//! backend.

use std::time::Duration;

use case_orchestrator::resilience::RetryPolicy;
use case_orchestrator::scheduler::{FailOutcome, Payload, TaskPriority, TaskQueue, TaskStatus};
use chrono::Utc;
use serde_json::json;

fn payload(key: &str, value: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert(key.to_string(), json!(value));
    payload
}

fn fast_queue(name: &str) -> TaskQueue {
    TaskQueue::in_memory(name)
        .with_poll_interval(Duration::from_millis(5))
        .with_backoff(RetryPolicy::immediate(0))
}

#[tokio::test]
async fn test_priorities_delivered_most_urgent_first() {
    let queue = fast_queue("prio");
    // Enqueue least urgent first so ordering cannot come from insertion.
    for priority in TaskPriority::ALL.iter().rev() {
        queue
            .enqueue("work", payload("p", priority.as_str()), *priority, None, 3)
            .await
            .expect("enqueued");
    }

    let mut delivered = Vec::new();
    while let Some(task) = queue.try_dequeue().await.expect("store") {
        delivered.push(task.priority);
    }
    assert_eq!(delivered, TaskPriority::ALL.to_vec());
}

#[tokio::test]
async fn test_fifo_within_priority() {
    let queue = fast_queue("fifo");
    for name in ["first", "second", "third"] {
        queue
            .enqueue("work", payload("name", name), TaskPriority::High, None, 3)
            .await
            .expect("enqueued");
    }

    let mut names = Vec::new();
    while let Some(task) = queue.try_dequeue().await.expect("store") {
        names.push(task.payload_str("name").map(str::to_string).expect("name"));
    }
    assert_eq!(names, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_exhausted_task_delivered_max_retries_plus_one_times() {
    let queue = fast_queue("dlq");
    let task = queue
        .enqueue("flaky", Payload::new(), TaskPriority::Normal, None, 2)
        .await
        .expect("enqueued");

    let mut deliveries = 0;
    let mut last = None;
    while let Some(delivered) = queue
        .dequeue(Duration::from_millis(100))
        .await
        .expect("store")
    {
        assert_eq!(delivered.task_id, task.task_id);
        deliveries += 1;
        last = Some(queue.fail(&delivered.task_id, "boom").await.expect("failed"));
    }

    assert_eq!(deliveries, 3);
    assert_eq!(last, Some(FailOutcome::DeadLettered));

    let stored = queue.get_task(&task.task_id).await.expect("store").expect("task");
    assert_eq!(stored.status, TaskStatus::DeadLettered);
    assert_eq!(stored.retry_count, stored.max_retries);

    let stats = queue.get_stats().await.expect("stats");
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.total_queued(), 0);
    assert_eq!(stats.scheduled, 0);
    assert_eq!(stats.processing, 0);

    // Terminal: cannot be failed or completed again.
    assert!(queue.fail(&task.task_id, "again").await.is_err());
    assert!(queue.complete(&task.task_id, None).await.is_err());
}

#[tokio::test]
async fn test_notify_fails_twice_then_completes() {
    let queue = TaskQueue::in_memory("notify");
    let task = queue
        .enqueue("notify", Payload::new(), TaskPriority::High, None, 2)
        .await
        .expect("enqueued");

    let delivered = queue.try_dequeue().await.expect("store").expect("task");
    assert_eq!(delivered.status, TaskStatus::Processing);

    let mut delays = Vec::new();
    for _ in 0..2 {
        match queue.fail(&task.task_id, "smtp down").await.expect("failed") {
            FailOutcome::Retrying { delay_secs, .. } => delays.push(delay_secs),
            FailOutcome::DeadLettered => panic!("budget not yet spent"),
        }
    }
    assert_eq!(delays, vec![2.0, 4.0]);

    let done = queue
        .complete(&task.task_id, Some(json!({"sent": true})))
        .await
        .expect("completed");
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.retry_count, 0);

    let stats = queue.get_stats().await.expect("stats");
    assert_eq!(stats.dead_lettered, 0);
    assert_eq!(stats.scheduled, 0);
    assert_eq!(stats.processing, 0);
}

#[tokio::test]
async fn test_scheduled_task_waits_until_due() {
    let queue = fast_queue("delayed");
    let later = Utc::now() + chrono::Duration::milliseconds(300);
    queue
        .enqueue("work", Payload::new(), TaskPriority::Low, Some(later), 3)
        .await
        .expect("enqueued");

    assert!(queue.try_dequeue().await.expect("store").is_none());
    assert_eq!(queue.get_stats().await.expect("stats").scheduled, 1);

    let task = queue
        .dequeue(Duration::from_secs(3))
        .await
        .expect("store")
        .expect("due task delivered");
    assert_eq!(task.priority, TaskPriority::Low);
}

#[tokio::test]
async fn test_replay_dead_letter() {
    let queue = fast_queue("replay");
    let task = queue
        .enqueue("flaky", payload("k", "v"), TaskPriority::High, None, 0)
        .await
        .expect("enqueued");
    queue.try_dequeue().await.expect("store").expect("task");
    assert_eq!(
        queue.fail(&task.task_id, "boom").await.expect("failed"),
        FailOutcome::DeadLettered
    );

    let replayed = queue.replay_dead_letter(&task.task_id).await.expect("replayed");
    assert_ne!(replayed.task_id, task.task_id);
    assert_eq!(replayed.payload_str("k"), Some("v"));

    let next = queue.try_dequeue().await.expect("store").expect("replayed task");
    assert_eq!(next.task_id, replayed.task_id);
    assert!(queue.replay_dead_letter(&replayed.task_id).await.is_err());
}

#[tokio::test]
async fn test_unknown_task_is_typed_error() {
    let queue = fast_queue("unknown");
    assert!(queue.complete("nope", None).await.is_err());
    assert!(queue.fail("nope", "x").await.is_err());
    assert!(queue.get_task("nope").await.expect("store").is_none());
}
