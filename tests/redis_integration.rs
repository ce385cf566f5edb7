//! Integration tests against a live Redis.
//!
//! Run with: REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_integration -- --ignored

use std::time::Duration;

use case_orchestrator::resilience::RetryPolicy;
use case_orchestrator::scheduler::{FailOutcome, Payload, TaskPriority, TaskQueue, TaskStatus};
use serde_json::json;
use uuid::Uuid;

fn redis_url() -> String {
    std::env::var("REDIS_URL").expect("REDIS_URL environment variable must be set for integration tests")
}

/// Connects to a queue with a unique name so runs do not share keys.
async fn fresh_queue() -> TaskQueue {
    let name = format!("test-{}", Uuid::new_v4());
    TaskQueue::connect(&redis_url(), &name)
        .await
        .expect("Redis reachable")
        .with_poll_interval(Duration::from_millis(10))
        .with_backoff(RetryPolicy::immediate(0))
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_redis_priority_and_fifo() {
    let queue = fresh_queue().await;
    for (name, priority) in [
        ("low", TaskPriority::Low),
        ("normal-1", TaskPriority::Normal),
        ("critical", TaskPriority::Critical),
        ("normal-2", TaskPriority::Normal),
    ] {
        let mut payload = Payload::new();
        payload.insert("name".into(), json!(name));
        queue
            .enqueue("work", payload, priority, None, 3)
            .await
            .expect("enqueued");
    }

    let mut names = Vec::new();
    while let Some(task) = queue.try_dequeue().await.expect("redis") {
        names.push(task.payload_str("name").map(str::to_string).expect("name"));
        queue.complete(&task.task_id, None).await.expect("completed");
    }
    assert_eq!(names, vec!["critical", "normal-1", "normal-2", "low"]);

    let stats = queue.get_stats().await.expect("stats");
    assert_eq!(stats.total_tasks, 4);
    assert_eq!(stats.processing, 0);
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_redis_dead_letter_and_replay() {
    let queue = fresh_queue().await;
    let task = queue
        .enqueue("flaky", Payload::new(), TaskPriority::High, None, 1)
        .await
        .expect("enqueued");

    let mut outcomes = Vec::new();
    while let Some(delivered) = queue.dequeue(Duration::from_millis(200)).await.expect("redis") {
        outcomes.push(queue.fail(&delivered.task_id, "boom").await.expect("failed"));
    }
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes.last(), Some(&FailOutcome::DeadLettered));

    let dead = queue.get_dead_letter_tasks(10).await.expect("redis");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task_id, task.task_id);
    assert_eq!(dead[0].status, TaskStatus::DeadLettered);

    let replayed = queue.replay_dead_letter(&task.task_id).await.expect("replayed");
    let next = queue.try_dequeue().await.expect("redis").expect("replayed task");
    assert_eq!(next.task_id, replayed.task_id);
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_redis_recover_processing() {
    let queue = fresh_queue().await;
    let task = queue
        .enqueue("work", Payload::new(), TaskPriority::Normal, None, 3)
        .await
        .expect("enqueued");
    queue.try_dequeue().await.expect("redis").expect("task");
    assert_eq!(queue.get_stats().await.expect("stats").processing, 1);

    // Simulates a worker that crashed mid-task.
    assert_eq!(queue.recover_processing().await.expect("redis"), 1);
    let again = queue.try_dequeue().await.expect("redis").expect("recovered");
    assert_eq!(again.task_id, task.task_id);
}
