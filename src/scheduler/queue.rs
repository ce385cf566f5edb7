//! Priority task queue with scheduled retries and a dead-letter path.
//!
//! The queue stores the full state of every task in one hash and moves only
//! task ids through its lists:
//!
//! - `{queue_name}:tasks`: hash of task_id → serialized [`Task`]
//! - `{queue_name}:{priority}`: immediate list per priority level
//! - `{queue_name}:{priority}:scheduled`: sorted set of delayed ids, scored by
//!   due time (Unix seconds)
//! - `{queue_name}:processing`: ids currently handed to a worker
//! - `{queue_name}:dead_letter`: ids that exhausted their retry budget
//!
//! # Ordering
//!
//! Within one priority, delivery is FIFO: enqueue pushes on the left and
//! dequeue pops on the right. Scheduled ids that have become due are pushed on
//! the delivery end, earliest first, so overdue retries go ahead of fresh work
//! of the same priority. Higher priorities always drain first.
//!
//! # Reliability
//!
//! Delivery is at-least-once. The processing list is advisory: it is used by
//! [`TaskQueue::recover_processing`] after a crash, not for exclusivity.
//! Promotion only pushes ids that this caller removed from the scheduled set,
//! and dequeue skips ids whose task is already terminal.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backend::{MemoryBackend, QueueBackend, RedisBackend};
use super::task::{Payload, Task, TaskPriority, TaskStatus};
use crate::error::QueueError;
use crate::metrics::MetricsCollector;
use crate::resilience::RetryPolicy;

/// Maximum number of due ids promoted per priority on one dequeue.
const PROMOTE_BATCH: usize = 100;

/// Default sleep between empty polls in a blocking dequeue.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    /// Ids waiting in any scheduled set.
    pub scheduled: usize,
    pub processing: usize,
    pub dead_lettered: usize,
    /// Every task ever enqueued on this queue.
    pub total_tasks: usize,
}

impl QueueStats {
    /// Immediately deliverable tasks across all priorities.
    pub fn total_queued(&self) -> usize {
        self.critical + self.high + self.normal + self.low
    }

    pub fn depth(&self, priority: TaskPriority) -> usize {
        match priority {
            TaskPriority::Critical => self.critical,
            TaskPriority::High => self.high,
            TaskPriority::Normal => self.normal,
            TaskPriority::Low => self.low,
        }
    }
}

/// What `fail` did with a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    /// Rescheduled into its priority's scheduled set.
    Retrying {
        retry_count: u32,
        delay_secs: f64,
        scheduled_at: DateTime<Utc>,
    },
    /// Moved to the dead-letter list.
    DeadLettered,
}

#[derive(Debug, Clone)]
struct QueueKeys {
    queue_name: String,
    tasks: String,
    processing: String,
    dead_letter: String,
}

impl QueueKeys {
    fn new(queue_name: &str) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            tasks: format!("{}:tasks", queue_name),
            processing: format!("{}:processing", queue_name),
            dead_letter: format!("{}:dead_letter", queue_name),
        }
    }

    fn immediate(&self, priority: TaskPriority) -> String {
        format!("{}:{}", self.queue_name, priority.as_str())
    }

    fn scheduled(&self, priority: TaskPriority) -> String {
        format!("{}:{}:scheduled", self.queue_name, priority.as_str())
    }
}

/// Priority task queue over a [`QueueBackend`].
#[derive(Clone)]
pub struct TaskQueue {
    backend: Arc<dyn QueueBackend>,
    keys: QueueKeys,
    backoff: RetryPolicy,
    poll_interval: Duration,
    metrics: MetricsCollector,
}

impl TaskQueue {
    /// Creates a queue over an existing backend.
    pub fn new(backend: Arc<dyn QueueBackend>, queue_name: &str) -> Self {
        Self {
            backend,
            keys: QueueKeys::new(queue_name),
            backoff: RetryPolicy::task_backoff(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            metrics: MetricsCollector::new(),
        }
    }

    /// Connects to Redis and creates a queue.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `queue_name` - Name of the queue (used as prefix for Redis keys)
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let backend = RedisBackend::connect(redis_url).await?;
        Ok(Self::new(Arc::new(backend), queue_name))
    }

    /// Creates a queue over a fresh in-memory backend.
    pub fn in_memory(queue_name: &str) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), queue_name)
    }

    /// Sets the sleep between empty polls in [`TaskQueue::dequeue`].
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Replaces the backoff policy applied by [`TaskQueue::fail`].
    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.keys.queue_name
    }

    /// The store this queue writes to, for components that keep their own
    /// records next to the tasks.
    pub fn backend(&self) -> Arc<dyn QueueBackend> {
        Arc::clone(&self.backend)
    }

    /// Enqueues a new task.
    ///
    /// # Arguments
    ///
    /// * `task_type` - Tag used by workers to pick a handler
    /// * `payload` - Opaque task input
    /// * `priority` - Delivery urgency
    /// * `scheduled_at` - Earliest delivery time; `None` or a past time means now
    /// * `max_retries` - Retry budget before dead-lettering
    pub async fn enqueue(
        &self,
        task_type: &str,
        payload: Payload,
        priority: TaskPriority,
        scheduled_at: Option<DateTime<Utc>>,
        max_retries: u32,
    ) -> Result<Task, QueueError> {
        let mut task = Task::new(task_type, payload, self.queue_name())
            .with_priority(priority)
            .with_max_retries(max_retries);
        task.scheduled_at = scheduled_at;
        self.enqueue_task(task).await
    }

    /// Enqueues a fully built task, persisting it under its own id.
    pub async fn enqueue_task(&self, mut task: Task) -> Result<Task, QueueError> {
        task.queue_name = self.queue_name().to_string();
        task.status = TaskStatus::Pending;
        self.save(&task).await?;

        match task.scheduled_at.filter(|at| *at > Utc::now()) {
            Some(at) => {
                self.backend
                    .zadd(&self.keys.scheduled(task.priority), &task.task_id, unix_secs(at))
                    .await?;
                debug!(task_id = %task.task_id, scheduled_at = %at, "Scheduled task");
            }
            None => {
                self.backend
                    .lpush(&self.keys.immediate(task.priority), &task.task_id)
                    .await?;
            }
        }

        self.metrics.record_task_event(&task.task_type, "enqueued");
        info!(
            task_id = %task.task_id,
            task_type = %task.task_type,
            priority = %task.priority,
            "Enqueued task"
        );
        Ok(task)
    }

    /// Dequeues the most urgent deliverable task.
    ///
    /// Polls until a task is found or `timeout` elapses. A zero timeout
    /// checks once.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Task>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(task) = self.try_dequeue().await? {
                return Ok(Some(task));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Single non-blocking pass over all priorities.
    pub async fn try_dequeue(&self) -> Result<Option<Task>, QueueError> {
        for priority in TaskPriority::ALL {
            self.promote_due(priority).await?;

            let list = self.keys.immediate(priority);
            while let Some(task_id) = self.backend.rpop(&list).await? {
                let Some(mut task) = self.load(&task_id).await? else {
                    warn!(task_id = %task_id, "Dropping queued id with no task record");
                    continue;
                };
                if task.status.is_terminal() {
                    debug!(task_id = %task_id, status = %task.status, "Skipping terminal task");
                    continue;
                }

                task.status = TaskStatus::Processing;
                task.started_at = Some(Utc::now());
                self.save(&task).await?;
                self.backend.lpush(&self.keys.processing, &task.task_id).await?;

                debug!(
                    task_id = %task.task_id,
                    priority = %priority,
                    retry_count = task.retry_count,
                    "Dequeued task"
                );
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Marks a task completed and resets its retry count.
    pub async fn complete(&self, task_id: &str, result: Option<Value>) -> Result<Task, QueueError> {
        let mut task = self.require(task_id, "complete").await?;
        match task.status {
            TaskStatus::Completed => {
                debug!(task_id = %task_id, "Task already completed");
                return Ok(task);
            }
            TaskStatus::DeadLettered => return Err(invalid_state(&task, "completed")),
            _ => {}
        }

        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.retry_count = 0;
        task.error_message = None;
        task.result = result;
        self.save(&task).await?;

        self.backend.lrem(&self.keys.processing, task_id).await?;
        self.backend
            .zrem(&self.keys.scheduled(task.priority), task_id)
            .await?;

        self.metrics.record_task_event(&task.task_type, "completed");
        info!(task_id = %task_id, task_type = %task.task_type, "Task completed");
        Ok(task)
    }

    /// Records a failure, rescheduling the task or dead-lettering it once
    /// the retry budget is spent.
    pub async fn fail(&self, task_id: &str, error_message: &str) -> Result<FailOutcome, QueueError> {
        let mut task = self.require(task_id, "fail").await?;
        if task.status.is_terminal() {
            return Err(invalid_state(&task, "failed"));
        }

        self.backend.lrem(&self.keys.processing, task_id).await?;
        task.error_message = Some(error_message.to_string());

        if task.has_retries_left() {
            task.retry_count += 1;
            let delay = self.backoff.get_delay(task.retry_count);
            let scheduled_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            task.status = TaskStatus::Retrying;
            task.scheduled_at = Some(scheduled_at);
            self.save(&task).await?;
            self.backend
                .zadd(&self.keys.scheduled(task.priority), task_id, unix_secs(scheduled_at))
                .await?;

            self.metrics.record_task_event(&task.task_type, "retrying");
            warn!(
                task_id = %task_id,
                retry_count = task.retry_count,
                max_retries = task.max_retries,
                delay_secs = delay.as_secs_f64(),
                error = %error_message,
                "Task failed, scheduled for retry"
            );
            Ok(FailOutcome::Retrying {
                retry_count: task.retry_count,
                delay_secs: delay.as_secs_f64(),
                scheduled_at,
            })
        } else {
            self.move_to_dead_letter(task).await?;
            Ok(FailOutcome::DeadLettered)
        }
    }

    /// Dead-letters a task immediately, whatever its remaining budget.
    ///
    /// Used for failures that no retry can fix.
    pub async fn dead_letter(&self, task_id: &str, error_message: &str) -> Result<Task, QueueError> {
        let mut task = self.require(task_id, "dead_letter").await?;
        if task.status.is_terminal() {
            return Err(invalid_state(&task, "dead-lettered"));
        }

        self.backend.lrem(&self.keys.processing, task_id).await?;
        self.backend
            .zrem(&self.keys.scheduled(task.priority), task_id)
            .await?;
        task.error_message = Some(error_message.to_string());
        self.move_to_dead_letter(task).await
    }

    async fn move_to_dead_letter(&self, mut task: Task) -> Result<Task, QueueError> {
        task.status = TaskStatus::DeadLettered;
        self.save(&task).await?;
        self.backend.lpush(&self.keys.dead_letter, &task.task_id).await?;

        self.metrics.record_task_event(&task.task_type, "dead_lettered");
        warn!(
            task_id = %task.task_id,
            retry_count = task.retry_count,
            error = task.error_message.as_deref().unwrap_or("-"),
            "Task moved to dead letter queue"
        );
        Ok(task)
    }

    /// Looks up a task by id.
    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>, QueueError> {
        self.load(task_id).await
    }

    /// Immediately deliverable tasks at one priority.
    pub async fn get_queue_size(&self, priority: TaskPriority) -> Result<usize, QueueError> {
        self.backend.llen(&self.keys.immediate(priority)).await
    }

    /// Dead-lettered tasks, most recent first.
    pub async fn get_dead_letter_tasks(&self, limit: usize) -> Result<Vec<Task>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(limit - 1).unwrap_or(isize::MAX);
        let ids = self.backend.lrange(&self.keys.dead_letter, 0, stop).await?;

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = self.load(&id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Re-enqueues a copy of a dead-lettered task.
    ///
    /// The dead-lettered record is left untouched; the copy gets a new id and
    /// a fresh retry budget.
    pub async fn replay_dead_letter(&self, task_id: &str) -> Result<Task, QueueError> {
        let original = self.require(task_id, "replay").await?;
        if original.status != TaskStatus::DeadLettered {
            return Err(invalid_state(&original, "replayed"));
        }

        let replay = Task::new(
            original.task_type.clone(),
            original.payload.clone(),
            self.queue_name(),
        )
        .with_priority(original.priority)
        .with_max_retries(original.max_retries);

        info!(
            task_id = %task_id,
            replay_id = %replay.task_id,
            "Replaying dead-lettered task"
        );
        self.enqueue_task(replay).await
    }

    /// Requeues tasks left in the processing list, e.g. after a worker crash.
    ///
    /// Returns the number of tasks put back on their priority queue.
    pub async fn recover_processing(&self) -> Result<usize, QueueError> {
        let ids = self.backend.lrange(&self.keys.processing, 0, -1).await?;
        let mut recovered = 0;

        for id in ids {
            self.backend.lrem(&self.keys.processing, &id).await?;
            let Some(mut task) = self.load(&id).await? else {
                continue;
            };
            if task.status != TaskStatus::Processing {
                continue;
            }

            task.status = TaskStatus::Pending;
            task.started_at = None;
            self.save(&task).await?;
            self.backend
                .rpush(&self.keys.immediate(task.priority), &task.task_id)
                .await?;
            recovered += 1;
        }

        if recovered > 0 {
            info!(queue = %self.queue_name(), recovered, "Recovered tasks from processing list");
        }
        Ok(recovered)
    }

    /// Gets queue statistics.
    pub async fn get_stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats {
            queue_name: self.queue_name().to_string(),
            ..Default::default()
        };

        for priority in TaskPriority::ALL {
            let immediate = self.keys.immediate(priority);
            let scheduled_key = self.keys.scheduled(priority);
            let (depth, scheduled) = tokio::try_join!(
                self.backend.llen(&immediate),
                self.backend.zcard(&scheduled_key),
            )?;
            match priority {
                TaskPriority::Critical => stats.critical = depth,
                TaskPriority::High => stats.high = depth,
                TaskPriority::Normal => stats.normal = depth,
                TaskPriority::Low => stats.low = depth,
            }
            stats.scheduled += scheduled;
        }

        let (processing, dead_lettered, total_tasks) = tokio::try_join!(
            self.backend.llen(&self.keys.processing),
            self.backend.llen(&self.keys.dead_letter),
            self.backend.hlen(&self.keys.tasks),
        )?;
        stats.processing = processing;
        stats.dead_lettered = dead_lettered;
        stats.total_tasks = total_tasks;

        Ok(stats)
    }

    /// Pushes the current per-priority depth into the queue depth gauge.
    pub async fn publish_depth_metrics(&self) -> Result<QueueStats, QueueError> {
        let stats = self.get_stats().await?;
        for priority in TaskPriority::ALL {
            self.metrics
                .update_queue_depth(self.queue_name(), priority.as_str(), stats.depth(priority));
        }
        Ok(stats)
    }

    async fn promote_due(&self, priority: TaskPriority) -> Result<usize, QueueError> {
        let scheduled = self.keys.scheduled(priority);
        let due = self
            .backend
            .zrange_due(&scheduled, unix_secs(Utc::now()), PROMOTE_BATCH)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }

        let immediate = self.keys.immediate(priority);
        let mut promoted = 0;
        // Pushed latest-due first so the earliest-due id ends up at the pop end.
        for task_id in due.iter().rev() {
            if self.backend.zrem(&scheduled, task_id).await? {
                self.backend.rpush(&immediate, task_id).await?;
                promoted += 1;
            }
        }

        debug!(priority = %priority, promoted, "Promoted scheduled tasks");
        Ok(promoted)
    }

    async fn load(&self, task_id: &str) -> Result<Option<Task>, QueueError> {
        match self.backend.hget(&self.keys.tasks, task_id).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn require(&self, task_id: &str, operation: &str) -> Result<Task, QueueError> {
        match self.load(task_id).await? {
            Some(task) => Ok(task),
            None => {
                warn!(task_id = %task_id, operation, "Task not found");
                Err(QueueError::TaskNotFound(task_id.to_string()))
            }
        }
    }

    async fn save(&self, task: &Task) -> Result<(), QueueError> {
        let raw = serde_json::to_string(task)?;
        self.backend.hset(&self.keys.tasks, &task.task_id, raw).await
    }
}

fn unix_secs(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

fn invalid_state(task: &Task, operation: &str) -> QueueError {
    warn!(task_id = %task.task_id, status = %task.status, operation, "Rejected task operation");
    QueueError::InvalidTaskState {
        task_id: task.task_id.clone(),
        status: task.status.to_string(),
        operation: operation.to_string(),
    }
}
