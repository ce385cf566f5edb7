//! Worker pool draining the task queue.
//!
//! Each worker runs as an independent async task: it dequeues the most
//! urgent task, dispatches it by `task_type` to a registered
//! [`TaskHandler`], enforces the per-task timeout and reports the outcome
//! back to the queue with `complete` or `fail`.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel
//! - Opt-in crash recovery of the processing list on start
//! - Immediate dead-lettering of [`PermanentFailure`]s
//! - Pool statistics tracking

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::queue::TaskQueue;
use super::task::Task;
use crate::metrics::MetricsCollector;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Handler error that no retry can fix.
///
/// A handler returning this (directly or wrapped with context) has its task
/// dead-lettered at once instead of spending the rest of its budget.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PermanentFailure(pub String);

impl PermanentFailure {
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

fn is_permanent(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<PermanentFailure>())
}

/// Executes tasks of one type.
///
/// A returned error fails the task, which the queue then retries or
/// dead-letters according to the task's budget. See [`PermanentFailure`].
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> anyhow::Result<Option<Value>>;
}

/// Maps task types to their handlers.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any previous one for the same type.
    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type.into(), handler);
    }

    pub fn with_handler(mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(task_type, handler);
        self
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long one dequeue call waits for work.
    pub poll_interval: Duration,
    /// Maximum time allowed for handling a single task.
    pub task_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Requeue the processing list on start. Only safe when no other worker
    /// process is draining the same queue.
    pub recover_on_start: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            poll_interval: Duration::from_secs(1),
            task_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(60),
            recover_on_start: false,
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_recovery(mut self, recover_on_start: bool) -> Self {
        self.recover_on_start = recover_on_start;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently handling a task.
    pub active_workers: usize,
    /// Tasks whose handler succeeded.
    pub tasks_completed: u64,
    /// Tasks whose handler failed or had no handler.
    pub tasks_failed: u64,
    /// Tasks whose handler exceeded the timeout.
    pub tasks_timed_out: u64,
    /// Average handling duration.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of tasks handled.
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed + self.tasks_timed_out
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Default)]
struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_timed_out: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn record(&self, counter: &AtomicU64, duration: Duration) {
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let timed_out = self.tasks_timed_out.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = completed + failed + timed_out;
        let average = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            tasks_completed: completed,
            tasks_failed: failed,
            tasks_timed_out: timed_out,
            average_task_duration: average,
        }
    }
}

/// Pool of workers processing tasks from a shared queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<TaskQueue>,
    handlers: Arc<HandlerRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
    metrics: MetricsCollector,
}

impl WorkerPool {
    /// Creates a worker pool over an existing queue.
    pub fn new(config: WorkerPoolConfig, queue: Arc<TaskQueue>, handlers: HandlerRegistry) -> Self {
        // Only one shutdown signal is ever sent
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            handlers: Arc::new(handlers),
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::default()),
            is_running: AtomicBool::new(false),
            metrics: MetricsCollector::new(),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        if self.config.recover_on_start {
            if let Err(e) = self.queue.recover_processing().await {
                warn!(error = %e, "Failed to recover processing tasks");
            }
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&self.queue),
                handlers: Arc::clone(&self.handlers),
                shutdown_rx: self.shutdown_tx.subscribe(),
                poll_interval: self.config.poll_interval,
                task_timeout: self.config.task_timeout,
                stats: Arc::clone(&self.stats),
                metrics: self.metrics.clone(),
            };

            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        self.metrics.update_workers(self.config.num_workers);
        info!(
            num_workers = self.config.num_workers,
            task_types = ?self.handlers.task_types(),
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers, letting in-flight tasks finish.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.worker_handles.drain(..).collect();
        let result =
            tokio::time::timeout(self.config.shutdown_timeout, futures::future::join_all(handles))
                .await;

        self.is_running.store(false, Ordering::SeqCst);
        self.metrics.update_workers(0);

        match result {
            Ok(joined) => {
                for outcome in joined {
                    if let Err(e) = outcome {
                        error!(error = %e, "Worker task panicked during shutdown");
                    }
                }
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }
}

/// A single worker that processes tasks from the queue.
struct Worker {
    id: String,
    queue: Arc<TaskQueue>,
    handlers: Arc<HandlerRegistry>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    task_timeout: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queue.dequeue(self.poll_interval).await {
                Ok(Some(task)) => self.process_task(task).await,
                Ok(None) => {
                    debug!(worker_id = %self.id, "No tasks available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue task");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process_task(&self, task: Task) {
        let start_time = Instant::now();
        info!(
            worker_id = %self.id,
            task_id = %task.task_id,
            task_type = %task.task_type,
            attempt = task.retry_count + 1,
            "Processing task"
        );

        let Some(handler) = self.handlers.get(&task.task_type) else {
            self.stats.record(&self.stats.tasks_failed, start_time.elapsed());
            let message = format!("No handler registered for task type '{}'", task.task_type);
            self.report_failure(&task, &message).await;
            return;
        };

        self.stats.active_workers.fetch_add(1, Ordering::SeqCst);
        self.metrics.inc_tasks_in_progress();
        let outcome = tokio::time::timeout(self.task_timeout, handler.handle(&task)).await;
        self.metrics.dec_tasks_in_progress();
        self.stats.active_workers.fetch_sub(1, Ordering::SeqCst);

        let duration = start_time.elapsed();
        self.metrics
            .record_task_duration(&task.task_type, duration.as_secs_f64());

        match outcome {
            Ok(Ok(result)) => {
                self.stats.record(&self.stats.tasks_completed, duration);
                if let Err(e) = self.queue.complete(&task.task_id, result).await {
                    error!(
                        worker_id = %self.id,
                        task_id = %task.task_id,
                        error = %e,
                        "Failed to mark task complete"
                    );
                }
            }
            Ok(Err(e)) if is_permanent(&e) => {
                self.stats.record(&self.stats.tasks_failed, duration);
                let message = format!("{e:#}");
                warn!(
                    worker_id = %self.id,
                    task_id = %task.task_id,
                    error = %message,
                    "Permanent task failure"
                );
                if let Err(e) = self.queue.dead_letter(&task.task_id, &message).await {
                    error!(
                        worker_id = %self.id,
                        task_id = %task.task_id,
                        error = %e,
                        "Failed to dead-letter task"
                    );
                }
            }
            Ok(Err(e)) => {
                self.stats.record(&self.stats.tasks_failed, duration);
                self.report_failure(&task, &format!("{e:#}")).await;
            }
            Err(_) => {
                self.stats.record(&self.stats.tasks_timed_out, duration);
                self.metrics.record_task_event(&task.task_type, "timeout");
                let message = format!("Task timed out after {:?}", self.task_timeout);
                self.report_failure(&task, &message).await;
            }
        }
    }

    async fn report_failure(&self, task: &Task, message: &str) {
        match self.queue.fail(&task.task_id, message).await {
            Ok(outcome) => debug!(
                worker_id = %self.id,
                task_id = %task.task_id,
                outcome = ?outcome,
                "Recorded task failure"
            ),
            Err(e) => error!(
                worker_id = %self.id,
                task_id = %task.task_id,
                error = %e,
                "Failed to record task failure"
            ),
        }
    }
}
