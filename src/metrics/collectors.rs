//! High-level recording interface over the Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! can record unconditionally.

use super::prometheus::{
    ACTIVE_WORKERS, CASE_TRANSITIONS_TOTAL, CIRCUIT_TRANSITIONS_TOTAL, QUEUE_DEPTH,
    TASKS_IN_PROGRESS, TASKS_TOTAL, TASK_DURATION,
};

/// Metrics collector for queue, worker and resilience events.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a task lifecycle event.
    ///
    /// # Arguments
    ///
    /// * `task_type` - The task's type tag
    /// * `outcome` - One of "enqueued", "completed", "retrying", "dead_lettered", "timeout"
    pub fn record_task_event(&self, task_type: &str, outcome: &str) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[task_type, outcome]).inc();
        }

        tracing::trace!(task_type = task_type, outcome = outcome, "Recorded task metric");
    }

    /// Record how long a handler spent on a task.
    pub fn record_task_duration(&self, task_type: &str, duration_secs: f64) {
        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[task_type])
                .observe(duration_secs);
        }
    }

    /// Update the deliverable depth of one priority level.
    pub fn update_queue_depth(&self, queue_name: &str, priority: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name, priority])
                .set(depth as f64);
        }

        tracing::trace!(
            queue_name = queue_name,
            priority = priority,
            depth = depth,
            "Updated queue depth metric"
        );
    }

    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }
    }

    pub fn inc_tasks_in_progress(&self) {
        if let Some(in_progress) = TASKS_IN_PROGRESS.get() {
            in_progress.inc();
        }
    }

    pub fn dec_tasks_in_progress(&self) {
        if let Some(in_progress) = TASKS_IN_PROGRESS.get() {
            in_progress.dec();
        }
    }

    /// Record a circuit breaker state change.
    pub fn record_circuit_transition(&self, breaker: &str, state: &str) {
        if let Some(transitions) = CIRCUIT_TRANSITIONS_TOTAL.get() {
            transitions.with_label_values(&[breaker, state]).inc();
        }
    }

    /// Record a case entering a new state.
    pub fn record_case_transition(&self, state: &str) {
        if let Some(transitions) = CASE_TRANSITIONS_TOTAL.get() {
            transitions.with_label_values(&[state]).inc();
        }
    }
}
