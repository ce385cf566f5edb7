//! Prometheus metrics registration and export.
//!
//! This module defines the Prometheus metrics used by case-orchestrator and
//! provides functions for initializing and exporting them.

use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::{Mutex, OnceLock};

// Serializes initialization so every metric lands in the same registry.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Global Prometheus registry for all case-orchestrator metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Task lifecycle events, labeled by task type and outcome.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task handler duration in seconds, labeled by task type.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of immediately deliverable tasks, labeled by queue and priority.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of tasks currently being processed by this process.
pub static TASKS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of active workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Circuit breaker state changes, labeled by breaker name and new state.
pub static CIRCUIT_TRANSITIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Case state transitions, labeled by target state.
pub static CASE_TRANSITIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording before initialization is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Task metrics
    let tasks_total = CounterVec::new(
        Opts::new("case_orchestrator_tasks_total", "Task lifecycle events"),
        &["task_type", "outcome"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "case_orchestrator_task_duration_seconds",
            "Task handler duration in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["task_type"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("case_orchestrator_queue_depth", "Deliverable tasks per priority"),
        &["queue_name", "priority"],
    )?;

    let tasks_in_progress = Gauge::new(
        "case_orchestrator_tasks_in_progress",
        "Number of tasks currently being processed",
    )?;

    // Worker metrics
    let active_workers = Gauge::new("case_orchestrator_active_workers", "Number of active workers")?;

    // Resilience and lifecycle metrics
    let circuit_transitions = CounterVec::new(
        Opts::new(
            "case_orchestrator_circuit_transitions_total",
            "Circuit breaker state changes",
        ),
        &["breaker", "state"],
    )?;

    let case_transitions = CounterVec::new(
        Opts::new("case_orchestrator_case_transitions_total", "Case state transitions"),
        &["state"],
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(tasks_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(circuit_transitions.clone()))?;
    registry.register(Box::new(case_transitions.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = TASKS_IN_PROGRESS.set(tasks_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = CIRCUIT_TRANSITIONS_TOTAL.set(circuit_transitions);
    let _ = CASE_TRANSITIONS_TOTAL.set(case_transitions);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
