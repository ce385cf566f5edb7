//! Prometheus-based monitoring for queue, worker and resilience events.
//!
//! # Example
//!
//! ```ignore
//! use case_orchestrator::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_task_event("notify", "completed");
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};
