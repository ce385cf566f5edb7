//! Task definitions for the queue.
//!
//! - `Task`: one unit of queued work with its retry budget and lifecycle
//! - `TaskPriority`: delivery urgency, CRITICAL first
//! - `TaskStatus`: lifecycle status

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque JSON object carried by tasks and workflow steps.
pub type Payload = serde_json::Map<String, Value>;

/// Default retry budget for a task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delivery urgency of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl TaskPriority {
    /// All priorities in delivery order.
    pub const ALL: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    /// Lower-case name, used in store keys and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Critical => "critical",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
        }
    }

    /// Map a 1-based rank (1 = most urgent) onto a priority.
    pub fn from_rank(rank: u32) -> Self {
        match rank {
            0 | 1 => TaskPriority::Critical,
            2 => TaskPriority::High,
            3 => TaskPriority::Normal,
            _ => TaskPriority::Low,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(TaskPriority::Critical),
            "high" => Ok(TaskPriority::High),
            "normal" => Ok(TaskPriority::Normal),
            "low" => Ok(TaskPriority::Low),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    DeadLettered,
}

impl TaskStatus {
    /// Terminal tasks are never delivered again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::DeadLettered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
            TaskStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of queued work.
///
/// The full task is persisted in the queue's task hash; the priority lists
/// and scheduled sets only carry its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub task_type: String,
    #[serde(default)]
    pub payload: Payload,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    pub queue_name: String,
}

impl Task {
    /// Creates a pending task with a fresh id.
    pub fn new(task_type: impl Into<String>, payload: Payload, queue_name: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            payload,
            priority: TaskPriority::default(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            error_message: None,
            result: None,
            queue_name: queue_name.into(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Whether another failure would still be retried.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Payload field as a string, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_creation() {
        let task = Task::new("notify", Payload::new(), "tasks")
            .with_priority(TaskPriority::High)
            .with_max_retries(2);

        assert_eq!(task.task_type, "notify");
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert!(task.has_retries_left());
        assert!(Uuid::parse_str(&task.task_id).is_ok());
    }

    #[test]
    fn test_priority_ordering_and_names() {
        assert!(TaskPriority::Critical < TaskPriority::High);
        assert!(TaskPriority::Normal < TaskPriority::Low);
        assert_eq!(TaskPriority::from_str("HIGH"), Ok(TaskPriority::High));
        assert!(TaskPriority::from_str("urgent").is_err());
        assert_eq!(TaskPriority::from_rank(1), TaskPriority::Critical);
        assert_eq!(TaskPriority::from_rank(3), TaskPriority::Normal);
        assert_eq!(TaskPriority::from_rank(9), TaskPriority::Low);
    }

    #[test]
    fn test_task_serialization() {
        let mut payload = Payload::new();
        payload.insert("channel".into(), json!("email"));
        let task = Task::new("notify", payload, "tasks").with_priority(TaskPriority::Critical);

        let value = serde_json::to_value(&task).expect("serialize");
        assert_eq!(value["priority"], "CRITICAL");
        assert_eq!(value["status"], "pending");

        let back: Task = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, task);
        assert_eq!(back.payload_str("channel"), Some("email"));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::DeadLettered.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
        assert_eq!(TaskStatus::DeadLettered.to_string(), "dead_lettered");
    }
}
