use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::{Payload, TaskPriority};

/// A candidate remediation surfaced for an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposition {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Executor name; see [`ActionKind`].
    pub action_type: String,
    #[serde(default)]
    pub parameters: Payload,
    /// In `0.0..=1.0`.
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub estimated_impact: String,
    /// 1 is most urgent.
    #[serde(default = "default_rank")]
    pub priority: u32,
}

fn default_rank() -> u32 {
    3
}

impl Proposition {
    pub fn new(id: impl Into<String>, title: impl Into<String>, action_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            action_type: action_type.into(),
            parameters: Payload::new(),
            confidence_score: 0.0,
            estimated_impact: String::new(),
            priority: default_rank(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_confidence(mut self, score: f64) -> Self {
        self.confidence_score = score;
        self
    }

    pub fn with_parameters(mut self, parameters: Payload) -> Self {
        self.parameters = parameters;
        self
    }

    /// The executor for this proposition, if its action type is known.
    pub fn action_kind(&self) -> Option<ActionKind> {
        self.action_type.parse().ok()
    }

    pub fn task_priority(&self) -> TaskPriority {
        TaskPriority::from_rank(self.priority)
    }
}

/// Executors an accepted proposition can be dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    AutoFix,
    ManualReview,
    Escalate,
    Ignore,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::AutoFix => "auto_fix",
            ActionKind::ManualReview => "manual_review",
            ActionKind::Escalate => "escalate",
            ActionKind::Ignore => "ignore",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_fix" => Ok(ActionKind::AutoFix),
            "manual_review" => Ok(ActionKind::ManualReview),
            "escalate" => Ok(ActionKind::Escalate),
            "ignore" => Ok(ActionKind::Ignore),
            other => Err(format!("Unknown action type: {other}")),
        }
    }
}

/// What the operator did with a proposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserDecision {
    Accepted,
    Rejected,
    Ignored,
    Pending,
}

impl UserDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserDecision::Accepted => "accepted",
            UserDecision::Rejected => "rejected",
            UserDecision::Ignored => "ignored",
            UserDecision::Pending => "pending",
        }
    }
}

impl fmt::Display for UserDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accepted" | "accept" => Ok(UserDecision::Accepted),
            "rejected" | "reject" => Ok(UserDecision::Rejected),
            "ignored" | "ignore" => Ok(UserDecision::Ignored),
            "pending" => Ok(UserDecision::Pending),
            other => Err(format!("Unknown decision: {other}")),
        }
    }
}

/// One presented proposition and what became of it.
///
/// Entries are appended, never removed; the outcome fields are filled in
/// later by [`record_outcome`](super::OrchestrationEngine::record_outcome).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropositionLog {
    pub request_id: String,
    pub alert_id: String,
    pub proposition_id: String,
    pub action_type: String,
    pub presented_at: DateTime<Utc>,
    pub user_decision: UserDecision,
    pub decision_timestamp: Option<DateTime<Utc>>,
    pub feedback: Option<String>,
    pub outcome: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind_lookup() {
        let prop = Proposition::new("p", "Retry job", "auto_fix");
        assert_eq!(prop.action_kind(), Some(ActionKind::AutoFix));
        assert_eq!(Proposition::new("p", "t", "teleport").action_kind(), None);
    }

    #[test]
    fn test_priority_rank_mapping() {
        let prop = Proposition::new("p", "t", "auto_fix");
        assert_eq!(prop.clone().with_priority(1).task_priority(), TaskPriority::Critical);
        assert_eq!(prop.clone().with_priority(2).task_priority(), TaskPriority::High);
        assert_eq!(prop.clone().with_priority(3).task_priority(), TaskPriority::Normal);
        assert_eq!(prop.with_priority(9).task_priority(), TaskPriority::Low);
    }

    #[test]
    fn test_decision_serde() {
        assert_eq!(
            serde_json::to_string(&UserDecision::Accepted).expect("serializes"),
            "\"accepted\""
        );
        assert_eq!("REJECT".parse::<UserDecision>(), Ok(UserDecision::Rejected));
    }
}
