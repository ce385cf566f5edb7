use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::Payload;

/// Kind of incident an alert reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    CiFailure,
    SpamIncident,
    ScamIncident,
    SecurityAlert,
    ComplianceViolation,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::CiFailure => "ci_failure",
            AlertType::SpamIncident => "spam_incident",
            AlertType::ScamIncident => "scam_incident",
            AlertType::SecurityAlert => "security_alert",
            AlertType::ComplianceViolation => "compliance_violation",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "ci_failure" => Ok(AlertType::CiFailure),
            "spam_incident" => Ok(AlertType::SpamIncident),
            "scam_incident" => Ok(AlertType::ScamIncident),
            "security_alert" => Ok(AlertType::SecurityAlert),
            "compliance_violation" => Ok(AlertType::ComplianceViolation),
            other => Err(format!("Unknown alert type: {other}")),
        }
    }
}

/// An inbound incident. Its id doubles as the case id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    #[serde(alias = "type")]
    pub alert_type: AlertType,
    pub description: String,
    #[serde(default = "default_severity")]
    pub severity: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub metadata: Payload,
}

fn default_severity() -> String {
    "medium".to_string()
}

impl Alert {
    pub fn new(id: impl Into<String>, alert_type: AlertType, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            alert_type,
            description: description.into(),
            severity: default_severity(),
            timestamp: Utc::now(),
            source: String::new(),
            metadata: Payload::new(),
        }
    }

    pub fn with_severity(mut self, severity: impl Into<String>) -> Self {
        self.severity = severity.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }
}
