use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::Payload;

/// Lifecycle phase of a remediation case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseState {
    /// Case created, nothing has looked at it yet
    Pending,
    /// Gathering information about the incident
    Investigating,
    /// Checking a proposed remediation
    Validating,
    /// Applying the remediation
    Remediating,
    /// Remediation succeeded
    Resolved,
    /// Remediation could not be completed
    Failed,
    /// Abandoned by an operator or automation
    Cancelled,
}

impl CaseState {
    pub const ALL: [CaseState; 7] = [
        CaseState::Pending,
        CaseState::Investigating,
        CaseState::Validating,
        CaseState::Remediating,
        CaseState::Resolved,
        CaseState::Failed,
        CaseState::Cancelled,
    ];

    /// States reachable in one hop.
    pub fn valid_transitions(&self) -> &'static [CaseState] {
        match self {
            CaseState::Pending => &[CaseState::Investigating, CaseState::Cancelled],
            CaseState::Investigating => &[
                CaseState::Validating,
                CaseState::Failed,
                CaseState::Cancelled,
            ],
            CaseState::Validating => &[
                CaseState::Remediating,
                CaseState::Failed,
                CaseState::Cancelled,
            ],
            CaseState::Remediating => &[
                CaseState::Resolved,
                CaseState::Failed,
                CaseState::Cancelled,
            ],
            CaseState::Resolved | CaseState::Failed | CaseState::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, to: CaseState) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CaseState::Resolved | CaseState::Failed | CaseState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CaseState::Pending => "pending",
            CaseState::Investigating => "investigating",
            CaseState::Validating => "validating",
            CaseState::Remediating => "remediating",
            CaseState::Resolved => "resolved",
            CaseState::Failed => "failed",
            CaseState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaseState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CaseState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Invalid case state: {s}"))
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: CaseState,
    pub to: CaseState,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub metadata: Payload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_reaches_only_investigating_or_cancelled() {
        let reachable: Vec<CaseState> = CaseState::ALL
            .into_iter()
            .filter(|to| CaseState::Pending.can_transition_to(*to))
            .collect();
        assert_eq!(reachable, vec![CaseState::Investigating, CaseState::Cancelled]);
    }

    #[test]
    fn test_terminal_states_have_no_transitions() {
        for state in CaseState::ALL {
            assert_eq!(state.is_terminal(), state.valid_transitions().is_empty());
        }
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("REMEDIATING".parse::<CaseState>(), Ok(CaseState::Remediating));
        assert!("closed".parse::<CaseState>().is_err());
        assert_eq!(CaseState::Cancelled.to_string(), "cancelled");
    }
}
