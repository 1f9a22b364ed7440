//! Shared deterministic types for the reliability layer.
//!
//! These records flow from phase execution through the validator, detector,
//! memory store and termination controller into step telemetry. They are
//! serialized into audit artifacts and must stay stable.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::repetition::{CycleInfo, Remediation};
use crate::core::termination::TerminationDecision;

/// Kind of a configured phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseType {
    Simple,
    Composed,
}

impl fmt::Display for PhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Composed => write!(f, "composed"),
        }
    }
}

/// One role-tagged action produced during a phase step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub role: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub phase_type: PhaseType,
}

/// A single reliability decision recorded during a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "module", rename_all = "snake_case")]
pub enum Decision {
    RoleValidator {
        role: String,
        ok: bool,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        guidance: Option<String>,
    },
    Memory {
        role: String,
        persisted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    CycleDetector {
        role: String,
        cycle: CycleInfo,
        remediation: Remediation,
    },
    Termination {
        decision: TerminationDecision,
    },
}

impl Decision {
    pub fn module(&self) -> &'static str {
        match self {
            Self::RoleValidator { .. } => "role_validator",
            Self::Memory { .. } => "memory",
            Self::CycleDetector { .. } => "cycle_detector",
            Self::Termination { .. } => "termination",
        }
    }

    pub fn role(&self) -> Option<&str> {
        match self {
            Self::RoleValidator { role, .. }
            | Self::Memory { role, .. }
            | Self::CycleDetector { role, .. } => Some(role),
            Self::Termination { .. } => None,
        }
    }
}

/// Structured record of one orchestrator step.
///
/// Created fresh per step and never mutated after the step completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTelemetry {
    pub phase: String,
    pub phase_type: PhaseType,
    pub timestamp: DateTime<Utc>,
    /// Accepted actions, in agent order.
    pub actions: Vec<ActionRecord>,
    pub decisions: Vec<Decision>,
    pub terminated: bool,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepTelemetry {
    pub fn new(phase: &str, phase_type: PhaseType, timestamp: DateTime<Utc>) -> Self {
        Self {
            phase: phase.to_string(),
            phase_type,
            timestamp,
            actions: Vec::new(),
            decisions: Vec::new(),
            terminated: false,
            elapsed_ms: 0,
            error: None,
        }
    }

    /// Termination decision recorded for this step, if the controller ran.
    pub fn termination(&self) -> Option<&TerminationDecision> {
        self.decisions.iter().find_map(|decision| match decision {
            Decision::Termination { decision } => Some(decision),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_serializes_with_module_tag() {
        let decision = Decision::RoleValidator {
            role: "Coder".to_string(),
            ok: false,
            reason: "forbidden_pattern:deploy".to_string(),
            guidance: None,
        };
        let json = serde_json::to_value(&decision).expect("serialize");
        assert_eq!(json["module"], "role_validator");
        assert_eq!(json["ok"], false);
        assert!(json.get("guidance").is_none());
        assert_eq!(decision.role(), Some("Coder"));
    }

    #[test]
    fn phase_type_uses_lowercase_names() {
        let json = serde_json::to_string(&PhaseType::Composed).expect("serialize");
        assert_eq!(json, "\"composed\"");
        assert_eq!(PhaseType::Simple.to_string(), "simple");
    }
}
