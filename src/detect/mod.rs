//! Hazard detection: guardrails, anomaly scoring, hysteresis and the status cache.

pub mod engine;
pub mod events;
pub mod guardrail;
pub mod hysteresis;
pub mod scorer;

use serde::{Deserialize, Serialize};

pub use engine::{
    NodeHistory, NodeStatus, NodeView, OverallStatus, StatusEngine, StatusSnapshot, StatusView,
};
pub use events::{AlertEvent, EventKind, EventTracker};
pub use guardrail::{GuardrailFlag, GuardrailReport, Guardrails};
pub use hysteresis::HysteresisMachine;
pub use scorer::{Assessment, Strategy};

/// Probability at or above which a status is Danger.
pub const DANGER_PROBABILITY: f64 = 0.7;

/// Probability at or above which a status is Warning.
pub const WARNING_PROBABILITY: f64 = 0.35;

/// Hazard status of a node or of the whole deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Safe,
    /// Unusual but not yet actionable.
    Abnormal,
    Warning,
    Danger,
    /// No usable data from the node.
    Offline,
    /// Aggregate only: no node has reported yet.
    NoData,
}

impl Status {
    /// Map a probability to a status, honouring forced classifications.
    pub fn from_probability(p: f64, warning_forced: bool, danger_forced: bool) -> Self {
        if danger_forced || p >= DANGER_PROBABILITY {
            Status::Danger
        } else if warning_forced || p >= WARNING_PROBABILITY {
            Status::Warning
        } else {
            Status::Safe
        }
    }

    /// Weight of this status in the deployment-wide risk average.
    pub fn aggregate_weight(self) -> f64 {
        match self {
            Status::Danger => 1.0,
            Status::Warning => 0.7,
            Status::Offline => 0.6,
            Status::Abnormal => 0.5,
            Status::Safe | Status::NoData => 0.2,
        }
    }

    /// Warning or Danger.
    pub fn is_alerting(self) -> bool {
        matches!(self, Status::Warning | Status::Danger)
    }

    /// Hazard ordering among Safe < Abnormal < Warning < Danger.
    pub fn severity_rank(self) -> u8 {
        match self {
            Status::Safe | Status::NoData | Status::Offline => 0,
            Status::Abnormal => 1,
            Status::Warning => 2,
            Status::Danger => 3,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Severity of a guardrail hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Danger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    High,
    Low,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probability_mapping() {
        assert_eq!(Status::from_probability(0.1, false, false), Status::Safe);
        assert_eq!(Status::from_probability(0.35, false, false), Status::Warning);
        assert_eq!(Status::from_probability(0.69, false, false), Status::Warning);
        assert_eq!(Status::from_probability(0.7, false, false), Status::Danger);
        assert_eq!(Status::from_probability(0.0, true, false), Status::Warning);
        assert_eq!(Status::from_probability(0.0, true, true), Status::Danger);
    }

    #[test]
    fn test_status_serializes_by_name() {
        assert_eq!(serde_json::to_string(&Status::Abnormal).unwrap(), "\"Abnormal\"");
        assert_eq!(serde_json::to_string(&Severity::Danger).unwrap(), "\"danger\"");
    }
}
