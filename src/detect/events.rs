//! Alert event log: transitions worth remembering after the status has moved on.
//!
//! The tracker compares each presented [`StatusView`] with the last one it
//! saw and emits an event only when something changes: a node starts (or
//! escalates) alerting, a node that had reported goes silent, or a new set of
//! ground nodes shows a regional radiation anomaly. Repeated polls of an
//! unchanged status produce nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::detect::engine::regional_reason;
use crate::detect::{Status, StatusView};

/// Node id recorded on deployment-wide events.
pub const ALL_NODES: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A node entered or escalated within Warning/Danger.
    Anomaly,
    /// A node that had reported stopped reporting.
    Offline,
    /// Several ground nodes show high radiation at once.
    Correlation,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Anomaly => "anomaly",
            EventKind::Offline => "offline",
            EventKind::Correlation => "correlation",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown event {field}: {value}")]
pub struct ParseEventError {
    field: &'static str,
    value: String,
}

impl FromStr for EventKind {
    type Err = ParseEventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anomaly" => Ok(EventKind::Anomaly),
            "offline" => Ok(EventKind::Offline),
            "correlation" => Ok(EventKind::Correlation),
            other => Err(ParseEventError {
                field: "kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Parse an event level as written by [`Status`]'s `Display`.
pub fn parse_level(s: &str) -> Result<Status, ParseEventError> {
    match s {
        "Warning" => Ok(Status::Warning),
        "Danger" => Ok(Status::Danger),
        other => Err(ParseEventError {
            field: "level",
            value: other.to_string(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    /// Store-assigned id; `None` until persisted.
    pub id: Option<i64>,
    pub ts: DateTime<Utc>,
    /// Warning or Danger.
    pub level: Status,
    pub node_id: String,
    pub kind: EventKind,
    pub message: String,
    pub abnormal_probability: f64,
}

#[derive(Debug, Default)]
struct Observed {
    alerting: BTreeMap<String, Status>,
    offline: BTreeSet<String>,
    regional: Vec<String>,
}

/// Remembers what the last observed view looked like.
#[derive(Debug, Default)]
pub struct EventTracker {
    last: Mutex<Observed>,
}

impl EventTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare `view` with the previous one and return the new events.
    ///
    /// Concurrent callers are serialized, so the same transition is reported
    /// once however many readers poll the status.
    pub fn observe(&self, view: &StatusView, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let mut last = self.last.lock();
        let mut events = Vec::new();

        for (id, node) in &view.nodes {
            if node.offline {
                last.alerting.remove(id);
                // a node that never reported has nothing to go silent from
                if node.node.source_reading.is_some() && last.offline.insert(id.clone()) {
                    events.push(AlertEvent {
                        id: None,
                        ts: now,
                        level: Status::Warning,
                        node_id: id.clone(),
                        kind: EventKind::Offline,
                        message: node.offline_reason.clone().unwrap_or_default(),
                        abnormal_probability: node.node.abnormal_probability,
                    });
                }
                continue;
            }
            last.offline.remove(id);

            let status = node.node.status;
            if !status.is_alerting() {
                last.alerting.remove(id);
                continue;
            }
            let escalated = last
                .alerting
                .get(id)
                .map_or(true, |prev| status.severity_rank() > prev.severity_rank());
            last.alerting.insert(id.clone(), status);
            if escalated {
                events.push(AlertEvent {
                    id: None,
                    ts: now,
                    level: status,
                    node_id: id.clone(),
                    kind: EventKind::Anomaly,
                    message: node.node.reasons[..node.node.reasons.len().min(2)].join("; "),
                    abnormal_probability: node.node.abnormal_probability,
                });
            }
        }
        last.alerting.retain(|id, _| view.nodes.contains_key(id));

        let hot = &view.overall.correlated_nodes;
        if hot.len() >= 2 {
            if *hot != last.regional {
                events.push(AlertEvent {
                    id: None,
                    ts: now,
                    level: Status::Warning,
                    node_id: ALL_NODES.to_string(),
                    kind: EventKind::Correlation,
                    message: regional_reason(hot),
                    abnormal_probability: view.overall.abnormal_probability,
                });
                last.regional = hot.clone();
            }
        } else {
            last.regional.clear();
        }

        for e in &events {
            info!(node = %e.node_id, kind = %e.kind, level = %e.level, "alert event");
        }
        events
    }
}
