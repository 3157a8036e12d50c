//! Telemetry readings -- node kinds, feature sets, payload validation.
//!
//! A [`Reading`] is immutable once stored. Every feature value is either a
//! finite number or explicitly absent; the constructors here are the only
//! place values enter the system, so NaN and infinities never get further.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Ground station features, in the stable order used for model vectors.
pub const GROUND_FEATURES: &[&str] = &[
    "radiation_cpm",
    "pm25",
    "air_temp_c",
    "humidity",
    "pressure_hpa",
    "voc",
];

/// Water station features, in the stable order used for model vectors.
pub const WATER_FEATURES: &[&str] = &["tds", "ph", "turbidity", "water_temp_c"];

/// Suffix of the flag recorded on a reading when a disabled feature was
/// replaced by its fallback value.
pub const FORCED_FLAG_SUFFIX: &str = "_forced_normal";

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("invalid JSON body: {0}")]
    InvalidJson(String),

    #[error("body node_id {body} does not match signed node {header}")]
    NodeMismatch { header: String, body: String },

    #[error("missing fields for {node}: {}", .fields.join(", "))]
    MissingFields { node: String, fields: Vec<String> },

    #[error("field {0} must be a number or null")]
    NonNumeric(String),

    #[error("field {0} is not a finite number")]
    NonFinite(String),

    #[error("invalid reading timestamp: {0}")]
    InvalidTimestamp(String),
}

/// The two station families deployed in the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Ground,
    Water,
}

impl NodeKind {
    /// Infer the station kind from its identifier (`water_*` vs everything else).
    pub fn infer(node_id: &str) -> Self {
        if node_id.starts_with("water") {
            NodeKind::Water
        } else {
            NodeKind::Ground
        }
    }

    /// Feature names for this kind. The order is part of the contract with
    /// offline-trained outlier models and must not change.
    pub fn features(self) -> &'static [&'static str] {
        match self {
            NodeKind::Ground => GROUND_FEATURES,
            NodeKind::Water => WATER_FEATURES,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Ground => write!(f, "ground"),
            NodeKind::Water => write!(f, "water"),
        }
    }
}

/// One multi-sensor sample from a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Store-assigned insertion id; `None` until appended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, Option<f64>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub flags: BTreeSet<String>,
}

impl Reading {
    pub fn new(node_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: None,
            node_id: node_id.into(),
            timestamp,
            values: BTreeMap::new(),
            flags: BTreeSet::new(),
        }
    }

    /// Builder-style setter that rejects non-finite numbers.
    pub fn with_value(
        mut self,
        feature: &str,
        value: Option<f64>,
    ) -> Result<Self, ValidationError> {
        self.set_value(feature, value)?;
        Ok(self)
    }

    pub fn set_value(&mut self, feature: &str, value: Option<f64>) -> Result<(), ValidationError> {
        if let Some(v) = value {
            if !v.is_finite() {
                return Err(ValidationError::NonFinite(feature.to_string()));
            }
        }
        self.values.insert(feature.to_string(), value);
        Ok(())
    }

    pub fn value(&self, feature: &str) -> Option<f64> {
        self.values.get(feature).copied().flatten()
    }

    pub fn kind(&self) -> NodeKind {
        NodeKind::infer(&self.node_id)
    }

    /// Whether `feature` was replaced by a configured fallback value.
    pub fn is_forced(&self, feature: &str) -> bool {
        self.flags.contains(&forced_flag(feature))
    }

    /// Values in the kind's stable feature order; absent values become 0.0.
    pub fn feature_vector(&self, kind: NodeKind) -> Vec<f64> {
        kind.features()
            .iter()
            .map(|f| self.value(f).unwrap_or(0.0))
            .collect()
    }
}

pub fn forced_flag(feature: &str) -> String {
    format!("{feature}{FORCED_FLAG_SUFFIX}")
}

/// A feature that is disabled on one node and replaced by a fixed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureOverride {
    pub node: String,
    pub feature: String,
    pub fallback: f64,
}

/// Replace disabled features with their fallback and record the substitution
/// as a flag on the reading.
pub fn apply_overrides(reading: &mut Reading, overrides: &[FeatureOverride]) {
    for o in overrides.iter().filter(|o| o.node == reading.node_id) {
        if !o.fallback.is_finite() {
            continue;
        }
        debug!(node = %reading.node_id, feature = %o.feature, fallback = o.fallback, "feature forced to fallback");
        reading.values.insert(o.feature.clone(), Some(o.fallback));
        reading.flags.insert(forced_flag(&o.feature));
    }
}

/// Parse an ingest body into a [`Reading`] for `node_id`.
///
/// Every feature of the node's kind must be present as a number or an
/// explicit `null`. An optional `node_id` in the body must match, and an
/// optional RFC 3339 `ts` replaces `received_at`.
pub fn parse_payload(
    node_id: &str,
    body: &[u8],
    received_at: DateTime<Utc>,
) -> Result<Reading, ValidationError> {
    let obj: serde_json::Map<String, Value> =
        serde_json::from_slice(body).map_err(|e| ValidationError::InvalidJson(e.to_string()))?;

    match obj.get("node_id") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) if s == node_id => {}
        Some(other) => {
            return Err(ValidationError::NodeMismatch {
                header: node_id.to_string(),
                body: other.as_str().map(str::to_string).unwrap_or_else(|| other.to_string()),
            })
        }
    }

    let timestamp = match obj.get("ts") {
        None | Some(Value::Null) => received_at,
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map_err(|_| ValidationError::InvalidTimestamp(s.clone()))?
            .with_timezone(&Utc),
        Some(other) => return Err(ValidationError::InvalidTimestamp(other.to_string())),
    };

    let kind = NodeKind::infer(node_id);
    let missing: Vec<String> = kind
        .features()
        .iter()
        .filter(|f| !obj.contains_key(**f))
        .map(|f| f.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError::MissingFields {
            node: node_id.to_string(),
            fields: missing,
        });
    }

    let mut reading = Reading::new(node_id, timestamp);
    for feature in kind.features() {
        let value = match obj.get(*feature) {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(
                n.as_f64()
                    .ok_or_else(|| ValidationError::NonNumeric(feature.to_string()))?,
            ),
            _ => return Err(ValidationError::NonNumeric(feature.to_string())),
        };
        reading.set_value(feature, value)?;
    }
    Ok(reading)
}
