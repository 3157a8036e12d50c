//! Status engine: runs recompute passes over all nodes and owns the
//! process-wide status snapshot.
//!
//! Readers always get an `Arc` to a complete, immutable [`StatusSnapshot`].
//! A pass builds a fresh snapshot and swaps it in as a whole, so a reader
//! observes either the old or the new state, never a mix. Passes themselves
//! are serialized by a separate mutex so that the hysteresis state a pass
//! reads is the one the previous pass published.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info};

use crate::analysis::{OutlierModels, OutlierScorer};
use crate::config::StatusConfig;
use crate::detect::guardrail::Guardrails;
use crate::detect::hysteresis::{HysteresisMachine, Published};
use crate::detect::scorer::{self, FlaggedFeature, Methods, ScoreContext, DANGER_CONFIDENCE_FLOOR};
use crate::detect::Status;
use crate::telemetry::Reading;

/// Probability from which a ground node counts towards a regional anomaly.
const CORRELATION_PROBABILITY: f64 = 0.7;
const CORRELATION_BOOST: f64 = 0.1;
const CORRELATED_FEATURE: &str = "radiation_cpm";

/// Published status of one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub status: Status,
    pub abnormal_probability: f64,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub flagged_features: Vec<FlaggedFeature>,
    pub summary: String,
    pub methods: Methods,
    pub held_by_hysteresis: bool,
    /// Epoch since which `status` has been published unchanged.
    pub status_since: i64,
    pub computed_at: DateTime<Utc>,
    pub source_reading: Option<Reading>,
}

impl NodeStatus {
    /// Placeholder for a known node that has never reported.
    pub fn no_data(node_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: Status::Offline,
            abnormal_probability: 0.0,
            confidence: 0.0,
            reasons: vec![format!("No data received from {node_id} yet")],
            flagged_features: Vec::new(),
            summary: format!("{node_id} has not reported yet"),
            methods: Methods::default(),
            held_by_hysteresis: false,
            status_since: now.timestamp(),
            computed_at: now,
            source_reading: None,
        }
    }
}

/// Deployment-wide status derived from the per-node map of one pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverallStatus {
    pub status: Status,
    pub abnormal_probability: f64,
    pub confidence: f64,
    pub aggregate_score: f64,
    pub node_count: usize,
    pub reasons: Vec<String>,
    /// Ground nodes currently contributing to the radiation correlation.
    pub correlated_nodes: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

impl OverallStatus {
    fn no_data(now: DateTime<Utc>) -> Self {
        Self {
            status: Status::NoData,
            abnormal_probability: 0.0,
            confidence: 0.0,
            aggregate_score: 0.0,
            node_count: 0,
            reasons: vec!["No data received yet".to_string()],
            correlated_nodes: Vec::new(),
            computed_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub nodes: BTreeMap<String, NodeStatus>,
    pub overall: OverallStatus,
    pub computed_at_epoch: i64,
}

impl StatusSnapshot {
    pub fn empty() -> Self {
        Self {
            nodes: BTreeMap::new(),
            overall: OverallStatus::no_data(DateTime::<Utc>::UNIX_EPOCH),
            computed_at_epoch: 0,
        }
    }
}

/// Rows for one node, most recent last, and the features to evaluate.
#[derive(Debug, Clone)]
pub struct NodeHistory {
    pub node_id: String,
    pub rows: Vec<Reading>,
    pub features: Vec<String>,
}

impl NodeHistory {
    /// History evaluated on every feature of the node's kind.
    pub fn new(node_id: impl Into<String>, rows: Vec<Reading>) -> Self {
        let node_id = node_id.into();
        let features = crate::telemetry::NodeKind::infer(&node_id)
            .features()
            .iter()
            .map(|f| f.to_string())
            .collect();
        Self {
            node_id,
            rows,
            features,
        }
    }
}

/// A node as presented to readers: the cached hazard status plus the
/// independently derived connectivity state.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub node: NodeStatus,
    pub display_status: Status,
    pub offline: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offline_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub overall: OverallStatus,
    pub nodes: BTreeMap<String, NodeView>,
    pub offline_nodes: Vec<String>,
    pub computed_at_epoch: i64,
    pub last_reading_at: Option<DateTime<Utc>>,
}

pub struct StatusEngine {
    settings: StatusConfig,
    guardrails: Guardrails,
    models: OutlierModels,
    hysteresis: HysteresisMachine,
    snapshot: RwLock<Arc<StatusSnapshot>>,
    pass: Mutex<()>,
}

impl StatusEngine {
    pub fn new(settings: StatusConfig, models: OutlierModels) -> Self {
        Self {
            hysteresis: HysteresisMachine::new(settings.hysteresis_sec),
            settings,
            guardrails: Guardrails::default(),
            models,
            snapshot: RwLock::new(Arc::new(StatusSnapshot::empty())),
            pass: Mutex::new(()),
        }
    }

    pub fn with_guardrails(mut self, guardrails: Guardrails) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn settings(&self) -> &StatusConfig {
        &self.settings
    }

    /// The last published snapshot. Never blocks on a running pass.
    pub fn current_cache(&self) -> Arc<StatusSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Whether the cached snapshot is older than the recompute interval.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let age = now.timestamp() - self.snapshot.read().computed_at_epoch;
        age > i64::try_from(self.settings.recompute_interval_sec).unwrap_or(i64::MAX)
    }

    /// Evaluate one reading against the rows that preceded it, applying
    /// hysteresis against the published snapshot. The cache is not modified.
    pub fn compute_node(
        &self,
        node_id: &str,
        reading: &Reading,
        history: &[Reading],
        features: &[&str],
        now: DateTime<Utc>,
    ) -> NodeStatus {
        let previous = self.current_cache();
        self.evaluate(&previous, node_id, reading, history, features, now)
    }

    /// Run a full pass over `inputs` and publish the result.
    pub fn recompute(&self, inputs: &[NodeHistory], now: DateTime<Utc>) -> Arc<StatusSnapshot> {
        let _pass = self.pass.lock();
        self.recompute_locked(inputs, now)
    }

    /// Return the cached snapshot, recomputing first if it is stale. `load`
    /// is only called when a pass actually runs.
    pub fn refresh_if_stale<F>(&self, now: DateTime<Utc>, load: F) -> Result<Arc<StatusSnapshot>>
    where
        F: FnOnce() -> Result<Vec<NodeHistory>>,
    {
        if !self.is_stale(now) {
            return Ok(self.current_cache());
        }
        let _pass = self.pass.lock();
        // a concurrent caller may have finished a pass while we waited
        if !self.is_stale(now) {
            return Ok(self.current_cache());
        }
        let inputs = load()?;
        Ok(self.recompute_locked(&inputs, now))
    }

    fn recompute_locked(&self, inputs: &[NodeHistory], now: DateTime<Utc>) -> Arc<StatusSnapshot> {
        let previous = self.current_cache();
        let mut nodes = BTreeMap::new();
        for input in inputs {
            let status = match input.rows.split_last() {
                None => NodeStatus::no_data(&input.node_id, now),
                Some((latest, prior)) => {
                    let features: Vec<&str> = input.features.iter().map(String::as_str).collect();
                    self.evaluate(&previous, &input.node_id, latest, prior, &features, now)
                }
            };
            nodes.insert(input.node_id.clone(), status);
        }

        let overall = self.aggregate(&nodes, now);
        info!(
            nodes = nodes.len(),
            overall = %overall.status,
            score = overall.aggregate_score,
            "status recomputed"
        );

        let snapshot = Arc::new(StatusSnapshot {
            nodes,
            overall,
            computed_at_epoch: now.timestamp(),
        });
        *self.snapshot.write() = Arc::clone(&snapshot);
        snapshot
    }

    fn evaluate(
        &self,
        previous: &StatusSnapshot,
        node_id: &str,
        reading: &Reading,
        history: &[Reading],
        features: &[&str],
        now: DateTime<Utc>,
    ) -> NodeStatus {
        let active: Vec<&str> = features
            .iter()
            .copied()
            .filter(|f| !reading.is_forced(f))
            .collect();
        let outlier: Option<&dyn OutlierScorer> = self.models.get(reading.kind()).map(|s| &**s);
        let ctx = ScoreContext {
            guardrails: &self.guardrails,
            outlier,
            strategy: self.settings.strategy,
        };
        let assessment = scorer::assess(&ctx, node_id, reading, history, &active);

        let published = previous.nodes.get(node_id).map(|n| Published {
            status: n.status,
            since_epoch: n.status_since,
        });
        let transition = self.hysteresis.decide(
            node_id,
            published,
            assessment.status,
            now.timestamp(),
            assessment.bypass_hysteresis,
        );

        let mut reasons = assessment.reasons;
        if transition.held {
            reasons.push(format!(
                "Holding {} (computed {}) within hysteresis window",
                transition.status, assessment.status
            ));
        }
        let mut confidence = assessment.confidence;
        if transition.status == Status::Danger {
            confidence = confidence.max(DANGER_CONFIDENCE_FLOOR);
        }
        debug!(
            node = node_id,
            status = %transition.status,
            p = assessment.abnormal_probability,
            confidence,
            "node evaluated"
        );

        NodeStatus {
            node_id: node_id.to_string(),
            status: transition.status,
            abnormal_probability: assessment.abnormal_probability,
            confidence,
            summary: format!("{node_id}: {}", reasons[0]),
            reasons,
            flagged_features: assessment.flagged_features,
            methods: assessment.methods,
            held_by_hysteresis: transition.held,
            status_since: transition.since_epoch,
            computed_at: now,
            source_reading: Some(reading.clone()),
        }
    }

    /// Weighted-average aggregate over the nodes of one pass, with the
    /// regional radiation signal layered on top.
    fn aggregate(&self, nodes: &BTreeMap<String, NodeStatus>, now: DateTime<Utc>) -> OverallStatus {
        if nodes.is_empty() {
            return OverallStatus::no_data(now);
        }
        let n = nodes.len() as f64;
        let score = nodes.values().map(|s| s.status.aggregate_weight()).sum::<f64>() / n;
        let confidence = nodes.values().map(|s| s.confidence).sum::<f64>() / n;

        let mut reasons = vec![format!(
            "Aggregate risk score {score:.2} from {} nodes",
            nodes.len()
        )];
        for node in nodes.values().filter(|s| s.status.is_alerting()) {
            reasons.push(format!("{} {}: {}", node.node_id, node.status, node.reasons[0]));
        }

        let mut probability = score;
        let hot = self.correlated_nodes(nodes, now);
        match hot.as_slice() {
            [] => {}
            [single] => reasons.push(format!("Localized anomaly near {single}")),
            many => {
                reasons.push(regional_reason(many));
                probability = (probability + CORRELATION_BOOST).min(1.0);
            }
        }

        OverallStatus {
            status: Status::from_probability(probability, false, false),
            abnormal_probability: probability,
            confidence: confidence.clamp(0.0, 1.0),
            aggregate_score: score,
            node_count: nodes.len(),
            reasons,
            correlated_nodes: hot,
            computed_at: now,
        }
    }

    /// Ground nodes with a recent, high-probability radiation signal.
    fn correlated_nodes(&self, nodes: &BTreeMap<String, NodeStatus>, now: DateTime<Utc>) -> Vec<String> {
        let window = Duration::seconds(
            i64::try_from(self.settings.correlation_window_sec).unwrap_or(i64::MAX / 1000),
        );
        nodes
            .values()
            .filter(|s| {
                s.source_reading.as_ref().is_some_and(|r| {
                    r.kind() == crate::telemetry::NodeKind::Ground && r.timestamp >= now - window
                })
            })
            .filter(|s| s.abnormal_probability >= CORRELATION_PROBABILITY)
            .filter(|s| s.flagged_features.iter().any(|f| f.feature() == CORRELATED_FEATURE))
            .map(|s| s.node_id.clone())
            .collect()
    }

    /// Presentation view of the cached snapshot at `now`.
    ///
    /// Nodes whose last reading is older than the offline window are shown
    /// as Offline; the cached hazard status underneath is left untouched.
    /// Known nodes missing from the snapshot appear as never reported.
    pub fn view(&self, now: DateTime<Utc>, known_nodes: &[String]) -> StatusView {
        let snapshot = self.current_cache();
        let offline_after = i64::try_from(self.settings.offline_after_sec).unwrap_or(i64::MAX);

        let mut nodes: BTreeMap<String, NodeView> = BTreeMap::new();
        for node in snapshot.nodes.values() {
            let offline_reason = match &node.source_reading {
                None => Some(node.reasons[0].clone()),
                Some(r) if (now - r.timestamp).num_seconds() > offline_after => Some(format!(
                    "No data received from {} in the last {}s",
                    node.node_id, offline_after
                )),
                Some(_) => None,
            };
            nodes.insert(node.node_id.clone(), present(node.clone(), offline_reason));
        }
        for id in known_nodes {
            if !nodes.contains_key(id) {
                let node = NodeStatus::no_data(id, now);
                let reason = Some(node.reasons[0].clone());
                nodes.insert(id.clone(), present(node, reason));
            }
        }

        let offline_nodes: Vec<String> = nodes
            .values()
            .filter(|v| v.offline)
            .map(|v| v.node.node_id.clone())
            .collect();
        let mut overall = snapshot.overall.clone();
        if !offline_nodes.is_empty() {
            overall.reasons.push("One or more nodes offline".to_string());
        }
        let last_reading_at = nodes
            .values()
            .filter_map(|v| v.node.source_reading.as_ref().map(|r| r.timestamp))
            .max();

        StatusView {
            overall,
            nodes,
            offline_nodes,
            computed_at_epoch: snapshot.computed_at_epoch,
            last_reading_at,
        }
    }
}

pub(crate) fn regional_reason(nodes: &[String]) -> String {
    format!("Regional radiation anomaly across {}", nodes.join(", "))
}

fn present(node: NodeStatus, offline_reason: Option<String>) -> NodeView {
    NodeView {
        display_status: if offline_reason.is_some() {
            Status::Offline
        } else {
            node.status
        },
        offline: offline_reason.is_some(),
        offline_reason,
        node,
    }
}
