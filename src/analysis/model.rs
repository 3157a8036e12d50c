//! Pluggable outlier scoring backed by an offline-trained artifact.
//!
//! The engine never depends on a model being present: a missing artifact
//! means no scorer, and a failing scorer contributes nothing.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::telemetry::NodeKind;

#[derive(Debug, Error)]
pub enum ScorerError {
    #[error("feature vector length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("scorer produced a non-finite score")]
    NonFinite,

    #[error("scorer unavailable: {0}")]
    Unavailable(String),
}

/// Capability interface for an external abnormality estimate.
///
/// Implementations receive the node kind's feature vector in
/// [`NodeKind::features`] order and return a probability in `[0, 1]`.
/// They are called inline on the scoring path and must be fast local
/// computations.
pub trait OutlierScorer: Send + Sync {
    fn score(&self, vector: &[f64]) -> Result<f64, ScorerError>;
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Linear outlier model: standardized absolute deviations, weighted and
/// squashed through a sigmoid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearOutlierModel {
    pub feature_names: Vec<String>,
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl LinearOutlierModel {
    /// Load a model artifact from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model file: {}", path.display()))?;
        let model: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse model file: {}", path.display()))?;
        let n = model.feature_names.len();
        if model.means.len() != n || model.stds.len() != n || model.weights.len() != n {
            anyhow::bail!(
                "model {} is inconsistent: {} features but {}/{}/{} means/stds/weights",
                path.display(),
                n,
                model.means.len(),
                model.stds.len(),
                model.weights.len()
            );
        }
        Ok(model)
    }

    /// Whether the artifact was trained on `kind`'s feature ordering.
    pub fn matches(&self, kind: NodeKind) -> bool {
        self.feature_names.iter().map(String::as_str).eq(kind.features().iter().copied())
    }
}

impl OutlierScorer for LinearOutlierModel {
    fn score(&self, vector: &[f64]) -> Result<f64, ScorerError> {
        if vector.len() != self.means.len() {
            return Err(ScorerError::LengthMismatch {
                expected: self.means.len(),
                got: vector.len(),
            });
        }
        let mut logit = self.bias;
        for (i, &x) in vector.iter().enumerate() {
            let std = if self.stds[i] > 0.0 { self.stds[i] } else { 1.0 };
            logit += self.weights[i] * ((x - self.means[i]) / std).abs();
        }
        let p = sigmoid(logit);
        if !p.is_finite() {
            return Err(ScorerError::NonFinite);
        }
        Ok(p)
    }
}

/// Optional scorer per node kind.
#[derive(Clone, Default)]
pub struct OutlierModels {
    ground: Option<Arc<dyn OutlierScorer>>,
    water: Option<Arc<dyn OutlierScorer>>,
}

impl OutlierModels {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: NodeKind, scorer: Arc<dyn OutlierScorer>) -> Self {
        match kind {
            NodeKind::Ground => self.ground = Some(scorer),
            NodeKind::Water => self.water = Some(scorer),
        }
        self
    }

    pub fn get(&self, kind: NodeKind) -> Option<&Arc<dyn OutlierScorer>> {
        match kind {
            NodeKind::Ground => self.ground.as_ref(),
            NodeKind::Water => self.water.as_ref(),
        }
    }

    /// Load whichever artifacts are configured. Missing or unreadable files
    /// leave that kind without a scorer.
    pub fn load(ground: Option<&Path>, water: Option<&Path>) -> Self {
        let mut models = Self::none();
        for (kind, path) in [(NodeKind::Ground, ground), (NodeKind::Water, water)] {
            let Some(path) = path else { continue };
            match LinearOutlierModel::load(path) {
                Ok(model) if model.matches(kind) => {
                    info!(%kind, path = %path.display(), "loaded outlier model");
                    models = models.with(kind, Arc::new(model));
                }
                Ok(_) => {
                    warn!(%kind, path = %path.display(), "outlier model feature order does not match, ignoring");
                }
                Err(e) => {
                    warn!(%kind, error = %e, "outlier model unavailable, scoring without it");
                }
            }
        }
        models
    }
}

impl std::fmt::Debug for OutlierModels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutlierModels")
            .field("ground", &self.ground.is_some())
            .field("water", &self.water.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn water_model() -> LinearOutlierModel {
        LinearOutlierModel {
            feature_names: NodeKind::Water.features().iter().map(|s| s.to_string()).collect(),
            means: vec![400.0, 7.2, 5.0, 15.0],
            stds: vec![50.0, 0.2, 2.0, 3.0],
            weights: vec![1.0, 1.0, 1.0, 1.0],
            bias: -4.0,
        }
    }

    #[test]
    fn test_typical_vector_scores_low() {
        let p = water_model().score(&[400.0, 7.2, 5.0, 15.0]).unwrap();
        assert!(p < 0.05);
    }

    #[test]
    fn test_outlying_vector_scores_high() {
        let p = water_model().score(&[1400.0, 7.2, 5.0, 15.0]).unwrap();
        assert!(p > 0.99);
    }

    #[test]
    fn test_length_mismatch() {
        let err = water_model().score(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, ScorerError::LengthMismatch { expected: 4, got: 2 }));
    }

    #[test]
    fn test_missing_artifact_means_no_scorer() {
        let models = OutlierModels::load(Some(Path::new("/nonexistent/ground.json")), None);
        assert!(models.get(NodeKind::Ground).is_none());
        assert!(models.get(NodeKind::Water).is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("water.json");
        std::fs::write(&path, serde_json::to_string(&water_model()).unwrap()).unwrap();

        let models = OutlierModels::load(None, Some(&path));
        assert!(models.get(NodeKind::Water).is_some());
        // trained on water ordering, so not accepted for ground
        let models = OutlierModels::load(Some(&path), None);
        assert!(models.get(NodeKind::Ground).is_none());
    }
}
