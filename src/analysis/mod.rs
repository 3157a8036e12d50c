//! Statistical feature extraction and optional model-based outlier scoring.

pub mod features;
pub mod model;
pub mod stats;

pub use features::{extract, FeatureDeviation, FeatureReport};
pub use model::{LinearOutlierModel, OutlierModels, OutlierScorer, ScorerError};
