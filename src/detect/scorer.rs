//! Anomaly scorer: fuses robust deviations, guardrails and an optional
//! outlier model into one abnormal probability, a confidence and a status.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::analysis::features::{extract, FeatureReport, ABNORMAL_Z};
use crate::analysis::stats::TimeSeries;
use crate::analysis::OutlierScorer;
use crate::detect::guardrail::{GuardrailFlag, GuardrailReport, Guardrails, JumpFlag};
use crate::detect::{Direction, Status};
use crate::telemetry::Reading;

/// History length at which the baseline is considered complete.
pub const FULL_HISTORY: usize = 200;

/// Below this many rows confidence is capped at [`SHORT_HISTORY_CONFIDENCE`].
pub const SHORT_HISTORY: usize = 30;
pub const SHORT_HISTORY_CONFIDENCE: f64 = 0.4;

/// Danger is never reported below this confidence.
pub const DANGER_CONFIDENCE_FLOOR: f64 = 0.6;

/// Trailing rows used to judge how stable the raw signal is.
pub const STABILITY_WINDOW: usize = 50;

/// |z| that bypasses hysteresis.
pub const OVERRIDE_Z: f64 = 4.0;

/// |z| from which a deviation is reported.
pub const REPORT_Z: f64 = 2.0;

const JUMP_DANGER_BOOST: f64 = 0.85;
const JUMP_WARNING_BOOST: f64 = 0.5;

/// Environmental features whose extremes alone are treated as unusual
/// rather than hazardous by the tiered strategy.
const BENIGN_FEATURES: &[&str] = &["air_temp_c", "pressure_hpa", "humidity"];

/// How the statistical layer is turned into a status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Sigmoid over max |z| mapped through the probability thresholds.
    #[default]
    Probabilistic,
    /// Fixed |z| tiers, including the intermediate Abnormal tier.
    Tiered,
}

/// Which signals contributed to an assessment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Methods {
    pub guardrails: bool,
    pub rolling_baseline: bool,
    pub outlier_model: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlaggedFeature {
    Threshold(GuardrailFlag),
    Jump(JumpFlag),
    Deviation {
        feature: String,
        z_score: f64,
        direction: Direction,
        value: Option<f64>,
    },
}

impl FlaggedFeature {
    pub fn feature(&self) -> &str {
        match self {
            FlaggedFeature::Threshold(f) => &f.feature,
            FlaggedFeature::Jump(j) => &j.feature,
            FlaggedFeature::Deviation { feature, .. } => feature,
        }
    }
}

/// Everything the scorer concluded about one reading.
#[derive(Debug, Clone, Serialize)]
pub struct Assessment {
    pub status: Status,
    pub abnormal_probability: f64,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub flagged_features: Vec<FlaggedFeature>,
    pub methods: Methods,
    pub max_abs_z: f64,
    /// A guardrail fired or |z| reached [`OVERRIDE_Z`]; hysteresis must not hold.
    pub bypass_hysteresis: bool,
    #[serde(skip)]
    pub features: FeatureReport,
}

/// Inputs for one scoring call.
pub struct ScoreContext<'a> {
    pub guardrails: &'a Guardrails,
    pub outlier: Option<&'a dyn OutlierScorer>,
    pub strategy: Strategy,
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Score `reading` for `node_id` against the rows that preceded it.
pub fn assess(
    ctx: &ScoreContext<'_>,
    node_id: &str,
    reading: &Reading,
    history: &[Reading],
    features: &[&str],
) -> Assessment {
    let kind = reading.kind();
    let report = extract(reading, history, features);
    let guard = ctx.guardrails.check(kind, reading, history.last(), features);
    let max_abs_z = report.max_abs_z();

    let external = ctx.outlier.and_then(|scorer| {
        match scorer.score(&reading.feature_vector(kind)) {
            Ok(p) if p.is_finite() => Some(p.clamp(0.0, 1.0)),
            Ok(p) => {
                warn!(node = node_id, score = p, "outlier model returned a non-finite score");
                None
            }
            Err(e) => {
                warn!(node = node_id, error = %e, "outlier model failed, ignoring");
                None
            }
        }
    });

    let jump_boost = if guard.jump_danger {
        JUMP_DANGER_BOOST
    } else if guard.jump_warning {
        JUMP_WARNING_BOOST
    } else {
        0.0
    };

    let baseline = sigmoid((max_abs_z - 2.0) * 1.4);
    let mut probability = baseline.max(external.unwrap_or(0.0)).max(jump_boost);

    let abnormal_count = abnormal_features(&report, &guard).len();
    if abnormal_count >= 3 {
        probability += 0.25;
    } else if abnormal_count == 2 {
        probability += 0.15;
    }
    probability = probability.min(1.0);

    let warning_forced = guard.any_warning();
    let danger_forced = guard.danger || guard.jump_danger;
    if warning_forced {
        probability = probability.max(0.5);
    }
    if guard.jump_danger {
        probability = probability.max(0.8);
    }
    if guard.danger {
        probability = probability.max(0.99);
    }

    let status = match ctx.strategy {
        Strategy::Probabilistic => {
            Status::from_probability(probability, warning_forced, danger_forced)
        }
        Strategy::Tiered => {
            let forced = Status::from_probability(0.0, warning_forced, danger_forced);
            let tier = tiered_status(&report);
            if forced.severity_rank() > tier.severity_rank() {
                forced
            } else {
                tier
            }
        }
    };

    let mut confidence =
        (history_factor(history.len()) * stability_factor(history, features)).clamp(0.05, 1.0);
    if history.len() < SHORT_HISTORY {
        confidence = confidence.min(SHORT_HISTORY_CONFIDENCE);
    }
    if status == Status::Danger {
        confidence = confidence.max(DANGER_CONFIDENCE_FLOOR);
    }

    let top: Vec<_> = report
        .ranked()
        .into_iter()
        .take(3)
        .filter(|d| d.z_score.abs() >= REPORT_Z)
        .collect();

    let mut reasons = Vec::new();
    reasons.extend(guard.threshold_reasons.iter().cloned());
    reasons.extend(guard.jump_reasons.iter().cloned());
    for d in &top {
        reasons.push(format!(
            "{} {} vs baseline (z={:.2})",
            d.feature,
            if d.z_score >= 0.0 { "high" } else { "low" },
            d.z_score
        ));
    }
    if abnormal_count >= 2 {
        reasons.push(format!("Multiple sensors abnormal on {node_id}"));
    }
    if reasons.is_empty() {
        reasons.push("within expected range".to_string());
    }

    let mut flagged_features: Vec<FlaggedFeature> = guard
        .flags
        .iter()
        .cloned()
        .map(FlaggedFeature::Threshold)
        .collect();
    flagged_features.extend(guard.jumps.iter().cloned().map(FlaggedFeature::Jump));
    flagged_features.extend(top.iter().map(|d| FlaggedFeature::Deviation {
        feature: d.feature.clone(),
        z_score: d.z_score,
        direction: if d.z_score >= 0.0 {
            Direction::High
        } else {
            Direction::Low
        },
        value: reading.value(&d.feature),
    }));

    let methods = Methods {
        guardrails: guard.any_hit(),
        rolling_baseline: report.deviations.iter().any(|d| d.evaluable),
        outlier_model: external.is_some(),
    };

    Assessment {
        status,
        abnormal_probability: probability.clamp(0.0, 1.0),
        confidence,
        reasons,
        flagged_features,
        methods,
        max_abs_z,
        bypass_hysteresis: guard.any_hit() || max_abs_z >= OVERRIDE_Z,
        features: report,
    }
}

/// Features that are abnormal by deviation (|z| >= 2.5) or by any guardrail
/// bound, counted once each.
fn abnormal_features<'a>(report: &'a FeatureReport, guard: &'a GuardrailReport) -> BTreeSet<&'a str> {
    report
        .deviations
        .iter()
        .filter(|d| d.z_score.abs() >= ABNORMAL_Z)
        .map(|d| d.feature.as_str())
        .chain(guard.flags.iter().map(|f| f.feature.as_str()))
        .collect()
}

fn tiered_status(report: &FeatureReport) -> Status {
    let Some(extreme) = report.ranked().into_iter().next() else {
        return Status::Safe;
    };
    let z = extreme.z_score.abs();
    if z >= OVERRIDE_Z {
        if BENIGN_FEATURES.contains(&extreme.feature.as_str()) {
            Status::Abnormal
        } else {
            Status::Danger
        }
    } else if z >= 3.0 {
        Status::Warning
    } else if z >= ABNORMAL_Z {
        Status::Abnormal
    } else {
        Status::Safe
    }
}

fn history_factor(len: usize) -> f64 {
    (len as f64 / FULL_HISTORY as f64).min(1.0)
}

/// 1.0 for a steady signal, falling linearly to 0.3 as the mean coefficient
/// of variation over the trailing window goes from 0.05 to 0.5.
pub fn stability_factor(history: &[Reading], features: &[&str]) -> f64 {
    let window = &history[history.len().saturating_sub(STABILITY_WINDOW)..];
    let cvs: Vec<f64> = features
        .iter()
        .filter_map(|feature| {
            let values: Vec<f64> = window.iter().filter_map(|r| r.value(feature)).collect();
            if values.len() < 5 {
                return None;
            }
            TimeSeries::new(values).coefficient_of_variation()
        })
        .collect();
    if cvs.is_empty() {
        return 1.0;
    }
    let cv = cvs.iter().sum::<f64>() / cvs.len() as f64;
    if cv < 0.05 {
        1.0
    } else if cv > 0.5 {
        0.3
    } else {
        1.0 - (cv - 0.05) / 0.45 * 0.7
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ScorerError;
    use chrono::{Duration, Utc};

    struct Fixed(Result<f64, ()>);

    impl OutlierScorer for Fixed {
        fn score(&self, _vector: &[f64]) -> Result<f64, ScorerError> {
            self.0.map_err(|_| ScorerError::Unavailable("boom".into()))
        }
    }

    fn series(node: &str, feature: &str, values: impl IntoIterator<Item = f64>) -> Vec<Reading> {
        let t0 = Utc::now() - Duration::hours(10);
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                Reading::new(node, t0 + Duration::seconds(i as i64 * 30))
                    .with_value(feature, Some(v))
                    .unwrap()
            })
            .collect()
    }

    fn ctx(guardrails: &Guardrails) -> ScoreContext<'_> {
        ScoreContext {
            guardrails,
            outlier: None,
            strategy: Strategy::Probabilistic,
        }
    }

    fn one(node: &str, feature: &str, v: f64) -> Reading {
        Reading::new(node, Utc::now()).with_value(feature, Some(v)).unwrap()
    }

    #[test]
    fn test_stable_reading_is_safe() {
        let g = Guardrails::default();
        let history = series("water_1", "tds", (0..200).map(|i| 400.0 + (i % 5) as f64));
        let a = assess(&ctx(&g), "water_1", &one("water_1", "tds", 402.0), &history, &["tds"]);
        assert_eq!(a.status, Status::Safe);
        assert!(a.abnormal_probability < crate::detect::WARNING_PROBABILITY);
        assert_eq!(a.reasons, vec!["within expected range".to_string()]);
        assert!(a.confidence > 0.9);
        assert!(a.methods.rolling_baseline);
        assert!(!a.bypass_hysteresis);
    }

    #[test]
    fn test_danger_threshold_forces_danger() {
        let g = Guardrails::default();
        let a = assess(&ctx(&g), "water_1", &one("water_1", "ph", 9.4), &[], &["ph"]);
        assert_eq!(a.status, Status::Danger);
        assert!(a.abnormal_probability >= 0.99);
        assert!(a.confidence >= DANGER_CONFIDENCE_FLOOR);
        assert!(a.bypass_hysteresis);
    }

    #[test]
    fn test_danger_jump_boost() {
        let g = Guardrails::default();
        let history = series("ground_1", "pm25", [5.0, 5.0, 6.0]);
        let a = assess(&ctx(&g), "ground_1", &one("ground_1", "pm25", 48.0), &history, &["pm25"]);
        assert!(a.abnormal_probability >= 0.85);
        assert_eq!(a.status, Status::Danger);
        assert!(a.reasons[0].starts_with("Sudden jump in pm25"));
    }

    #[test]
    fn test_failing_model_contributes_nothing() {
        let g = Guardrails::default();
        let failing = Fixed(Err(()));
        let c = ScoreContext {
            guardrails: &g,
            outlier: Some(&failing),
            strategy: Strategy::Probabilistic,
        };
        let a = assess(&c, "water_1", &one("water_1", "tds", 400.0), &[], &["tds"]);
        assert!(!a.methods.outlier_model);
        assert_eq!(a.status, Status::Safe);
    }

    #[test]
    fn test_model_score_is_an_alternative_estimate() {
        let g = Guardrails::default();
        let model = Fixed(Ok(0.75));
        let c = ScoreContext {
            guardrails: &g,
            outlier: Some(&model),
            strategy: Strategy::Probabilistic,
        };
        let a = assess(&c, "water_1", &one("water_1", "tds", 400.0), &[], &["tds"]);
        assert!(a.methods.outlier_model);
        assert!((a.abnormal_probability - 0.75).abs() < 1e-12);
        assert_eq!(a.status, Status::Danger);
    }

    #[test]
    fn test_short_history_caps_confidence() {
        let g = Guardrails::default();
        // already smoggy, so 80 is not a statistical outlier but is over the 75 bound
        let history = series(
            "ground_1",
            "pm25",
            [72.0, 78.0, 84.0, 75.0, 81.0, 77.0, 83.0, 74.0, 80.0, 79.0],
        );
        let a = assess(&ctx(&g), "ground_1", &one("ground_1", "pm25", 80.0), &history, &["pm25"]);
        assert!(a.confidence <= SHORT_HISTORY_CONFIDENCE);
        assert_eq!(a.status, Status::Warning);
        assert!(a.abnormal_probability >= 0.5);
    }

    #[test]
    fn test_multi_sensor_bump() {
        let g = Guardrails::default();
        let t0 = Utc::now() - Duration::hours(1);
        let history: Vec<Reading> = (0..60)
            .map(|i| {
                let wiggle = (i % 3) as f64;
                Reading::new("ground_3", t0 + Duration::seconds(i * 30))
                    .with_value("air_temp_c", Some(20.0 + wiggle))
                    .unwrap()
                    .with_value("humidity", Some(50.0 + wiggle))
                    .unwrap()
            })
            .collect();
        let current = Reading::new("ground_3", Utc::now())
            .with_value("air_temp_c", Some(30.0))
            .unwrap()
            .with_value("humidity", Some(70.0))
            .unwrap();
        let a = assess(&ctx(&g), "ground_3", &current, &history, &["air_temp_c", "humidity"]);
        assert!(a.reasons.iter().any(|r| r == "Multiple sensors abnormal on ground_3"));
        assert_eq!(a.abnormal_probability, 1.0);
    }

    #[test]
    fn test_multi_sensor_bump_by_count() {
        let g = Guardrails::default();
        let bases = [("air_temp_c", 20.0), ("humidity", 50.0), ("pressure_hpa", 1000.0)];
        // MAD 1.0 per feature, so the current row sits 2.6 sigma above each median
        let offsets = [-1.0, 0.0, 1.0, -1.0, 0.0, 1.0, 0.0];
        let t0 = Utc::now() - Duration::hours(1);
        let history: Vec<Reading> = offsets
            .iter()
            .enumerate()
            .map(|(i, off)| {
                bases.iter().fold(
                    Reading::new("ground_3", t0 + Duration::seconds(i as i64 * 30)),
                    |r, (f, base)| r.with_value(f, Some(base + off)).unwrap(),
                )
            })
            .collect();
        let current = bases.iter().fold(Reading::new("ground_3", Utc::now()), |r, (f, base)| {
            r.with_value(f, Some(base + 2.6 * 1.4826)).unwrap()
        });
        let baseline = sigmoid(0.6 * 1.4);

        let single = assess(&ctx(&g), "ground_3", &current, &history, &["air_temp_c"]);
        assert!((single.abnormal_probability - baseline).abs() < 1e-6);

        let two = assess(&ctx(&g), "ground_3", &current, &history, &["air_temp_c", "humidity"]);
        assert!((two.abnormal_probability - (baseline + 0.15)).abs() < 1e-6);
        assert!(two.abnormal_probability < 1.0);

        let features = ["air_temp_c", "humidity", "pressure_hpa"];
        let three = assess(&ctx(&g), "ground_3", &current, &history, &features);
        assert!((three.abnormal_probability - (baseline + 0.25)).abs() < 1e-6);
        assert!(three.abnormal_probability < 1.0);
    }

    #[test]
    fn test_tiered_abnormal_tier() {
        let g = Guardrails::default();
        // MAD of the baseline is 1.0 -> scale 1.4826; 2.7 sigma above the median
        let history = series("ground_1", "voc", [99.0, 100.0, 101.0, 99.0, 100.0, 101.0, 100.0]);
        let current = one("ground_1", "voc", 100.0 - 2.7 * 1.4826);
        let c = ScoreContext {
            guardrails: &g,
            outlier: None,
            strategy: Strategy::Tiered,
        };
        let a = assess(&c, "ground_1", &current, &history, &["voc"]);
        assert_eq!(a.status, Status::Abnormal);
    }

    #[test]
    fn test_tiered_benign_extreme_is_abnormal() {
        let g = Guardrails::default();
        let history = series("ground_1", "pressure_hpa", [1010.0, 1011.0, 1012.0, 1010.0, 1011.0, 1012.0]);
        let c = ScoreContext {
            guardrails: &g,
            outlier: None,
            strategy: Strategy::Tiered,
        };
        let a = assess(&c, "ground_1", &one("ground_1", "pressure_hpa", 1030.0), &history, &["pressure_hpa"]);
        assert!(a.max_abs_z >= OVERRIDE_Z);
        assert_eq!(a.status, Status::Abnormal);
    }

    #[test]
    fn test_stability_factor_bounds() {
        let steady = series("water_1", "tds", [400.0; 60]);
        assert_eq!(stability_factor(&steady, &["tds"]), 1.0);
        let noisy = series("water_1", "tds", (0..60).map(|i| if i % 2 == 0 { 10.0 } else { 1000.0 }));
        assert_eq!(stability_factor(&noisy, &["tds"]), 0.3);
        assert_eq!(stability_factor(&[], &["tds"]), 1.0);
    }
}
