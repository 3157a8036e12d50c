//! Robust per-feature deviation scores and short-window trends.

use serde::Serialize;

use crate::analysis::stats::{ols_slope, TimeSeries};
use crate::telemetry::Reading;

/// Minimum non-null history values before a feature is evaluable.
pub const MIN_BASELINE: usize = 5;

/// Rows used for the trend slope.
pub const TREND_WINDOW: usize = 6;

/// |z| at or above which a feature counts as abnormal.
pub const ABNORMAL_Z: f64 = 2.5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureDeviation {
    pub feature: String,
    pub z_score: f64,
    pub trend_slope: f64,
    /// False when the baseline was too short or the current value is absent;
    /// `z_score` is then 0.0 and means "unknown", not "normal".
    pub evaluable: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FeatureReport {
    pub deviations: Vec<FeatureDeviation>,
    pub abnormal_count: usize,
}

impl FeatureReport {
    pub fn max_abs_z(&self) -> f64 {
        self.deviations
            .iter()
            .map(|d| d.z_score.abs())
            .fold(0.0, f64::max)
    }

    pub fn get(&self, feature: &str) -> Option<&FeatureDeviation> {
        self.deviations.iter().find(|d| d.feature == feature)
    }

    /// Deviations ordered by descending |z|.
    pub fn ranked(&self) -> Vec<&FeatureDeviation> {
        let mut ranked: Vec<&FeatureDeviation> = self.deviations.iter().collect();
        ranked.sort_by(|a, b| b.z_score.abs().total_cmp(&a.z_score.abs()));
        ranked
    }
}

/// Score `reading` against `history` (rows before it, oldest first) for each
/// of `features`.
pub fn extract(reading: &Reading, history: &[Reading], features: &[&str]) -> FeatureReport {
    let deviations: Vec<FeatureDeviation> = features
        .iter()
        .map(|feature| {
            let (z_score, evaluable) = z_score(reading, history, feature);
            FeatureDeviation {
                feature: feature.to_string(),
                z_score,
                trend_slope: trend_slope(history, feature, TREND_WINDOW),
                evaluable,
            }
        })
        .collect();

    let abnormal_count = deviations
        .iter()
        .filter(|d| d.z_score.abs() >= ABNORMAL_Z)
        .count();

    FeatureReport {
        deviations,
        abnormal_count,
    }
}

fn z_score(reading: &Reading, history: &[Reading], feature: &str) -> (f64, bool) {
    let Some(current) = reading.value(feature) else {
        return (0.0, false);
    };
    let values: Vec<f64> = history.iter().filter_map(|r| r.value(feature)).collect();
    if values.len() < MIN_BASELINE {
        return (0.0, false);
    }
    (TimeSeries::new(values).robust_z(current), true)
}

/// OLS slope over the last `window` rows, x being the row position in the
/// window. Needs at least two non-null values.
pub fn trend_slope(history: &[Reading], feature: &str, window: usize) -> f64 {
    let start = history.len().saturating_sub(window);
    let points: Vec<(f64, f64)> = history[start..]
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.value(feature).map(|v| (i as f64, v)))
        .collect();
    ols_slope(&points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn rows(feature: &str, values: &[Option<f64>]) -> Vec<Reading> {
        let t0 = Utc::now() - Duration::hours(1);
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                Reading::new("ground_1", t0 + Duration::seconds(i as i64 * 10))
                    .with_value(feature, *v)
                    .unwrap()
            })
            .collect()
    }

    fn current(feature: &str, v: f64) -> Reading {
        Reading::new("ground_1", Utc::now()).with_value(feature, Some(v)).unwrap()
    }

    #[test]
    fn test_constant_history_gives_zero_z() {
        let history = rows("pm25", &[Some(12.0); 40]);
        let report = extract(&current("pm25", 12.0), &history, &["pm25"]);
        assert_eq!(report.deviations[0].z_score, 0.0);
        assert!(report.deviations[0].evaluable);
        assert_eq!(report.abnormal_count, 0);
    }

    #[test]
    fn test_short_history_not_evaluable() {
        let history = rows("pm25", &[Some(10.0), Some(11.0), Some(12.0), None, Some(9.0)]);
        let report = extract(&current("pm25", 500.0), &history, &["pm25"]);
        let d = &report.deviations[0];
        assert_eq!(d.z_score, 0.0);
        assert!(!d.evaluable);
    }

    #[test]
    fn test_spike_is_abnormal() {
        let history = rows(
            "voc",
            &[Some(100.0), Some(104.0), Some(98.0), Some(101.0), Some(99.0), Some(102.0)],
        );
        let report = extract(&current("voc", 160.0), &history, &["voc"]);
        assert!(report.deviations[0].z_score > ABNORMAL_Z);
        assert_eq!(report.abnormal_count, 1);
        assert!(report.max_abs_z() > ABNORMAL_Z);
    }

    #[test]
    fn test_missing_current_value() {
        let history = rows("voc", &[Some(100.0); 10]);
        let reading = Reading::new("ground_1", Utc::now()).with_value("voc", None).unwrap();
        let report = extract(&reading, &history, &["voc"]);
        assert!(!report.deviations[0].evaluable);
    }

    #[test]
    fn test_trend_uses_last_window() {
        let mut values: Vec<Option<f64>> = vec![Some(500.0); 10];
        values.extend([1.0, 2.0, 3.0, 4.0, 5.0, 6.0].map(Some));
        let history = rows("tds", &values);
        assert!((trend_slope(&history, "tds", TREND_WINDOW) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_trend_needs_two_points() {
        let history = rows("tds", &[None, None, Some(3.0), None]);
        assert_eq!(trend_slope(&history, "tds", TREND_WINDOW), 0.0);
    }
}
