//! History-independent guardrails: absolute physical limits and sudden jumps.
//!
//! Both rule families work with zero prior data, so they still protect the
//! deployment when the statistical baseline is short or corrupted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::detect::{Direction, Severity};
use crate::telemetry::{NodeKind, Reading};

/// Absolute bounds for one feature. A value at or beyond a bound trips it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub warning_low: Option<f64>,
    pub warning_high: Option<f64>,
    pub danger_low: Option<f64>,
    pub danger_high: Option<f64>,
}

impl Limits {
    fn high(warning: f64, danger: f64) -> Self {
        Self {
            warning_high: Some(warning),
            danger_high: Some(danger),
            ..Self::default()
        }
    }

    fn danger_band(low: f64, high: f64) -> Self {
        Self {
            danger_low: Some(low),
            danger_high: Some(high),
            ..Self::default()
        }
    }
}

/// Rate-of-change rule relative to the immediately preceding reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JumpRule {
    pub warn_multiplier: f64,
    pub danger_multiplier: f64,
    /// A warning jump also needs the new value to reach this floor.
    pub warn_floor: f64,
}

impl JumpRule {
    const fn new(warn_multiplier: f64, danger_multiplier: f64, warn_floor: f64) -> Self {
        Self {
            warn_multiplier,
            danger_multiplier,
            warn_floor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardrailFlag {
    pub feature: String,
    pub value: f64,
    pub threshold: f64,
    pub direction: Direction,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JumpFlag {
    pub feature: String,
    pub previous: f64,
    pub current: f64,
    pub ratio: f64,
    pub severity: Severity,
}

/// Outcome of one guardrail evaluation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GuardrailReport {
    /// An absolute danger bound was crossed.
    pub danger: bool,
    /// An absolute warning bound was crossed.
    pub warning: bool,
    pub jump_danger: bool,
    pub jump_warning: bool,
    pub threshold_reasons: Vec<String>,
    pub jump_reasons: Vec<String>,
    pub flags: Vec<GuardrailFlag>,
    pub jumps: Vec<JumpFlag>,
}

impl GuardrailReport {
    pub fn any_hit(&self) -> bool {
        !self.flags.is_empty() || !self.jumps.is_empty()
    }

    pub fn any_warning(&self) -> bool {
        self.warning || self.jump_warning
    }
}

/// Threshold tables per node kind plus jump rules per feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guardrails {
    pub thresholds: BTreeMap<NodeKind, BTreeMap<String, Limits>>,
    pub jumps: BTreeMap<String, JumpRule>,
}

impl Default for Guardrails {
    fn default() -> Self {
        let ground: BTreeMap<String, Limits> = [
            ("radiation_cpm", Limits::high(120.0, 500.0)),
            ("pm25", Limits::high(75.0, 150.0)),
            ("voc", Limits::high(800.0, 1500.0)),
            ("humidity", Limits::danger_band(10.0, 95.0)),
            ("air_temp_c", Limits::danger_band(-10.0, 60.0)),
            ("pressure_hpa", Limits::danger_band(900.0, 1100.0)),
        ]
        .into_iter()
        .map(|(f, l)| (f.to_string(), l))
        .collect();

        let water: BTreeMap<String, Limits> = [
            ("tds", Limits::high(1200.0, 2000.0)),
            (
                "ph",
                Limits {
                    warning_low: Some(6.5),
                    warning_high: Some(8.5),
                    danger_low: Some(6.0),
                    danger_high: Some(9.0),
                },
            ),
            ("turbidity", Limits::high(25.0, 50.0)),
            ("water_temp_c", Limits::high(35.0, 45.0)),
        ]
        .into_iter()
        .map(|(f, l)| (f.to_string(), l))
        .collect();

        let jumps = [
            ("radiation_cpm", JumpRule::new(5.0, 10.0, 120.0)),
            ("pm25", JumpRule::new(4.0, 8.0, 50.0)),
            ("voc", JumpRule::new(4.0, 8.0, 300.0)),
            ("tds", JumpRule::new(2.0, 3.5, 800.0)),
            ("turbidity", JumpRule::new(2.5, 4.0, 15.0)),
        ]
        .into_iter()
        .map(|(f, r)| (f.to_string(), r))
        .collect();

        Self {
            thresholds: [(NodeKind::Ground, ground), (NodeKind::Water, water)]
                .into_iter()
                .collect(),
            jumps,
        }
    }
}

impl Guardrails {
    /// Evaluate `reading` against the absolute limits for `kind` and, when a
    /// preceding reading exists, the jump rules. Only `features` are checked.
    pub fn check(
        &self,
        kind: NodeKind,
        reading: &Reading,
        previous: Option<&Reading>,
        features: &[&str],
    ) -> GuardrailReport {
        let mut report = GuardrailReport::default();
        if let Some(table) = self.thresholds.get(&kind) {
            for feature in features {
                let (Some(limits), Some(value)) = (table.get(*feature), reading.value(feature))
                else {
                    continue;
                };
                check_limits(&mut report, feature, value, limits);
            }
        }
        if let Some(previous) = previous {
            for feature in features {
                let Some(rule) = self.jumps.get(*feature) else {
                    continue;
                };
                if let (Some(old), Some(new)) = (previous.value(feature), reading.value(feature)) {
                    check_jump(&mut report, feature, old, new, rule);
                }
            }
        }
        report
    }
}

fn check_limits(report: &mut GuardrailReport, feature: &str, value: f64, limits: &Limits) {
    let mut flag = |threshold: f64, direction: Direction, severity: Severity| {
        let op = match direction {
            Direction::High => ">=",
            Direction::Low => "<=",
        };
        let reason = match (severity, direction) {
            (Severity::Danger, _) => {
                format!("Absolute threshold exceeded: {feature} {value} {op} {threshold}")
            }
            (Severity::Warning, Direction::High) => {
                format!("High reading: {feature} {value} {op} {threshold}")
            }
            (Severity::Warning, Direction::Low) => {
                format!("Low reading: {feature} {value} {op} {threshold}")
            }
        };
        match severity {
            Severity::Danger => report.danger = true,
            Severity::Warning => report.warning = true,
        }
        report.threshold_reasons.push(reason);
        report.flags.push(GuardrailFlag {
            feature: feature.to_string(),
            value,
            threshold,
            direction,
            severity,
        });
    };

    // the danger bound supersedes the warning bound on the same side
    match (limits.danger_high, limits.warning_high) {
        (Some(t), _) if value >= t => flag(t, Direction::High, Severity::Danger),
        (_, Some(t)) if value >= t => flag(t, Direction::High, Severity::Warning),
        _ => {}
    }
    match (limits.danger_low, limits.warning_low) {
        (Some(t), _) if value <= t => flag(t, Direction::Low, Severity::Danger),
        (_, Some(t)) if value <= t => flag(t, Direction::Low, Severity::Warning),
        _ => {}
    }
}

fn check_jump(report: &mut GuardrailReport, feature: &str, old: f64, new: f64, rule: &JumpRule) {
    if old <= 0.0 {
        return;
    }
    let ratio = new / old;
    let severity = if ratio >= rule.danger_multiplier {
        report.jump_danger = true;
        Severity::Danger
    } else if ratio >= rule.warn_multiplier && new >= rule.warn_floor {
        report.jump_warning = true;
        Severity::Warning
    } else {
        return;
    };
    report
        .jump_reasons
        .push(format!("Sudden jump in {feature}: {old} -> {new} ({ratio:.1}x)"));
    report.jumps.push(JumpFlag {
        feature: feature.to_string(),
        previous: old,
        current: new,
        ratio,
        severity,
    });
}
