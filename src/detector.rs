//! Threshold-based anomaly detector: turns DATA readings into ANOMALY
//! events using a configurable, glob-matched rule catalog, and logs every
//! evaluated check (triggered or not) to the calibration tracker.
//!
//! Rule-evaluation loop shape is informed by `component_a/processor.rs`'s
//! per-field pass, though the statistical z-score logic there is replaced
//! entirely by the rule-based evaluation this component specifies.

use log::warn;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;

use crate::calibration::CalibrationTracker;
use crate::types::{now_unix, AnomalyEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalySeverityBand {
    Low,
    Medium,
    High,
    Critical,
}

impl AnomalySeverityBand {
    fn from_ratio(ratio: f64) -> Self {
        if ratio >= 3.0 {
            AnomalySeverityBand::Critical
        } else if ratio >= 2.0 {
            AnomalySeverityBand::High
        } else if ratio >= 1.5 {
            AnomalySeverityBand::Medium
        } else {
            AnomalySeverityBand::Low
        }
    }

    fn z_score(self) -> f64 {
        match self {
            AnomalySeverityBand::Low => 5.0,
            AnomalySeverityBand::Medium => 7.0,
            AnomalySeverityBand::High => 10.0,
            AnomalySeverityBand::Critical => 15.0,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            AnomalySeverityBand::Low => "low",
            AnomalySeverityBand::Medium => "medium",
            AnomalySeverityBand::High => "high",
            AnomalySeverityBand::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThresholdRule {
    pub name: String,
    pub parameter_pattern: String,
    pub min_change_percent: Option<f64>,
    pub min_absolute: Option<f64>,
    pub max_absolute: Option<f64>,
    pub trigger_above: Option<f64>,
    pub lookback_seconds: f64,
    pub description: String,
}

impl ThresholdRule {
    fn matches_key(&self, key: &str) -> bool {
        glob_match(&self.parameter_pattern, key)
    }
}

/// Translates the rule catalog's glob syntax (`.` literal, `*` wildcard)
/// into an anchored match, without pulling in a regex dependency the
/// teacher doesn't already carry.
fn glob_match(pattern: &str, key: &str) -> bool {
    fn rec(p: &[u8], k: &[u8]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                // '*' matches any non-empty run up to (not including) the
                // remaining literal pattern, mirroring the original's
                // translation to ".*" in an otherwise literal, dot-anchored
                // regex.
                for split in 0..=k.len() {
                    if rec(&p[1..], &k[split..]) {
                        return true;
                    }
                }
                false
            }
            (Some(pc), Some(kc)) if pc == kc => rec(&p[1..], &k[1..]),
            _ => false,
        }
    }
    rec(pattern.as_bytes(), key.as_bytes())
}

struct SlidingWindow {
    samples: VecDeque<(f64, f64)>,
    cap: usize,
}

impl SlidingWindow {
    fn new(cap: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(cap.min(64)),
            cap,
        }
    }

    fn push(&mut self, ts: f64, value: f64) {
        if self.samples.len() >= self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back((ts, value));
    }

    /// Earliest sample at or after `now - lookback`.
    fn value_at_or_after(&self, cutoff: f64) -> Option<f64> {
        self.samples
            .iter()
            .find(|(ts, _)| *ts >= cutoff)
            .map(|(_, v)| *v)
    }
}

pub struct ThresholdDetector {
    rules: Vec<ThresholdRule>,
    windows: Mutex<HashMap<String, SlidingWindow>>,
    calibration: Option<std::sync::Arc<CalibrationTracker>>,
}

impl ThresholdDetector {
    pub fn new(calibration: Option<std::sync::Arc<CalibrationTracker>>) -> Self {
        let mut rules = default_rules();
        if let Some(overrides) = load_calibrated_overrides(Path::new(
            "logs/calibration/calibrated_thresholds.json",
        )) {
            apply_overrides(&mut rules, &overrides);
        }
        Self {
            rules,
            windows: Mutex::new(HashMap::new()),
            calibration,
        }
    }

    pub fn with_rules(rules: Vec<ThresholdRule>, calibration: Option<std::sync::Arc<CalibrationTracker>>) -> Self {
        Self {
            rules,
            windows: Mutex::new(HashMap::new()),
            calibration,
        }
    }

    /// Evaluates every numeric field of a flattened reading payload,
    /// returning at most one `AnomalyEvent` per parameter (the first
    /// matching rule that triggers), though every matching rule is checked
    /// and logged to the calibration tracker regardless of outcome.
    pub fn evaluate(&self, source: &str, timestamp: f64, fields: &HashMap<String, Value>) -> Vec<AnomalyEvent> {
        let mut anomalies = Vec::new();
        for (field, value) in fields {
            let Some(value) = value.as_f64() else { continue };
            let key = format!("{source}.{field}");

            if let Some(cal) = &self.calibration {
                cal.log_value_distribution(&key, value);
            }

            let matching: Vec<ThresholdRule> = self
                .rules
                .iter()
                .filter(|r| r.matches_key(&key))
                .cloned()
                .collect();

            let mut windows = self.windows.lock();
            let window = windows.entry(key.clone()).or_insert_with(|| SlidingWindow::new(1000));

            let mut anomaly = None;
            for rule in &matching {
                if anomaly.is_some() {
                    break;
                }
                let old_value = if rule.min_change_percent.is_some() {
                    window.value_at_or_after(timestamp - rule.lookback_seconds)
                } else {
                    None
                };
                anomaly = self.evaluate_rule(rule, &key, value, old_value, timestamp, source);
            }
            window.push(timestamp, value);
            drop(windows);

            if let Some(anomaly) = anomaly {
                anomalies.push(anomaly);
            }
        }
        anomalies
    }

    /// Evaluates a single matching rule against one field, logging the
    /// check (triggered or not) to the calibration tracker. For
    /// `min_change_percent` rules both the logged value and the severity
    /// ratio are computed from the percent change, not the raw field value,
    /// matching the original's `.change_pct` branch.
    fn evaluate_rule(
        &self,
        rule: &ThresholdRule,
        key: &str,
        value: f64,
        old_value: Option<f64>,
        timestamp: f64,
        sensor_source: &str,
    ) -> Option<AnomalyEvent> {
        let (triggered, threshold_value, check_value, description) = if let Some(max) = rule.max_absolute {
            (value > max, max, value, format!("{} exceeds max {max}", rule.description))
        } else if let Some(min) = rule.min_absolute {
            (value < min, min, value, format!("{} below min {min}", rule.description))
        } else if let Some(above) = rule.trigger_above {
            (value >= above, above, value, format!("{} at or above {above}", rule.description))
        } else if let Some(pct) = rule.min_change_percent {
            match old_value {
                Some(old) if old != 0.0 => {
                    let change = (value - old) / old * 100.0;
                    (change.abs() >= pct, pct, change, format!("{} changed {change:.2}%", rule.description))
                }
                _ => (false, pct, 0.0, String::new()),
            }
        } else {
            (false, 0.0, value, String::new())
        };

        if let Some(cal) = &self.calibration {
            cal.log_threshold_check(&rule.name, check_value, threshold_value, triggered);
        }

        if !triggered {
            return None;
        }

        let ratio = if threshold_value != 0.0 {
            (check_value / threshold_value).abs()
        } else {
            1.0
        };
        let band = AnomalySeverityBand::from_ratio(ratio);

        let mut metadata = HashMap::new();
        metadata.insert("severity".to_string(), Value::String(band.as_str().to_string()));
        metadata.insert("reason".to_string(), Value::String(description));
        metadata.insert("rule".to_string(), Value::String(rule.name.clone()));

        Some(AnomalyEvent {
            timestamp,
            parameter: key.to_string(),
            value,
            mean: old_value.unwrap_or(value),
            std: 0.0,
            z_score: band.z_score(),
            sensor_source: sensor_source.to_string(),
            metadata,
        })
    }
}

fn rule(name: &str, pattern: &str, description: &str) -> ThresholdRule {
    ThresholdRule {
        name: name.to_string(),
        parameter_pattern: pattern.to_string(),
        min_change_percent: None,
        min_absolute: None,
        max_absolute: None,
        trigger_above: None,
        lookback_seconds: 60.0,
        description: description.to_string(),
    }
}

/// The default 16-entry catalog, one-for-one with the original's rule set.
pub fn default_rules() -> Vec<ThresholdRule> {
    vec![
        ThresholdRule {
            min_change_percent: Some(1.0),
            ..rule("crypto.price.change_pct", "crypto.*.price", "crypto price move")
        },
        ThresholdRule {
            min_change_percent: Some(50.0),
            lookback_seconds: 300.0,
            ..rule("crypto.volume.change_pct", "crypto.*.volume", "crypto volume spike")
        },
        ThresholdRule {
            max_absolute: Some(1000.0),
            ..rule("network.latency_ms.max", "network.latency_ms", "network latency absolute")
        },
        ThresholdRule {
            min_change_percent: Some(100.0),
            lookback_seconds: 30.0,
            ..rule("network.latency_ms.change_pct", "network.latency_ms", "network latency spike")
        },
        ThresholdRule {
            min_change_percent: Some(150.0),
            ..rule("time_drift.change_pct", "time_drift.offset_ms", "time drift change")
        },
        ThresholdRule {
            max_absolute: Some(500.0),
            ..rule("time_drift.offset_ms.max", "time_drift.offset_ms", "time drift upper bound")
        },
        ThresholdRule {
            min_absolute: Some(-500.0),
            ..rule("time_drift.offset_ms.min", "time_drift.offset_ms", "time drift lower bound")
        },
        ThresholdRule {
            min_change_percent: Some(100.0),
            lookback_seconds: 300.0,
            ..rule("news.headline_count.change_pct", "news.headline_count", "news headline spike")
        },
        ThresholdRule {
            min_change_percent: Some(50.0),
            lookback_seconds: 600.0,
            ..rule("blockchain.block_time.change_pct", "blockchain.*.block_time", "blockchain block time change")
        },
        ThresholdRule {
            min_change_percent: Some(10.0),
            lookback_seconds: 300.0,
            ..rule("weather.temperature.change_pct", "weather.temperature", "weather temperature change")
        },
        ThresholdRule {
            min_change_percent: Some(2.0),
            lookback_seconds: 300.0,
            ..rule("weather.pressure.change_pct", "weather.pressure", "weather pressure change")
        },
        ThresholdRule {
            max_absolute: Some(0.55),
            ..rule("random.mean.max", "random.mean", "random generator bias upper bound")
        },
        ThresholdRule {
            min_absolute: Some(0.45),
            ..rule("random.mean.min", "random.mean", "random generator bias lower bound")
        },
        ThresholdRule {
            min_absolute: Some(0.85),
            ..rule("quantum_rng.randomness_score.min", "quantum_rng.randomness_score", "quantum randomness floor")
        },
        ThresholdRule {
            trigger_above: Some(4.5),
            ..rule("earthquake.max_magnitude.trigger_above", "earthquake.max_magnitude", "earthquake magnitude trigger")
        },
        ThresholdRule {
            trigger_above: Some(2.0),
            ..rule("earthquake.count.trigger_above", "earthquake.count", "earthquake count trigger")
        },
        ThresholdRule {
            trigger_above: Some(5.0),
            ..rule("space_weather.kp_index.trigger_above", "space_weather.kp_index", "space weather kp trigger")
        },
        ThresholdRule {
            min_change_percent: Some(50.0),
            lookback_seconds: 3600.0,
            ..rule("space_weather.kp_index.change_pct", "space_weather.kp_index", "space weather kp spike")
        },
        ThresholdRule {
            trigger_above: Some(0.5),
            ..rule("space_weather.flare_count.trigger_above", "space_weather.flare_count", "space weather flare count")
        },
    ]
}

fn load_calibrated_overrides(path: &Path) -> Option<HashMap<String, f64>> {
    let text = fs::read_to_string(path).ok()?;
    let parsed: HashMap<String, Value> = serde_json::from_str(&text).ok()?;
    Some(
        parsed
            .into_iter()
            .filter_map(|(k, v)| v.get("value")?.as_f64().map(|n| (k, n)))
            .collect(),
    )
}

fn apply_overrides(rules: &mut [ThresholdRule], overrides: &HashMap<String, f64>) {
    for r in rules.iter_mut() {
        let Some(&value) = overrides.get(&r.name) else { continue };
        if r.name.ends_with(".min") {
            r.min_absolute = Some(value);
        } else if r.name.ends_with(".max") {
            r.max_absolute = Some(value);
        } else if r.name.ends_with(".trigger_above") {
            r.trigger_above = Some(value);
        } else if r.name.ends_with(".change_pct") {
            r.min_change_percent = Some(value);
        }
        warn!("calibrated override applied to '{}': {value}", r.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_dotted_wildcard() {
        assert!(glob_match("crypto.*.price", "crypto.btcusdt.price"));
        assert!(!glob_match("crypto.*.price", "crypto.btcusdt.volume"));
        assert!(glob_match("network.latency_ms", "network.latency_ms"));
    }

    #[test]
    fn flat_change_does_not_trigger() {
        let detector = ThresholdDetector::with_rules(default_rules(), None);
        let mut fields = HashMap::new();
        fields.insert("btcusdt.price".to_string(), serde_json::json!(100.0));
        let a = detector.evaluate("crypto", 0.0, &fields);
        assert!(a.is_empty());
        let a = detector.evaluate("crypto", 10.0, &fields);
        assert!(a.is_empty());
    }

    #[test]
    fn zero_old_value_never_triggers_change_pct_rule() {
        let detector = ThresholdDetector::with_rules(default_rules(), None);
        let mut fields = HashMap::new();
        fields.insert("btcusdt.price".to_string(), serde_json::json!(0.0));
        detector.evaluate("crypto", 0.0, &fields);
        fields.insert("btcusdt.price".to_string(), serde_json::json!(50.0));
        let a = detector.evaluate("crypto", 1.0, &fields);
        assert!(a.is_empty());
    }

    #[test]
    fn absolute_max_rule_triggers_above_threshold() {
        let detector = ThresholdDetector::with_rules(default_rules(), None);
        let mut fields = HashMap::new();
        fields.insert("latency_ms".to_string(), serde_json::json!(2000.0));
        let a = detector.evaluate("network", 0.0, &fields);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].severity_label(), "high".to_string());
    }

    #[test]
    fn severity_band_from_ratio() {
        assert_eq!(AnomalySeverityBand::from_ratio(3.5), AnomalySeverityBand::Critical);
        assert_eq!(AnomalySeverityBand::from_ratio(1.0), AnomalySeverityBand::Low);
    }

    /// `time_drift.offset_ms` has three rules sharing the same pattern
    /// (change_pct, .max, .min). A first-match-only evaluator would stop at
    /// the change_pct rule and never reach the absolute bound, masking an
    /// extreme drift reading that never had a prior sample to compare against.
    #[test]
    fn later_rule_on_shared_pattern_still_triggers() {
        let detector = ThresholdDetector::with_rules(default_rules(), None);
        let mut fields = HashMap::new();
        fields.insert("offset_ms".to_string(), serde_json::json!(600.0));
        let a = detector.evaluate("time_drift", 0.0, &fields);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].metadata.get("rule").unwrap().as_str().unwrap(), "time_drift.offset_ms.max");
    }

    #[test]
    fn earlier_non_triggering_rule_does_not_block_a_later_one() {
        let detector = ThresholdDetector::with_rules(default_rules(), None);
        let mut fields = HashMap::new();
        fields.insert("offset_ms".to_string(), serde_json::json!(-600.0));
        let a = detector.evaluate("time_drift", 0.0, &fields);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].metadata.get("rule").unwrap().as_str().unwrap(), "time_drift.offset_ms.min");
    }

    /// A modest percent move on a large-magnitude field (BTC price) must not
    /// have its severity derived from the raw value; that previously forced
    /// every change_pct anomaly to `critical` regardless of actual severity.
    #[test]
    fn change_pct_severity_uses_percent_change_not_raw_value() {
        let detector = ThresholdDetector::with_rules(default_rules(), None);
        let mut fields = HashMap::new();
        fields.insert("btcusdt.price".to_string(), serde_json::json!(60_000.0));
        detector.evaluate("crypto", 0.0, &fields);
        fields.insert("btcusdt.price".to_string(), serde_json::json!(60_900.0));
        let a = detector.evaluate("crypto", 10.0, &fields);
        assert_eq!(a.len(), 1);
        // 1.5% change against a 1.0% threshold -> ratio 1.5 -> medium, not critical.
        assert_eq!(a[0].severity_label(), "medium".to_string());
    }

    #[test]
    fn change_pct_rule_evaluated_against_multiple_matching_rules_stops_on_first_trigger() {
        // network.latency_ms is matched by both the absolute-max rule and the
        // change_pct rule; the absolute rule sits first in the catalog and
        // should win without the change_pct rule ever needing to trigger.
        let detector = ThresholdDetector::with_rules(default_rules(), None);
        let mut fields = HashMap::new();
        fields.insert("latency_ms".to_string(), serde_json::json!(2000.0));
        let a = detector.evaluate("network", 0.0, &fields);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].metadata.get("rule").unwrap().as_str().unwrap(), "network.latency_ms.max");
    }
}

impl AnomalyEvent {
    #[cfg(test)]
    fn severity_label(&self) -> String {
        self.metadata
            .get("severity")
            .and_then(|v| v.as_str())
            .unwrap_or("low")
            .to_string()
    }
}
