//! Anomaly-index aggregator: rolls a set of recent anomalies into a 0-100
//! score compared against a rolling 24h baseline.
//!
//! The bounded-history/statistics shape follows `utils/metrics.rs`'s
//! `push_capped`/`Stats` pattern, applied here to index snapshots instead of
//! sensor readings.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::types::{AnomalyEvent, AnomalySeverity};

const BASELINE_WINDOW_HOURS: f64 = 24.0;
const DEFAULT_BASELINE: f64 = 15.0;
const HISTORY_CAP: usize = 10_000;

/// Equal weight across all known sources. Per the original's own comment,
/// these are not yet calibrated and would need 1-2 months of historical
/// data before a per-source weighting pass could be justified.
const KNOWN_SOURCES: [&str; 7] = [
    "quantum_rng",
    "earthquake",
    "crypto",
    "space_weather",
    "blockchain",
    "weather",
    "news",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Normal,
    Elevated,
    High,
    Critical,
}

#[derive(Debug, Clone)]
pub struct AnomalyIndexSnapshot {
    pub timestamp: f64,
    pub index: f64,
    pub breakdown: HashMap<String, f64>,
    pub baseline_ratio: f64,
    pub status: IndexStatus,
    pub active_anomalies: usize,
}

pub struct AnomalyIndexCalculator {
    history: Mutex<VecDeque<AnomalyIndexSnapshot>>,
    baseline: Mutex<f64>,
    last_baseline_update: Mutex<f64>,
}

impl AnomalyIndexCalculator {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(VecDeque::new()),
            baseline: Mutex::new(DEFAULT_BASELINE),
            last_baseline_update: Mutex::new(0.0),
        }
    }

    pub fn calculate(&self, timestamp: f64, anomalies: &[AnomalyEvent]) -> AnomalyIndexSnapshot {
        self.maybe_update_baseline(timestamp);

        let breakdown = self.breakdown(anomalies);
        let total: f64 = breakdown.values().sum();
        let index = (total / (KNOWN_SOURCES.len() as f64 * 100.0) * 100.0).min(100.0);

        let baseline = *self.baseline.lock();
        let baseline_ratio = if baseline > 0.0 { index / baseline } else { 0.0 };
        let status = determine_status(index, baseline_ratio);

        let snapshot = AnomalyIndexSnapshot {
            timestamp,
            index,
            breakdown,
            baseline_ratio,
            status,
            active_anomalies: anomalies.len(),
        };

        let mut history = self.history.lock();
        history.push_back(snapshot.clone());
        while history.len() > HISTORY_CAP {
            history.pop_front();
        }

        snapshot
    }

    fn breakdown(&self, anomalies: &[AnomalyEvent]) -> HashMap<String, f64> {
        let mut scores: HashMap<String, f64> = HashMap::new();
        for anomaly in anomalies {
            let severity = anomaly_severity(anomaly);
            let entry = scores.entry(anomaly.sensor_source.clone()).or_insert(0.0);
            *entry = (*entry + severity.score()).min(100.0);
        }
        scores
    }

    fn maybe_update_baseline(&self, now: f64) {
        let mut last_update = self.last_baseline_update.lock();
        if now - *last_update < 3600.0 {
            return;
        }
        *last_update = now;

        let history = self.history.lock();
        let cutoff = now - BASELINE_WINDOW_HOURS * 3600.0;
        let recent: Vec<f64> = history
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .map(|s| s.index)
            .collect();

        let mut baseline = self.baseline.lock();
        *baseline = if recent.len() < 10 {
            DEFAULT_BASELINE
        } else {
            recent.iter().sum::<f64>() / recent.len() as f64
        };
    }
}

impl Default for AnomalyIndexCalculator {
    fn default() -> Self {
        Self::new()
    }
}

fn anomaly_severity(anomaly: &AnomalyEvent) -> AnomalySeverity {
    anomaly.severity()
}

fn determine_status(index: f64, baseline_ratio: f64) -> IndexStatus {
    if index >= 80.0 || baseline_ratio >= 3.0 {
        IndexStatus::Critical
    } else if index >= 60.0 || baseline_ratio >= 2.0 {
        IndexStatus::High
    } else if index >= 40.0 || baseline_ratio >= 1.5 {
        IndexStatus::Elevated
    } else {
        IndexStatus::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn anomaly(source: &str, severity: &str) -> AnomalyEvent {
        let mut metadata = Map::new();
        metadata.insert("severity".to_string(), serde_json::Value::String(severity.to_string()));
        AnomalyEvent {
            timestamp: 0.0,
            parameter: format!("{source}.value"),
            value: 1.0,
            mean: 0.0,
            std: 1.0,
            z_score: 1.0,
            sensor_source: source.to_string(),
            metadata,
        }
    }

    #[test]
    fn index_bounded_zero_to_hundred() {
        let calc = AnomalyIndexCalculator::new();
        let anomalies = vec![anomaly("crypto", "critical"); 20];
        let snap = calc.calculate(0.0, &anomalies);
        assert!(snap.index <= 100.0);
        assert!(snap.index >= 0.0);
    }

    #[test]
    fn default_baseline_used_with_little_history() {
        let calc = AnomalyIndexCalculator::new();
        let snap = calc.calculate(0.0, &[anomaly("crypto", "low")]);
        assert_eq!(snap.baseline_ratio, snap.index / DEFAULT_BASELINE);
    }

    #[test]
    fn status_bands() {
        assert_eq!(determine_status(85.0, 1.0), IndexStatus::Critical);
        assert_eq!(determine_status(10.0, 3.5), IndexStatus::Critical);
        assert_eq!(determine_status(10.0, 1.0), IndexStatus::Normal);
        assert_eq!(determine_status(45.0, 1.0), IndexStatus::Elevated);
    }

    #[test]
    fn per_source_score_capped_at_hundred() {
        let calc = AnomalyIndexCalculator::new();
        let anomalies = vec![anomaly("crypto", "critical"), anomaly("crypto", "critical")];
        let snap = calc.calculate(0.0, &anomalies);
        assert_eq!(snap.breakdown["crypto"], 100.0);
    }
}
