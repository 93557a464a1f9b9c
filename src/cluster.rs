//! Temporal cluster detector: groups concurrent anomalies from distinct
//! sources into a 5-level taxonomy.
//!
//! Precursor detection is deliberately left disabled (see the spec's design
//! notes): candidates are still recorded for future offline analysis but
//! nothing here ever promotes a cluster's level from them.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

use crate::types::AnomalyEvent;

const CLUSTER_WINDOW_SECONDS: f64 = 30.0;
const PRECURSOR_WINDOW_SECONDS: f64 = 3600.0;
const RECENT_CAP: usize = 1000;
const PRECURSOR_CAP: usize = 100;

#[derive(Debug, Clone)]
pub struct AnomalyCluster {
    pub level: u8,
    pub anomalies: Vec<AnomalyEvent>,
    pub timestamp: f64,
    /// Qualitative, not statistically calibrated -- see design notes.
    pub probability: f64,
    pub description: String,
}

struct Entry {
    anomaly: AnomalyEvent,
    timestamp: f64,
}

pub struct ClusterDetector {
    recent: Mutex<VecDeque<Entry>>,
    precursor_candidates: Mutex<VecDeque<Entry>>,
    cluster_window: f64,
    precursor_window: f64,
}

impl ClusterDetector {
    pub fn new() -> Self {
        Self::with_windows(CLUSTER_WINDOW_SECONDS, PRECURSOR_WINDOW_SECONDS)
    }

    pub fn with_windows(cluster_window: f64, precursor_window: f64) -> Self {
        Self {
            recent: Mutex::new(VecDeque::new()),
            precursor_candidates: Mutex::new(VecDeque::new()),
            cluster_window,
            precursor_window,
        }
    }

    pub fn add_anomaly(&self, anomaly: AnomalyEvent) -> Option<AnomalyCluster> {
        let now = anomaly.timestamp;
        {
            let mut recent = self.recent.lock();
            recent.push_back(Entry {
                anomaly: anomaly.clone(),
                timestamp: now,
            });
            while recent.len() > RECENT_CAP {
                recent.pop_front();
            }
            while let Some(front) = recent.front() {
                if now - front.timestamp > 2.0 * self.cluster_window {
                    recent.pop_front();
                } else {
                    break;
                }
            }
        }

        let cluster = self.detect_cluster(now);
        if cluster.is_none() || cluster.as_ref().unwrap().level < 3 {
            self.record_precursor_candidate(anomaly, now);
        }
        cluster
    }

    fn detect_cluster(&self, now: f64) -> Option<AnomalyCluster> {
        let recent = self.recent.lock();
        let window: Vec<&Entry> = recent
            .iter()
            .filter(|e| now - e.timestamp < self.cluster_window)
            .collect();

        let sources: HashSet<&str> = window.iter().map(|e| e.anomaly.sensor_source.as_str()).collect();
        let level = (sources.len() as u8).min(5);
        if level == 0 {
            return None;
        }

        let anomalies: Vec<AnomalyEvent> = window.iter().map(|e| e.anomaly.clone()).collect();

        if level == 1 {
            return Some(AnomalyCluster {
                level: 1,
                anomalies,
                timestamp: now,
                probability: 1.0,
                description: "single deviation".to_string(),
            });
        }

        let probability = cluster_probability(level);
        Some(AnomalyCluster {
            level,
            anomalies,
            timestamp: now,
            probability,
            description: format!(
                "{level} distinct sources anomalous within {}s (qualitative estimate, not statistically calibrated)",
                self.cluster_window
            ),
        })
    }

    /// Intentionally disabled: candidates are tracked so a future offline
    /// analysis pass can validate the heuristic, but nothing reads this
    /// buffer to promote a cluster today.
    fn record_precursor_candidate(&self, anomaly: AnomalyEvent, now: f64) {
        let mut candidates = self.precursor_candidates.lock();
        candidates.push_back(Entry { anomaly, timestamp: now });
        while candidates.len() > PRECURSOR_CAP {
            candidates.pop_front();
        }
        while let Some(front) = candidates.front() {
            if now - front.timestamp > self.precursor_window {
                candidates.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for ClusterDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Qualitative cluster probabilities: n=2 -> 0.10, n=3 -> 0.05, n=4 -> 0.01,
/// n>=5 -> 0.001. These are hand-picked priors, not fit to historical data.
fn cluster_probability(level: u8) -> f64 {
    match level {
        2 => 0.10,
        3 => 0.05,
        4 => 0.01,
        _ => 0.001,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn anomaly(source: &str, ts: f64) -> AnomalyEvent {
        AnomalyEvent {
            timestamp: ts,
            parameter: format!("{source}.value"),
            value: 1.0,
            mean: 0.0,
            std: 1.0,
            z_score: 6.0,
            sensor_source: source.to_string(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn single_source_is_level_one() {
        let detector = ClusterDetector::new();
        let cluster = detector.add_anomaly(anomaly("crypto", 1000.0)).unwrap();
        assert_eq!(cluster.level, 1);
        assert_eq!(cluster.probability, 1.0);
    }

    #[test]
    fn three_sources_within_window_is_level_three() {
        let detector = ClusterDetector::new();
        detector.add_anomaly(anomaly("crypto", 1000.0));
        detector.add_anomaly(anomaly("quantum_rng", 1010.0));
        let cluster = detector.add_anomaly(anomaly("earthquake", 1020.0)).unwrap();
        assert_eq!(cluster.level, 3);
        assert_eq!(cluster.anomalies.len(), 3);
        assert_eq!(cluster.timestamp, 1020.0);
        assert_eq!(cluster.probability, 0.05);
    }

    #[test]
    fn level_never_exceeds_five() {
        let detector = ClusterDetector::new();
        for (i, source) in ["a", "b", "c", "d", "e", "f"].iter().enumerate() {
            let cluster = detector.add_anomaly(anomaly(source, 1000.0 + i as f64));
            if let Some(c) = cluster {
                assert!(c.level <= 5);
            }
        }
    }

    #[test]
    fn anomalies_outside_window_are_excluded() {
        let detector = ClusterDetector::new();
        detector.add_anomaly(anomaly("crypto", 1000.0));
        let cluster = detector.add_anomaly(anomaly("quantum_rng", 1000.0 + CLUSTER_WINDOW_SECONDS + 1.0)).unwrap();
        assert_eq!(cluster.level, 1);
    }
}
