//! Calibration tracker and auto-calibrator: persists every threshold check
//! and value sample, then periodically proposes (and optionally applies)
//! revised thresholds.
//!
//! Persistence follows the background-writer-thread shape of
//! `component_a/sync_manager.rs` (`ArrayQueue` producer side, a single
//! consumer thread draining in batches, `Drop`-triggered shutdown), reshaped
//! from CSV rows to JSONL.

use crossbeam_queue::ArrayQueue;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::types::now_unix;

const QUEUE_CAP: usize = 8192;
const DRAIN_BATCH: usize = 256;
const DRAIN_INTERVAL: Duration = Duration::from_millis(500);

const MIN_DAYS: f64 = 30.0;
const MIN_OBSERVATIONS: u64 = 1000;
const TARGET_TRIGGER_RATE: f64 = 0.02;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ThresholdHit {
    timestamp: f64,
    threshold_name: String,
    value: f64,
    threshold_value: f64,
    triggered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ValueDistributionSample {
    timestamp: f64,
    parameter_name: String,
    value: f64,
}

enum Record {
    Hit(ThresholdHit),
    Sample(ValueDistributionSample),
}

#[derive(Debug, Serialize, Deserialize)]
struct TrackerMetadata {
    start_time: f64,
}

pub struct CalibrationTracker {
    dir: PathBuf,
    queue: Arc<ArrayQueue<Record>>,
    start_time: f64,
    running: Arc<AtomicBool>,
    consumer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CalibrationTracker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        fs::create_dir_all(&dir).ok();
        let start_time = load_or_init_metadata(&dir);
        let tracker = Self {
            dir,
            queue: Arc::new(ArrayQueue::new(QUEUE_CAP)),
            start_time,
            running: Arc::new(AtomicBool::new(true)),
            consumer: Mutex::new(None),
        };
        tracker.start_consumer();
        tracker
    }

    fn start_consumer(&self) {
        let queue = self.queue.clone();
        let running = self.running.clone();
        let hits_path = self.dir.join("threshold_hits.jsonl");
        let dist_path = self.dir.join("value_distributions.jsonl");
        let handle = thread::spawn(move || {
            let mut hits_file = open_append(&hits_path);
            let mut dist_file = open_append(&dist_path);
            while running.load(Ordering::Acquire) || !queue.is_empty() {
                let mut drained = 0;
                while let Some(record) = queue.pop() {
                    write_record(&mut hits_file, &mut dist_file, record);
                    drained += 1;
                    if drained >= DRAIN_BATCH {
                        break;
                    }
                }
                if drained == 0 {
                    thread::sleep(DRAIN_INTERVAL);
                }
            }
        });
        *self.consumer.lock().unwrap() = Some(handle);
    }

    pub fn log_threshold_check(&self, name: &str, value: f64, threshold_value: f64, triggered: bool) {
        let record = Record::Hit(ThresholdHit {
            timestamp: now_unix(),
            threshold_name: name.to_string(),
            value,
            threshold_value,
            triggered,
        });
        if self.queue.push(record).is_err() {
            warn!("calibration tracker queue full, dropping threshold check for '{name}'");
        }
    }

    pub fn log_value_distribution(&self, parameter_name: &str, value: f64) {
        let record = Record::Sample(ValueDistributionSample {
            timestamp: now_unix(),
            parameter_name: parameter_name.to_string(),
            value,
        });
        if self.queue.push(record).is_err() {
            warn!("calibration tracker queue full, dropping sample for '{parameter_name}'");
        }
    }

    pub fn days_collecting(&self) -> f64 {
        (now_unix() - self.start_time) / 86400.0
    }

    pub fn ready_for_calibration(&self) -> bool {
        self.days_collecting() >= MIN_DAYS
    }

    /// Reads `threshold_hits.jsonl` fresh off disk (consumer thread has
    /// already flushed by the time this runs on the scheduler's calibration
    /// task cadence) and computes trigger-rate statistics for one name.
    pub fn analyze_threshold(&self, name: &str) -> Option<ThresholdAnalysis> {
        let hits = self.read_hits_for(name);
        if hits.is_empty() {
            return None;
        }
        let total_checks = hits.len() as u64;
        let triggered_count = hits.iter().filter(|h| h.triggered).count() as u64;
        let trigger_rate = triggered_count as f64 / total_checks as f64;

        let mut values: Vec<f64> = hits.iter().map(|h| h.value).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());

        Some(ThresholdAnalysis {
            total_checks,
            triggered_count,
            trigger_rate,
            min: values[0],
            max: values[values.len() - 1],
            p50: percentile(&values, 50.0),
            p90: percentile(&values, 90.0),
            p95: percentile(&values, 95.0),
            p99: percentile(&values, 99.0),
        })
    }

    fn read_hits_for(&self, name: &str) -> Vec<ThresholdHit> {
        let path = self.dir.join("threshold_hits.jsonl");
        read_jsonl::<ThresholdHit>(&path)
            .into_iter()
            .filter(|h| h.threshold_name == name)
            .collect()
    }

    fn all_threshold_names(&self) -> Vec<String> {
        let path = self.dir.join("threshold_hits.jsonl");
        let mut names: Vec<String> = read_jsonl::<ThresholdHit>(&path)
            .into_iter()
            .map(|h| h.threshold_name)
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.consumer.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CalibrationTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn load_or_init_metadata(dir: &Path) -> f64 {
    let path = dir.join("tracker_metadata.json");
    if let Ok(text) = fs::read_to_string(&path) {
        if let Ok(meta) = serde_json::from_str::<TrackerMetadata>(&text) {
            return meta.start_time;
        }
    }
    let start_time = now_unix();
    let meta = TrackerMetadata { start_time };
    if let Ok(json) = serde_json::to_string_pretty(&meta) {
        let _ = fs::write(&path, json);
    }
    start_time
}

fn open_append(path: &Path) -> File {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap_or_else(|e| panic!("cannot open calibration log {path:?}: {e}"))
}

fn write_record(hits_file: &mut File, dist_file: &mut File, record: Record) {
    let (file, line) = match &record {
        Record::Hit(h) => (hits_file, serde_json::to_string(h)),
        Record::Sample(s) => (dist_file, serde_json::to_string(s)),
    };
    match line {
        Ok(line) => {
            if let Err(e) = writeln!(file, "{line}") {
                error!("failed writing calibration record: {e}");
            }
        }
        Err(e) => error!("failed serializing calibration record: {e}"),
    }
}

fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Vec<T> {
    let Ok(file) = File::open(path) else { return Vec::new() };
    BufReader::new(file)
        .lines()
        .filter_map(|l| l.ok())
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(&l).ok())
        .collect()
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = rank - lower as f64;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

#[derive(Debug, Clone)]
pub struct ThresholdAnalysis {
    pub total_checks: u64,
    pub triggered_count: u64,
    pub trigger_rate: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl ThresholdAnalysis {
    pub fn recommendation(&self) -> &'static str {
        if self.trigger_rate > 0.10 {
            "trigger rate is high; threshold likely too loose"
        } else if self.trigger_rate < 0.01 {
            "trigger rate is low; threshold likely too tight or rarely relevant"
        } else {
            "trigger rate is within a reasonable range"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationRecommendation {
    pub threshold_name: String,
    pub new_value: f64,
    #[serde(skip)]
    pub confidence: Confidence,
    pub previous_trigger_rate: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct CalibratedEntry {
    value: f64,
    applied_at: f64,
    previous_value: Option<f64>,
    confidence: String,
}

/// Priority list the auto-calibrator checks first, matching the original's
/// hand-picked "most impactful" ordering before falling back to every other
/// threshold name alphabetically.
const PRIORITY_THRESHOLDS: [&str; 4] = [
    "quantum_rng.randomness_score.min",
    "earthquake.max_magnitude.trigger_above",
    "crypto.BTCUSDT.price.change_pct",
    "crypto.ETHUSDT.price.change_pct",
];

pub struct AutoCalibrator {
    tracker: Arc<CalibrationTracker>,
    dir: PathBuf,
    auto_apply: bool,
    last_check: Mutex<Option<f64>>,
}

impl AutoCalibrator {
    pub fn new(tracker: Arc<CalibrationTracker>, dir: impl Into<PathBuf>, auto_apply: bool) -> Self {
        let dir = dir.into();
        fs::create_dir_all(&dir).ok();
        Self {
            tracker,
            dir,
            auto_apply,
            last_check: Mutex::new(None),
        }
    }

    /// Runs at most once per 24h wall-clock and only once `min_days` have
    /// elapsed since the tracker started (and since the last calibration
    /// entry in history). Returns the recommendations produced this run.
    pub fn check_and_calibrate(&self) -> Vec<CalibrationRecommendation> {
        {
            let mut last = self.last_check.lock().unwrap();
            if let Some(prev) = *last {
                if now_unix() - prev < 86400.0 {
                    return Vec::new();
                }
            }
            *last = Some(now_unix());
        }

        if !self.tracker.ready_for_calibration() {
            info!("auto-calibrator: not ready, {:.1} days collected", self.tracker.days_collecting());
            return Vec::new();
        }

        if self.days_since_last_calibration() < MIN_DAYS {
            return Vec::new();
        }

        let names = self.thresholds_to_calibrate();
        let mut recommendations = Vec::new();
        for name in names {
            if let Some(rec) = self.calibrate_one(&name) {
                recommendations.push(rec);
            }
        }

        if !recommendations.is_empty() {
            self.save_report(&recommendations);
            self.append_history(&recommendations);
        }
        recommendations
    }

    fn thresholds_to_calibrate(&self) -> Vec<String> {
        let mut all = self.tracker.all_threshold_names();
        let mut ordered: Vec<String> = PRIORITY_THRESHOLDS
            .iter()
            .map(|s| s.to_string())
            .filter(|n| all.contains(n))
            .collect();
        all.retain(|n| !ordered.contains(n));
        ordered.extend(all);
        ordered
    }

    fn calibrate_one(&self, name: &str) -> Option<CalibrationRecommendation> {
        let analysis = self.tracker.analyze_threshold(name)?;
        if analysis.total_checks < MIN_OBSERVATIONS {
            return None;
        }
        let new_value = optimal_threshold(name, &analysis)?;
        let confidence = determine_confidence(&analysis);

        if self.auto_apply && confidence == Confidence::High {
            self.apply_calibration(name, new_value, confidence);
        }

        Some(CalibrationRecommendation {
            threshold_name: name.to_string(),
            new_value,
            confidence,
            previous_trigger_rate: analysis.trigger_rate,
        })
    }

    fn apply_calibration(&self, name: &str, value: f64, confidence: Confidence) {
        let path = self.dir.join("calibrated_thresholds.json");
        let mut existing: HashMap<String, CalibratedEntry> = fs::read_to_string(&path)
            .ok()
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or_default();
        let previous_value = existing.get(name).map(|e| e.value);
        existing.insert(
            name.to_string(),
            CalibratedEntry {
                value,
                applied_at: now_unix(),
                previous_value,
                confidence: confidence_str(confidence).to_string(),
            },
        );
        if let Ok(json) = serde_json::to_string_pretty(&existing) {
            if let Err(e) = fs::write(&path, json) {
                error!("failed writing calibrated_thresholds.json: {e}");
            }
        }
    }

    fn save_report(&self, recommendations: &[CalibrationRecommendation]) {
        let path = self
            .dir
            .join(format!("calibration_report_{}.json", now_unix() as u64));
        let report: Vec<Value> = recommendations
            .iter()
            .map(|r| {
                serde_json::json!({
                    "threshold_name": r.threshold_name,
                    "new_value": r.new_value,
                    "confidence": confidence_str(r.confidence),
                    "previous_trigger_rate": r.previous_trigger_rate,
                })
            })
            .collect();
        if let Ok(json) = serde_json::to_string_pretty(&report) {
            let _ = fs::write(path, json);
        }
    }

    fn append_history(&self, recommendations: &[CalibrationRecommendation]) {
        let path = self.dir.join("calibration_history.json");
        let mut history: Vec<Value> = fs::read_to_string(&path)
            .ok()
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or_default();
        history.push(serde_json::json!({
            "timestamp": now_unix(),
            "count": recommendations.len(),
        }));
        if let Ok(json) = serde_json::to_string_pretty(&history) {
            let _ = fs::write(&path, json);
        }
    }

    fn days_since_last_calibration(&self) -> f64 {
        let path = self.dir.join("calibration_history.json");
        let history: Vec<Value> = fs::read_to_string(&path)
            .ok()
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or_default();
        match history.last().and_then(|e| e.get("timestamp")).and_then(Value::as_f64) {
            Some(last) => (now_unix() - last) / 86400.0,
            None => MIN_DAYS,
        }
    }

    /// `(lastCalibration timestamp, totalCalibrations)` for the health
    /// endpoint's calibration summary (§6).
    pub fn history_stats(&self) -> (Option<f64>, u64) {
        let path = self.dir.join("calibration_history.json");
        let history: Vec<Value> = fs::read_to_string(&path)
            .ok()
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or_default();
        let last = history.last().and_then(|e| e.get("timestamp")).and_then(Value::as_f64);
        (last, history.len() as u64)
    }
}

fn confidence_str(c: Confidence) -> &'static str {
    match c {
        Confidence::Low => "low",
        Confidence::Medium => "medium",
        Confidence::High => "high",
    }
}

fn determine_confidence(analysis: &ThresholdAnalysis) -> Confidence {
    let off_target = analysis.trigger_rate > 2.0 * TARGET_TRIGGER_RATE
        || analysis.trigger_rate < 0.5 * TARGET_TRIGGER_RATE;
    if analysis.total_checks >= 5000 && off_target {
        Confidence::High
    } else if analysis.total_checks >= 2000 {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

/// Implements the suffix-driven table from the spec exactly: direction and
/// magnitude of the adjustment depend on both the threshold name's suffix
/// and how far off target the observed trigger rate is.
fn optimal_threshold(name: &str, a: &ThresholdAnalysis) -> Option<f64> {
    let rate = a.trigger_rate;
    let far_over = rate > 5.0 * TARGET_TRIGGER_RATE;
    let over = rate > 2.0 * TARGET_TRIGGER_RATE;
    let under = rate < 0.5 * TARGET_TRIGGER_RATE;

    let value = if name.ends_with(".min") {
        if over {
            if far_over { a.p90 } else { a.p95 }
        } else if under {
            a.p99
        } else {
            return None;
        }
    } else if name.ends_with(".max") {
        if over {
            if far_over { a.p90 } else { a.p95 }
        } else if under {
            a.p99
        } else {
            return None;
        }
    } else if name.ends_with(".trigger_above") {
        if over {
            a.p95
        } else if under {
            a.p90
        } else {
            return None;
        }
    } else if name.ends_with(".change_pct") {
        if over {
            a.p95
        } else if under {
            a.p90
        } else {
            return None;
        }
    } else if over || under {
        a.p95
    } else {
        return None;
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_linear_interpolation() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 50.0), 3.0);
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 100.0), 5.0);
    }

    #[test]
    fn confidence_requires_enough_checks_and_off_target_rate() {
        let a = ThresholdAnalysis {
            total_checks: 5000,
            triggered_count: 3750,
            trigger_rate: 0.75,
            min: 0.0,
            max: 1.0,
            p50: 0.5,
            p90: 0.80,
            p95: 0.85,
            p99: 0.70,
        };
        assert_eq!(determine_confidence(&a), Confidence::High);
    }

    #[test]
    fn optimal_threshold_min_suffix_lowers_on_far_over_trigger() {
        let a = ThresholdAnalysis {
            total_checks: 5000,
            triggered_count: 3750,
            trigger_rate: 0.75,
            min: 0.5,
            max: 1.0,
            p50: 0.9,
            p90: 0.80,
            p95: 0.85,
            p99: 0.95,
        };
        let value = optimal_threshold("quantum_rng.randomness_score.min", &a).unwrap();
        assert_eq!(value, a.p90);
    }

    #[test]
    fn recommendation_text_bands() {
        let a = ThresholdAnalysis {
            total_checks: 100,
            triggered_count: 15,
            trigger_rate: 0.15,
            min: 0.0,
            max: 1.0,
            p50: 0.5,
            p90: 0.8,
            p95: 0.9,
            p99: 0.95,
        };
        assert_eq!(a.recommendation(), "trigger rate is high; threshold likely too loose");
    }
}
