//! Prediction sink: renders the pattern tracker's current probabilities for
//! the active condition into `logs/predictions/current.json` (§6).
//!
//! Unlike `patterns.rs`'s `save_patterns`/`save_recent_conditions` (plain
//! `fs::write`, tolerable for append-like state), this file is read by an
//! external consumer expecting a consistent whole, so it's written to a
//! temp file and renamed into place.

use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::patterns::PatternSummary;
use crate::types::now_unix;

const MAX_AGE_SECONDS: f64 = 24.0 * 3600.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub condition: String,
    pub condition_level: u8,
    pub condition_sources: Vec<String>,
    pub event: String,
    pub description: String,
    pub probability: u32,
    pub avg_time_hours: f64,
    pub observations: u64,
    pub occurrences: u64,
    pub category: String,
    pub icon: String,
    pub color: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PredictionFile {
    pub predictions: Vec<Prediction>,
    pub last_update: f64,
    pub last_update_str: String,
}

fn icon_for(category: &str) -> &'static str {
    match category {
        "crypto" => "coin",
        "blockchain" => "link",
        "earthquake" => "seismograph",
        "space_weather" => "sun",
        _ => "bell",
    }
}

fn color_for(severity: &str) -> &'static str {
    match severity {
        "critical" => "#d32f2f",
        "high" => "#f57c00",
        "medium" => "#fbc02d",
        _ => "#388e3c",
    }
}

fn format_unix(timestamp: f64) -> String {
    let days = (timestamp / 86_400.0).floor() as i64;
    let secs_of_day = (timestamp - days as f64 * 86_400.0).round() as i64;
    let (y, m, d) = crate::store::civil_from_days(days);
    let h = secs_of_day / 3600;
    let mi = (secs_of_day % 3600) / 60;
    let s = secs_of_day % 60;
    format!("{y:04}-{m:02}-{d:02} {h:02}:{mi:02}:{s:02} UTC")
}

/// Builds the on-disk prediction list from a batch of `(condition key,
/// condition level, condition sources, summaries)` tuples, one per active
/// condition the caller currently holds.
pub fn build_predictions(
    entries: &[(String, u8, Vec<String>, Vec<PatternSummary>)],
    now: f64,
) -> Vec<Prediction> {
    let mut predictions = Vec::new();
    for (condition_key, level, sources, summaries) in entries {
        for summary in summaries {
            if summary.event_type == "earthquake_moderate" {
                continue;
            }
            let category = serde_json::to_value(summary.category)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "other".to_string());
            predictions.push(Prediction {
                id: format!("{condition_key}:{}", summary.event_type),
                condition: condition_key.clone(),
                condition_level: *level,
                condition_sources: sources.clone(),
                event: summary.event_type.clone(),
                description: summary.description.clone(),
                probability: (summary.probability * 100.0).round() as u32,
                avg_time_hours: summary.avg_time_hours,
                observations: summary.observations,
                occurrences: summary.occurrences,
                icon: icon_for(&category).to_string(),
                color: color_for(&summary.severity).to_string(),
                category,
                timestamp: now,
            });
        }
    }
    predictions
}

/// Prunes predictions older than 24h and any `earthquake_moderate` entry
/// that slipped in from a stale file written before that rule existed,
/// then atomically replaces `{dir}/current.json`.
pub fn write_predictions(dir: &Path, mut predictions: Vec<Prediction>, now: f64) {
    predictions.retain(|p| now - p.timestamp <= MAX_AGE_SECONDS && p.event != "earthquake_moderate");

    let file = PredictionFile {
        predictions,
        last_update: now,
        last_update_str: format_unix(now),
    };

    if let Err(e) = fs::create_dir_all(dir) {
        warn!("failed to create predictions dir {dir:?}: {e}");
        return;
    }

    let final_path = dir.join("current.json");
    let tmp_path: PathBuf = dir.join("current.json.tmp");

    let json = match serde_json::to_string_pretty(&file) {
        Ok(j) => j,
        Err(e) => {
            warn!("failed to serialize predictions: {e}");
            return;
        }
    };

    if let Err(e) = fs::write(&tmp_path, json) {
        warn!("failed to write predictions temp file {tmp_path:?}: {e}");
        return;
    }
    if let Err(e) = fs::rename(&tmp_path, &final_path) {
        warn!("failed to rename predictions temp file into place: {e}");
    }
}

/// Reads back the last-written prediction file, used by tests and by the
/// health endpoint to report `last_update` without holding a live handle
/// to the tracker.
pub fn read_predictions(dir: &Path) -> Option<PredictionFile> {
    let text = fs::read_to_string(dir.join("current.json")).ok()?;
    serde_json::from_str(&text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::EventCategory;

    fn summary(event_type: &str, category: EventCategory, probability: f64) -> PatternSummary {
        PatternSummary {
            event_type: event_type.to_string(),
            probability,
            avg_time_hours: 6.0,
            min_time_hours: 1.0,
            max_time_hours: 10.0,
            observations: 20,
            occurrences: 4,
            description: "test event".to_string(),
            severity: "high".to_string(),
            category,
        }
    }

    #[test]
    fn earthquake_moderate_excluded_from_build() {
        let entries = vec![(
            "L1_earthquake".to_string(),
            1u8,
            vec!["earthquake".to_string()],
            vec![summary("earthquake_moderate", EventCategory::Earthquake, 0.5)],
        )];
        let predictions = build_predictions(&entries, 1_000.0);
        assert!(predictions.is_empty());
    }

    #[test]
    fn probability_rendered_as_integer_percent() {
        let entries = vec![(
            "L1_crypto".to_string(),
            1u8,
            vec!["crypto".to_string()],
            vec![summary("btc_pump_4h", EventCategory::Crypto, 0.37)],
        )];
        let predictions = build_predictions(&entries, 1_000.0);
        assert_eq!(predictions[0].probability, 37);
    }

    #[test]
    fn write_then_read_round_trips_and_prunes_stale_entries() {
        let dir = std::env::temp_dir().join(format!("predictions_test_{}", now_unix() as u64));
        let fresh = Prediction {
            id: "a".to_string(),
            condition: "L1_crypto".to_string(),
            condition_level: 1,
            condition_sources: vec!["crypto".to_string()],
            event: "btc_pump_4h".to_string(),
            description: "d".to_string(),
            probability: 42,
            avg_time_hours: 3.0,
            observations: 10,
            occurrences: 2,
            category: "crypto".to_string(),
            icon: "coin".to_string(),
            color: "#f57c00".to_string(),
            timestamp: 100_000.0,
        };
        let mut stale = fresh.clone();
        stale.id = "b".to_string();
        stale.timestamp = 0.0;

        write_predictions(&dir, vec![fresh.clone(), stale], 100_000.0 + 60.0);

        let read_back = read_predictions(&dir).unwrap();
        assert_eq!(read_back.predictions.len(), 1);
        assert_eq!(read_back.predictions[0].id, "a");

        fs::remove_dir_all(&dir).ok();
    }
}
