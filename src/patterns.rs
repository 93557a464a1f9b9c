//! Historical pattern tracker: accumulates an empirical joint distribution
//! of (condition, named-event) pairs and emits calibrated probabilities.
//!
//! This is the single largest component, grounded directly on
//! `analyzers/online/historical_pattern_tracker.py`: the named-event
//! catalog, the condition/pattern bookkeeping, the "honest matching"
//! idempotence rule, and the persisted files are all carried over in
//! meaning, re-expressed as data-driven Rust instead of inline Python
//! closures (see the design notes on rule objects as closures).

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::PathBuf;

use crate::types::now_unix;

const LOOKBACK_WINDOW_HOURS: f64 = 72.0;
const RECENT_CONDITIONS_CAP: usize = 5000;
const PRICE_HISTORY_CAP: usize = 10_000;
const LOCATION_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Crypto,
    Blockchain,
    Earthquake,
    SpaceWeather,
    /// Internal-only bookkeeping entries, never surfaced through
    /// `get_probabilities`.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
}

/// Data-driven predicate kinds. Each named event is one of these rather
/// than an inline closure, per the design notes' re-expression of the
/// original's ad hoc predicate methods.
#[derive(Debug, Clone)]
pub enum EventPredicate {
    PumpDump {
        coin: &'static str,
        direction: Direction,
        hours: f64,
        threshold_pct: f64,
    },
    FieldThresholdAbs {
        field: &'static str,
        min_abs: f64,
    },
    FieldThresholdAbove {
        field: &'static str,
        min: f64,
    },
    FieldThresholdBelow {
        field: &'static str,
        max: f64,
    },
    BlockchainBlockTime,
    KpOrWind {
        min_kp: f64,
        min_wind: Option<f64>,
    },
}

#[derive(Debug, Clone)]
pub struct NamedEventDef {
    pub name: &'static str,
    pub category: EventCategory,
    pub severity: &'static str,
    pub description: &'static str,
    pub predicate: EventPredicate,
}

fn catalog() -> Vec<NamedEventDef> {
    vec![
        // --- crypto: pump/dump at 1h/4h/24h, BTC and ETH ---
        ev("btc_pump_1h", EventCategory::Crypto, "medium", "BTC up sharply within 1h",
            EventPredicate::PumpDump { coin: "BTCUSDT", direction: Direction::Up, hours: 1.0, threshold_pct: 2.0 }),
        ev("btc_dump_1h", EventCategory::Crypto, "medium", "BTC down sharply within 1h",
            EventPredicate::PumpDump { coin: "BTCUSDT", direction: Direction::Down, hours: 1.0, threshold_pct: 2.0 }),
        ev("btc_pump_4h", EventCategory::Crypto, "medium", "BTC up sharply within 4h",
            EventPredicate::PumpDump { coin: "BTCUSDT", direction: Direction::Up, hours: 4.0, threshold_pct: 4.0 }),
        ev("btc_dump_4h", EventCategory::Crypto, "medium", "BTC down sharply within 4h",
            EventPredicate::PumpDump { coin: "BTCUSDT", direction: Direction::Down, hours: 4.0, threshold_pct: 4.0 }),
        ev("btc_pump_24h", EventCategory::Crypto, "high", "BTC up sharply within 24h",
            EventPredicate::PumpDump { coin: "BTCUSDT", direction: Direction::Up, hours: 24.0, threshold_pct: 7.0 }),
        ev("btc_dump_24h", EventCategory::Crypto, "high", "BTC down sharply within 24h",
            EventPredicate::PumpDump { coin: "BTCUSDT", direction: Direction::Down, hours: 24.0, threshold_pct: 7.0 }),
        ev("eth_pump_1h", EventCategory::Crypto, "medium", "ETH up sharply within 1h",
            EventPredicate::PumpDump { coin: "ETHUSDT", direction: Direction::Up, hours: 1.0, threshold_pct: 2.5 }),
        ev("eth_dump_1h", EventCategory::Crypto, "medium", "ETH down sharply within 1h",
            EventPredicate::PumpDump { coin: "ETHUSDT", direction: Direction::Down, hours: 1.0, threshold_pct: 2.5 }),
        ev("eth_pump_4h", EventCategory::Crypto, "medium", "ETH up sharply within 4h",
            EventPredicate::PumpDump { coin: "ETHUSDT", direction: Direction::Up, hours: 4.0, threshold_pct: 5.0 }),
        ev("eth_dump_4h", EventCategory::Crypto, "medium", "ETH down sharply within 4h",
            EventPredicate::PumpDump { coin: "ETHUSDT", direction: Direction::Down, hours: 4.0, threshold_pct: 5.0 }),
        ev("eth_pump_24h", EventCategory::Crypto, "high", "ETH up sharply within 24h",
            EventPredicate::PumpDump { coin: "ETHUSDT", direction: Direction::Up, hours: 24.0, threshold_pct: 10.0 }),
        ev("eth_dump_24h", EventCategory::Crypto, "high", "ETH down sharply within 24h",
            EventPredicate::PumpDump { coin: "ETHUSDT", direction: Direction::Down, hours: 24.0, threshold_pct: 10.0 }),
        ev("btc_volatility_high", EventCategory::Crypto, "high", "BTC 24h volatility is high",
            EventPredicate::FieldThresholdAbs { field: "btcusdt.price_change_24h_percent", min_abs: 2.5 }),
        ev("btc_volatility_medium", EventCategory::Crypto, "medium", "BTC 24h volatility is elevated",
            EventPredicate::FieldThresholdAbs { field: "btcusdt.price_change_24h_percent", min_abs: 1.5 }),
        // --- blockchain ---
        ev("blockchain_anomaly", EventCategory::Blockchain, "medium", "block time far exceeds expected",
            EventPredicate::BlockchainBlockTime),
        // --- earthquake ---
        ev("earthquake_moderate", EventCategory::Earthquake, "medium", "moderate earthquake (M>=5.0)",
            EventPredicate::FieldThresholdAbove { field: "max_magnitude", min: 5.0 }),
        ev("earthquake_strong", EventCategory::Earthquake, "high", "strong earthquake (M>=6.0)",
            EventPredicate::FieldThresholdAbove { field: "max_magnitude", min: 6.0 }),
        ev("earthquake_major", EventCategory::Earthquake, "critical", "major earthquake (M>=7.0)",
            EventPredicate::FieldThresholdAbove { field: "max_magnitude", min: 7.0 }),
        // --- space weather ---
        ev("solar_storm_moderate", EventCategory::SpaceWeather, "medium", "moderate geomagnetic storm",
            EventPredicate::KpOrWind { min_kp: 5.0, min_wind: Some(700.0) }),
        ev("solar_storm_strong", EventCategory::SpaceWeather, "high", "strong geomagnetic storm",
            EventPredicate::KpOrWind { min_kp: 7.0, min_wind: None }),
        ev("solar_storm_extreme", EventCategory::SpaceWeather, "critical", "extreme geomagnetic storm",
            EventPredicate::KpOrWind { min_kp: 9.0, min_wind: None }),
        // --- other: internal-only bookkeeping, never surfaced publicly ---
        ev("earthquake_significant", EventCategory::Other, "medium", "internal: significant earthquake",
            EventPredicate::FieldThresholdAbove { field: "max_magnitude", min: 5.5 }),
        ev("earthquake_moderate_old", EventCategory::Other, "medium", "internal: legacy moderate-earthquake duplicate",
            EventPredicate::FieldThresholdAbove { field: "max_magnitude", min: 5.0 }),
        ev("news_spike", EventCategory::Other, "low", "internal: news headline count spike",
            EventPredicate::FieldThresholdAbove { field: "headline_count", min: 50.0 }),
        ev("space_weather_storm", EventCategory::Other, "medium", "internal: legacy space weather storm bookkeeping",
            EventPredicate::FieldThresholdAbove { field: "kp_index", min: 5.0 }),
        ev("quantum_anomaly", EventCategory::Other, "low", "internal: quantum RNG below expected randomness",
            EventPredicate::FieldThresholdBelow { field: "randomness_score", max: 0.90 }),
    ]
}

fn ev(
    name: &'static str,
    category: EventCategory,
    severity: &'static str,
    description: &'static str,
    predicate: EventPredicate,
) -> NamedEventDef {
    NamedEventDef { name, category, severity, description, predicate }
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub timestamp: f64,
    pub level: u8,
    pub sources: Vec<String>,
    pub anomaly_index: f64,
    pub baseline_ratio: f64,
}

impl Condition {
    pub fn key(&self) -> String {
        let mut sources = self.sources.clone();
        sources.sort();
        format!("L{}_{}", self.level, sources.join("_"))
    }
}

#[derive(Debug, Clone)]
pub struct NamedEvent {
    pub timestamp: f64,
    pub event_type: String,
    pub location: Option<(f64, f64)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pattern {
    pub condition_count: u64,
    pub event_after_count: u64,
    pub avg_time_to_event: f64,
    #[serde(with = "infinity_as_null")]
    pub min_time_to_event: f64,
    pub max_time_to_event: f64,
    pub predicted_probability: f64,
    pub actual_probability: f64,
    pub brier_score: f64,
    pub event_locations: Vec<(f64, f64)>,
}

impl Pattern {
    fn new() -> Self {
        Self {
            min_time_to_event: f64::INFINITY,
            ..Default::default()
        }
    }

    fn update_probability(&mut self) {
        self.actual_probability = if self.condition_count == 0 {
            0.0
        } else {
            (self.event_after_count as f64 / self.condition_count as f64).min(1.0)
        };
    }

    fn update_brier_score(&mut self) {
        let diff = self.predicted_probability - self.actual_probability;
        self.brier_score = diff * diff;
    }
}

mod infinity_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, s: S) -> Result<S::Ok, S::Error> {
        if value.is_infinite() {
            Option::<f64>::None.serialize(s)
        } else {
            Some(*value).serialize(s)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::INFINITY))
    }
}

struct StoredCondition {
    condition: Condition,
    matched_events: HashSet<String>,
}

pub struct HistoricalPatternTracker {
    catalog: Vec<NamedEventDef>,
    recent_conditions: Mutex<VecDeque<StoredCondition>>,
    patterns: Mutex<HashMap<String, HashMap<String, Pattern>>>,
    price_history: Mutex<HashMap<&'static str, VecDeque<(f64, f64)>>>,
    persist_dir: PathBuf,
}

impl HistoricalPatternTracker {
    pub fn new(persist_dir: impl Into<PathBuf>) -> Self {
        let persist_dir = persist_dir.into();
        let tracker = Self {
            catalog: catalog(),
            recent_conditions: Mutex::new(VecDeque::new()),
            patterns: Mutex::new(HashMap::new()),
            price_history: Mutex::new(HashMap::new()),
            persist_dir,
        };
        tracker.load_patterns();
        tracker.load_recent_conditions();
        tracker
    }

    pub fn record_price(&self, coin: &'static str, timestamp: f64, price: f64) {
        let mut history = self.price_history.lock();
        let deque = history.entry(coin).or_default();
        deque.push_back((timestamp, price));
        while deque.len() > PRICE_HISTORY_CAP {
            deque.pop_front();
        }
    }

    /// Appends the condition and, for every catalog entry, increments that
    /// (conditionKey, eventType) pair's `condition_count`, recomputing
    /// `actual_probability` immediately after.
    pub fn record_condition(&self, condition: Condition) {
        let key = condition.key();
        {
            let mut patterns = self.patterns.lock();
            let by_event = patterns.entry(key.clone()).or_default();
            for def in &self.catalog {
                let pattern = by_event.entry(def.name.to_string()).or_insert_with(Pattern::new);
                pattern.condition_count += 1;
                pattern.update_probability();
                pattern.update_brier_score();
            }
        }
        let mut recent = self.recent_conditions.lock();
        recent.push_back(StoredCondition {
            condition,
            matched_events: HashSet::new(),
        });
        while recent.len() > RECENT_CONDITIONS_CAP {
            recent.pop_front();
        }
    }

    /// Evaluates every named-event predicate against a flattened reading
    /// and joins anything that fires with stored conditions.
    pub fn check_events(&self, source: &str, timestamp: f64, fields: &HashMap<String, Value>) -> Vec<NamedEvent> {
        let mut fired = Vec::new();
        for def in &self.catalog {
            if self.predicate_fires(def, source, timestamp, fields) {
                let event = NamedEvent {
                    timestamp,
                    event_type: def.name.to_string(),
                    location: None,
                };
                self.match_event(&event);
                fired.push(event);
            }
        }
        fired
    }

    fn predicate_fires(
        &self,
        def: &NamedEventDef,
        source: &str,
        timestamp: f64,
        fields: &HashMap<String, Value>,
    ) -> bool {
        match &def.predicate {
            EventPredicate::PumpDump { coin, direction, hours, threshold_pct } => {
                if source != "crypto" {
                    return false;
                }
                let Some(price) = fields.get(&format!("{}.price", coin.to_lowercase())).and_then(Value::as_f64) else {
                    return false;
                };
                self.record_price(coin, timestamp, price);
                let target = timestamp - hours * 3600.0;
                let history = self.price_history.lock();
                let Some(deque) = history.get(coin) else { return false };
                let Some((_, old_price)) = deque.iter().find(|(ts, _)| *ts <= target) else {
                    return false;
                };
                if *old_price == 0.0 {
                    return false;
                }
                let change_pct = (price - old_price) / old_price * 100.0;
                match direction {
                    Direction::Up => change_pct >= *threshold_pct,
                    Direction::Down => change_pct <= -*threshold_pct,
                }
            }
            EventPredicate::FieldThresholdAbs { field, min_abs } => {
                fields.get(*field).and_then(Value::as_f64).map(|v| v.abs() >= *min_abs).unwrap_or(false)
            }
            EventPredicate::FieldThresholdAbove { field, min } => {
                fields.get(*field).and_then(Value::as_f64).map(|v| v >= *min).unwrap_or(false)
            }
            EventPredicate::FieldThresholdBelow { field, max } => {
                fields.get(*field).and_then(Value::as_f64).map(|v| v < *max).unwrap_or(false)
            }
            EventPredicate::BlockchainBlockTime => {
                let Some(block_time) = fields.get("block_time_seconds").and_then(Value::as_f64) else { return false };
                let Some(expected) = fields.get("expected_block_time_seconds").and_then(Value::as_f64) else { return false };
                expected > 0.0 && block_time >= 2.0 * expected
            }
            EventPredicate::KpOrWind { min_kp, min_wind } => {
                let kp = fields.get("kp_index").and_then(Value::as_f64).unwrap_or(0.0);
                if kp >= *min_kp {
                    return true;
                }
                if let Some(min_wind) = min_wind {
                    let wind = fields.get("wind_speed").and_then(Value::as_f64).unwrap_or(0.0);
                    if wind >= *min_wind {
                        return true;
                    }
                }
                false
            }
        }
    }

    /// "Honest matching": each stored condition counts at most once per
    /// event type, regardless of how many times that event type fires
    /// inside the lookback window.
    fn match_event(&self, event: &NamedEvent) {
        let mut recent = self.recent_conditions.lock();
        let mut patterns = self.patterns.lock();
        for stored in recent.iter_mut() {
            let time_diff = event.timestamp - stored.condition.timestamp;
            if time_diff <= 0.0 || time_diff >= LOOKBACK_WINDOW_HOURS * 3600.0 {
                continue;
            }
            if stored.matched_events.contains(&event.event_type) {
                continue;
            }

            let key = stored.condition.key();
            let Some(pattern) = patterns.get_mut(&key).and_then(|m| m.get_mut(&event.event_type)) else {
                continue;
            };
            pattern.event_after_count += 1;
            if let Some(loc) = event.location {
                pattern.event_locations.push(loc);
                if pattern.event_locations.len() > LOCATION_CAP {
                    pattern.event_locations.remove(0);
                }
            }
            let n = pattern.event_after_count as f64;
            let hours = time_diff / 3600.0;
            pattern.min_time_to_event = pattern.min_time_to_event.min(hours);
            pattern.max_time_to_event = pattern.max_time_to_event.max(hours);
            pattern.avg_time_to_event = (pattern.avg_time_to_event * (n - 1.0) + hours) / n;
            pattern.update_probability();
            pattern.update_brier_score();

            stored.matched_events.insert(event.event_type.clone());
        }
    }

    /// Returns calibrated probabilities for the current condition, applying
    /// all the suppression/precision filters the original enforces.
    pub fn get_probabilities(
        &self,
        condition: &Condition,
        min_observations: u64,
        category_filter: Option<EventCategory>,
    ) -> Vec<PatternSummary> {
        let key = condition.key();
        let patterns = self.patterns.lock();
        let Some(by_event) = patterns.get(&key) else { return Vec::new() };

        let mut out = Vec::new();
        for def in &self.catalog {
            if def.category == EventCategory::Other {
                continue;
            }
            if def.name == "earthquake_moderate" {
                continue;
            }
            if let Some(filter) = category_filter {
                if def.category != filter {
                    continue;
                }
            }
            let Some(pattern) = by_event.get(def.name) else { continue };
            if pattern.condition_count < min_observations || pattern.actual_probability <= 0.0 {
                continue;
            }
            if def.category == EventCategory::Earthquake {
                let width = pattern.max_time_to_event - pattern.min_time_to_event;
                if width >= 12.0 {
                    continue;
                }
            }
            out.push(PatternSummary {
                event_type: def.name.to_string(),
                probability: pattern.actual_probability,
                avg_time_hours: pattern.avg_time_to_event,
                min_time_hours: pattern.min_time_to_event,
                max_time_hours: pattern.max_time_to_event,
                observations: pattern.condition_count,
                occurrences: pattern.event_after_count,
                description: def.description.to_string(),
                severity: def.severity.to_string(),
                category: def.category,
            });
        }
        out
    }

    pub fn get_calibration_stats(&self) -> CalibrationStats {
        let patterns = self.patterns.lock();
        let mut total = 0u64;
        let mut well_calibrated = 0u64;
        let mut brier_sum = 0.0;
        for by_event in patterns.values() {
            for pattern in by_event.values() {
                if pattern.condition_count < 5 {
                    continue;
                }
                total += 1;
                brier_sum += pattern.brier_score;
                if pattern.brier_score < 0.1 {
                    well_calibrated += 1;
                }
            }
        }
        CalibrationStats {
            total_patterns: total,
            avg_brier_score: if total > 0 { brier_sum / total as f64 } else { 0.0 },
            well_calibrated_percent: if total > 0 {
                well_calibrated as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    pub fn save(&self) {
        self.save_patterns();
        self.save_recent_conditions();
    }

    fn save_patterns(&self) {
        let patterns = self.patterns.lock();
        let path = self.persist_dir.join("patterns.json");
        fs::create_dir_all(&self.persist_dir).ok();
        if let Ok(json) = serde_json::to_string_pretty(&*patterns) {
            let _ = fs::write(path, json);
        }
    }

    fn load_patterns(&self) {
        let path = self.persist_dir.join("patterns.json");
        if let Ok(text) = fs::read_to_string(&path) {
            if let Ok(parsed) = serde_json::from_str(&text) {
                *self.patterns.lock() = parsed;
            }
        }
    }

    fn save_recent_conditions(&self) {
        let recent = self.recent_conditions.lock();
        let serializable: Vec<StoredConditionDto> = recent
            .iter()
            .map(|s| StoredConditionDto {
                timestamp: s.condition.timestamp,
                level: s.condition.level,
                sources: s.condition.sources.clone(),
                anomaly_index: s.condition.anomaly_index,
                baseline_ratio: s.condition.baseline_ratio,
                matched_events: s.matched_events.iter().cloned().collect(),
            })
            .collect();
        let path = self.persist_dir.join("recent_conditions.json");
        fs::create_dir_all(&self.persist_dir).ok();
        if let Ok(json) = serde_json::to_string_pretty(&serializable) {
            let _ = fs::write(path, json);
        }
    }

    fn load_recent_conditions(&self) {
        let path = self.persist_dir.join("recent_conditions.json");
        let Ok(text) = fs::read_to_string(&path) else { return };
        let Ok(parsed) = serde_json::from_str::<Vec<StoredConditionDto>>(&text) else { return };
        let now = now_unix();
        let cutoff = now - LOOKBACK_WINDOW_HOURS * 3600.0;
        let mut recent = self.recent_conditions.lock();
        for dto in parsed {
            if dto.timestamp < cutoff {
                continue;
            }
            recent.push_back(StoredCondition {
                condition: Condition {
                    timestamp: dto.timestamp,
                    level: dto.level,
                    sources: dto.sources,
                    anomaly_index: dto.anomaly_index,
                    baseline_ratio: dto.baseline_ratio,
                },
                matched_events: dto.matched_events.into_iter().collect(),
            });
        }
    }

    /// Backfills BTC/ETH price history from the last few days of JSONL
    /// crypto logs, so pump/dump matching works immediately after a
    /// restart instead of needing a fresh 24h of live data first.
    pub fn backfill_price_history(&self, store: &crate::store::JsonlStore) {
        let now = now_unix();
        let cutoff_days = (LOOKBACK_WINDOW_HOURS / 24.0).ceil() as i64;
        let mut dates: Vec<String> = store.get_available_dates("crypto");
        dates.sort();
        dates.reverse();
        dates.truncate(cutoff_days.max(1) as usize + 1);
        dates.reverse();
        if dates.is_empty() {
            return;
        }
        let start = dates.first().unwrap().clone();
        let end = dates.last().unwrap().clone();
        for record in store.read("crypto", &start, &end) {
            let Some(ts) = record.get("timestamp").and_then(Value::as_f64) else { continue };
            if now - ts > LOOKBACK_WINDOW_HOURS * 3600.0 {
                continue;
            }
            if let Some(price) = record.get("btcusdt.price").and_then(Value::as_f64) {
                self.record_price("BTCUSDT", ts, price);
            }
            if let Some(path) = record.get("ethusdt.price").and_then(Value::as_f64) {
                self.record_price("ETHUSDT", ts, path);
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredConditionDto {
    timestamp: f64,
    level: u8,
    sources: Vec<String>,
    anomaly_index: f64,
    baseline_ratio: f64,
    matched_events: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PatternSummary {
    pub event_type: String,
    pub probability: f64,
    pub avg_time_hours: f64,
    pub min_time_hours: f64,
    pub max_time_hours: f64,
    pub observations: u64,
    pub occurrences: u64,
    pub description: String,
    pub severity: String,
    pub category: EventCategory,
}

#[derive(Debug, Clone)]
pub struct CalibrationStats {
    pub total_patterns: u64,
    pub avg_brier_score: f64,
    pub well_calibrated_percent: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_dir(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("patterns_test_{tag}_{}", now_unix() as u64));
        fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn condition_key_sorts_sources() {
        let c = Condition {
            timestamp: 0.0,
            level: 3,
            sources: vec!["quantum_rng".into(), "crypto".into(), "earthquake".into()],
            anomaly_index: 50.0,
            baseline_ratio: 2.0,
        };
        assert_eq!(c.key(), "L3_crypto_earthquake_quantum_rng");
    }

    #[test]
    fn recording_condition_increments_every_catalog_entry() {
        let tracker = HistoricalPatternTracker::new(tmp_dir("record"));
        let condition = Condition {
            timestamp: 0.0,
            level: 3,
            sources: vec!["crypto".into(), "earthquake".into(), "quantum_rng".into()],
            anomaly_index: 50.0,
            baseline_ratio: 2.0,
        };
        for i in 0..10 {
            tracker.record_condition(Condition { timestamp: i as f64 * 100.0, ..condition.clone() });
        }
        let patterns = tracker.patterns.lock();
        let by_event = &patterns[&condition.key()];
        assert_eq!(by_event["btc_pump_1h"].condition_count, 10);
    }

    #[test]
    fn match_is_idempotent_per_condition() {
        let tracker = HistoricalPatternTracker::new(tmp_dir("idempotent"));
        let condition = Condition {
            timestamp: 0.0,
            level: 3,
            sources: vec!["crypto".into(), "earthquake".into(), "quantum_rng".into()],
            anomaly_index: 50.0,
            baseline_ratio: 2.0,
        };
        tracker.record_condition(condition.clone());
        let event = NamedEvent { timestamp: 100.0, event_type: "btc_pump_1h".to_string(), location: None };
        tracker.match_event(&event);
        tracker.match_event(&event);
        let patterns = tracker.patterns.lock();
        let pattern = &patterns[&condition.key()]["btc_pump_1h"];
        assert_eq!(pattern.event_after_count, 1);
    }

    #[test]
    fn earthquake_moderate_is_suppressed_from_probabilities() {
        let tracker = HistoricalPatternTracker::new(tmp_dir("suppressed"));
        let condition = Condition {
            timestamp: 0.0,
            level: 2,
            sources: vec!["earthquake".into(), "crypto".into()],
            anomaly_index: 50.0,
            baseline_ratio: 2.0,
        };
        for i in 0..6 {
            tracker.record_condition(Condition { timestamp: i as f64, ..condition.clone() });
        }
        let event = NamedEvent { timestamp: 100.0, event_type: "earthquake_moderate".to_string(), location: None };
        tracker.match_event(&event);
        let probs = tracker.get_probabilities(&condition, 5, None);
        assert!(!probs.iter().any(|p| p.event_type == "earthquake_moderate"));
    }

    #[test]
    fn other_category_never_surfaced() {
        let tracker = HistoricalPatternTracker::new(tmp_dir("other"));
        let condition = Condition {
            timestamp: 0.0,
            level: 1,
            sources: vec!["crypto".into()],
            anomaly_index: 10.0,
            baseline_ratio: 1.0,
        };
        for i in 0..10 {
            tracker.record_condition(Condition { timestamp: i as f64, ..condition.clone() });
        }
        let probs = tracker.get_probabilities(&condition, 5, None);
        assert!(!probs.iter().any(|p| p.category == EventCategory::Other));
    }

    #[test]
    fn min_time_to_event_serializes_infinity_as_null() {
        let pattern = Pattern::new();
        let json = serde_json::to_string(&pattern).unwrap();
        assert!(json.contains("\"min_time_to_event\":null"));
        let back: Pattern = serde_json::from_str(&json).unwrap();
        assert!(back.min_time_to_event.is_infinite());
    }
}
