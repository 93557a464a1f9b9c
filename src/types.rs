//! Core type definitions shared across the pipeline.
//!
//! Mirrors the original system's data model: `Event`s flow through the
//! event bus, `SensorReading`s are what a sample source produces, and
//! `AnomalyEvent`s are what the threshold detector derives from them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Data,
    Anomaly,
    Error,
    Health,
    Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    Running,
    Stopped,
    Error,
    RateLimited,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Qualitative severity used on `AnomalyEvent.metadata` and summed by the
/// anomaly-index aggregator. Distinct scale from [`Severity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AnomalySeverity {
    pub fn score(self) -> f64 {
        match self {
            AnomalySeverity::Low => 10.0,
            AnomalySeverity::Medium => 30.0,
            AnomalySeverity::High => 50.0,
            AnomalySeverity::Critical => 100.0,
        }
    }

    pub fn z_score(self) -> f64 {
        match self {
            AnomalySeverity::Low => 5.0,
            AnomalySeverity::Medium => 7.0,
            AnomalySeverity::High => 10.0,
            AnomalySeverity::Critical => 15.0,
        }
    }

    /// Fallback mapping when no explicit severity metadata is present.
    pub fn from_z_score(z: f64) -> Self {
        let z = z.abs();
        if z > 5.0 {
            AnomalySeverity::High
        } else if z > 3.0 {
            AnomalySeverity::Medium
        } else {
            AnomalySeverity::Low
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: f64,
    pub source: String,
    pub event_type: EventType,
    pub payload: HashMap<String, Value>,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

fn default_severity() -> Severity {
    Severity::Info
}

impl Event {
    pub fn create(
        source: impl Into<String>,
        event_type: EventType,
        payload: HashMap<String, Value>,
        severity: Severity,
        metadata: Option<HashMap<String, Value>>,
    ) -> Self {
        Self {
            timestamp: now_unix(),
            source: source.into(),
            event_type,
            payload,
            severity,
            metadata,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    pub timestamp: f64,
    pub source: String,
    pub data: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

const RESERVED_KEYS: [&str; 2] = ["timestamp", "source"];

impl SensorReading {
    pub fn create(
        source: impl Into<String>,
        data: HashMap<String, Value>,
        metadata: Option<HashMap<String, Value>>,
    ) -> Self {
        Self {
            timestamp: now_unix(),
            source: source.into(),
            data,
            metadata,
        }
    }

    /// Flattens into a bus payload, prefixing any data field that collides
    /// with a reserved `Event`/`Event`-adjacent key. Mirrors the original's
    /// `data_*` prefixing so downstream consumers never see ambiguous keys.
    pub fn to_payload(&self) -> HashMap<String, Value> {
        let mut out = HashMap::with_capacity(self.data.len() + 1);
        out.insert("source".to_string(), Value::String(self.source.clone()));
        for (k, v) in &self.data {
            if RESERVED_KEYS.contains(&k.as_str()) {
                out.insert(format!("data_{k}"), v.clone());
            } else {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }

    pub fn to_event(&self) -> Event {
        Event {
            timestamp: self.timestamp,
            source: self.source.clone(),
            event_type: EventType::Data,
            payload: self.to_payload(),
            severity: Severity::Info,
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub timestamp: f64,
    pub parameter: String,
    pub value: f64,
    pub mean: f64,
    pub std: f64,
    pub z_score: f64,
    pub sensor_source: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl AnomalyEvent {
    pub fn severity(&self) -> AnomalySeverity {
        match self.metadata.get("severity").and_then(Value::as_str) {
            Some("low") => AnomalySeverity::Low,
            Some("medium") => AnomalySeverity::Medium,
            Some("high") => AnomalySeverity::High,
            Some("critical") => AnomalySeverity::Critical,
            _ => AnomalySeverity::from_z_score(self.z_score),
        }
    }

    pub fn to_event(&self) -> Event {
        let severity = if self.z_score.abs() < 5.0 {
            Severity::Warning
        } else {
            Severity::Critical
        };
        let mut payload = HashMap::new();
        payload.insert("source".into(), Value::String("anomaly_detector".into()));
        payload.insert("parameter".into(), Value::String(self.parameter.clone()));
        payload.insert("value".into(), serde_json::json!(self.value));
        payload.insert("mean".into(), serde_json::json!(self.mean));
        payload.insert("std".into(), serde_json::json!(self.std));
        payload.insert("z_score".into(), serde_json::json!(self.z_score));
        payload.insert(
            "sensor_source".into(),
            Value::String(self.sensor_source.clone()),
        );
        Event {
            timestamp: self.timestamp,
            source: "anomaly_detector".to_string(),
            event_type: EventType::Anomaly,
            payload,
            severity,
            metadata: Some(self.metadata.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub name: String,
    pub last_run: Option<f64>,
    pub next_run: Option<f64>,
    pub run_count: u64,
    pub error_count: u64,
    pub avg_duration_ms: f64,
    pub last_drift_ms: f64,
    pub consecutive_failures: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_keys_are_prefixed() {
        let mut data = HashMap::new();
        data.insert("source".to_string(), Value::String("inner".into()));
        data.insert("value".to_string(), serde_json::json!(1.0));
        let reading = SensorReading::create("crypto", data, None);
        let payload = reading.to_payload();
        assert_eq!(payload.get("data_source"), Some(&Value::String("inner".into())));
        assert_eq!(payload.get("source"), Some(&Value::String("crypto".into())));
        assert!(payload.contains_key("value"));
    }

    #[test]
    fn anomaly_severity_falls_back_to_z_score() {
        let ev = AnomalyEvent {
            timestamp: 0.0,
            parameter: "x".into(),
            value: 1.0,
            mean: 0.0,
            std: 1.0,
            z_score: 6.0,
            sensor_source: "s".into(),
            metadata: HashMap::new(),
        };
        assert_eq!(ev.severity(), AnomalySeverity::High);
    }
}
