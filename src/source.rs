//! Sample-source contract: the uniform interface the rest of the pipeline
//! expects from any external signal producer.
//!
//! Concrete sources (crypto tickers, earthquake feeds, ...) are out of
//! scope; this module defines the contract plus one reference source used
//! by tests and the composition root's demo wiring, modeled on
//! `component_a/sensor.rs`'s simulated periodic sampling.

use log::warn;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crate::bus::EventBus;
use crate::error::SourceError;
use crate::types::{Event, EventType, Priority, Severity, SensorReading};

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub enabled: bool,
    pub interval_seconds: f64,
    pub priority: Priority,
    pub custom_params: HashMap<String, serde_json::Value>,
    pub max_retries: u32,
    pub retry_delay_secs: f64,
    pub timeout_secs: f64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 5.0,
            priority: Priority::Medium,
            custom_params: HashMap::new(),
            max_retries: 3,
            retry_delay_secs: 1.0,
            timeout_secs: 30.0,
        }
    }
}

pub enum FieldType {
    Number,
    String,
    Bool,
}

/// Object-safe contract every sample source implements. `collect` is
/// synchronous on purpose: the scheduler already isolates each task on
/// its own worker, so a source blocking on I/O only holds up itself.
pub trait SampleSource: Send + Sync {
    fn name(&self) -> &str;
    fn collect(&self) -> Result<SensorReading, SourceError>;
    fn schema(&self) -> &'static [(&'static str, FieldType)];
}

pub fn validate_reading(source: &dyn SampleSource, reading: &SensorReading) -> Vec<String> {
    let mut errors = Vec::new();
    for (field, expected) in source.schema() {
        match reading.data.get(*field) {
            None => errors.push(format!("missing field: {field}")),
            Some(value) => {
                let ok = match expected {
                    FieldType::Number => value.is_number(),
                    FieldType::String => value.is_string(),
                    FieldType::Bool => value.is_boolean(),
                };
                if !ok {
                    errors.push(format!("field {field}: unexpected type"));
                }
            }
        }
    }
    errors
}

/// Wraps a source with retry-with-backoff and event-bus publication,
/// exactly as `sensors/base.py`'s `safe_collect` does. Returns the reading
/// on success so callers (e.g. the threshold detector) can act on it
/// immediately, without round-tripping through the bus.
pub fn safe_collect(
    source: &dyn SampleSource,
    config: &SourceConfig,
    bus: &EventBus,
    consecutive_errors: &AtomicU64,
) -> Option<SensorReading> {
    let mut last_error: Option<SourceError> = None;

    for attempt in 0..config.max_retries {
        match source.collect() {
            Ok(reading) => {
                consecutive_errors.store(0, Ordering::Relaxed);
                bus.publish(&reading.to_event());
                return Some(reading);
            }
            Err(e) => {
                consecutive_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "source '{}' collection failed (attempt {}): {e}",
                    source.name(),
                    attempt + 1
                );
                last_error = Some(e);
                if attempt + 1 < config.max_retries {
                    thread::sleep(Duration::from_secs_f64(
                        config.retry_delay_secs * (attempt as f64 + 1.0),
                    ));
                }
            }
        }
    }

    let mut payload = HashMap::new();
    payload.insert(
        "error".to_string(),
        serde_json::Value::String(last_error.map(|e| e.to_string()).unwrap_or_default()),
    );
    payload.insert(
        "consecutive_errors".to_string(),
        serde_json::json!(consecutive_errors.load(Ordering::Relaxed)),
    );
    bus.publish(&Event::create(
        source.name(),
        EventType::Error,
        payload,
        Severity::Warning,
        None,
    ));
    None
}

/// Synthetic source used only by tests and demo wiring: a bounded random
/// walk around a base value, the same shape as the teacher's simulated
/// Force/Position/Temperature sensors.
pub struct SyntheticSource {
    name: String,
    base_value: f64,
    noise: (f64, f64),
}

impl SyntheticSource {
    pub fn new(name: impl Into<String>, base_value: f64, noise: (f64, f64)) -> Self {
        Self {
            name: name.into(),
            base_value,
            noise,
        }
    }
}

impl SampleSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn collect(&self) -> Result<SensorReading, SourceError> {
        let mut rng = rand::rng();
        let value = self.base_value + rng.random_range(self.noise.0..self.noise.1);
        let mut data = HashMap::new();
        data.insert("value".to_string(), serde_json::json!(value));
        Ok(SensorReading::create(self.name.clone(), data, None))
    }

    fn schema(&self) -> &'static [(&'static str, FieldType)] {
        &[("value", FieldType::Number)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_source_produces_numeric_reading() {
        let source = SyntheticSource::new("demo", 10.0, (-1.0, 1.0));
        let reading = source.collect().unwrap();
        let errors = validate_reading(&source, &reading);
        assert!(errors.is_empty());
    }

    #[test]
    fn safe_collect_retries_then_emits_error_event() {
        struct AlwaysFails;
        impl SampleSource for AlwaysFails {
            fn name(&self) -> &str {
                "broken"
            }
            fn collect(&self) -> Result<SensorReading, SourceError> {
                Err(SourceError::Transient("nope".into()))
            }
            fn schema(&self) -> &'static [(&'static str, FieldType)] {
                &[]
            }
        }
        let bus = EventBus::new(10);
        let config = SourceConfig {
            max_retries: 2,
            retry_delay_secs: 0.0,
            ..Default::default()
        };
        let consecutive = AtomicU64::new(0);
        let result = safe_collect(&AlwaysFails, &config, &bus, &consecutive);
        assert!(result.is_none());
        assert_eq!(consecutive.load(Ordering::Relaxed), 2);
        assert_eq!(bus.stats().total_published, 1);
    }
}
