//! Root configuration schema, loaded once at startup and clamped field by
//! field.
//!
//! Grounded on `original_source/src/config/schema.py`'s dataclasses: every
//! `__post_init__` range check there becomes a `clamp`-and-`warn!` call here.
//! Out-of-range values are never fatal -- a bad field falls back to a safe
//! default and startup continues, matching the original's validation model.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::types::Priority;

fn clamp_field<T: PartialOrd + Copy + std::fmt::Display>(
    name: &str,
    value: T,
    min: T,
    max: T,
) -> T {
    if value < min {
        warn!("config field '{name}' = {value} below minimum, clamped to {min}");
        min
    } else if value > max {
        warn!("config field '{name}' = {value} above maximum, clamped to {max}");
        max
    } else {
        value
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub enabled: bool,
    pub interval_seconds: f64,
    pub priority: String,
    pub custom_params: HashMap<String, serde_json::Value>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 5.0,
            priority: "medium".to_string(),
            custom_params: HashMap::new(),
        }
    }
}

impl SensorConfig {
    fn validate(&mut self, name: &str) {
        self.interval_seconds = clamp_field(
            &format!("sensors.{name}.interval_seconds"),
            self.interval_seconds,
            0.1,
            3600.0,
        );
        if !matches!(self.priority.as_str(), "high" | "medium" | "low") {
            warn!("sensors.{name}.priority '{}' invalid, defaulting to medium", self.priority);
            self.priority = "medium".to_string();
        }
    }

    pub fn priority(&self) -> Priority {
        match self.priority.as_str() {
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub base_path: String,
    pub compression: bool,
    pub max_file_size_mb: u64,
    pub buffer_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: "logs".to_string(),
            compression: false,
            max_file_size_mb: 100,
            buffer_size: 1000,
        }
    }
}

impl StorageConfig {
    fn validate(&mut self) {
        self.max_file_size_mb = clamp_field("storage.max_file_size_mb", self.max_file_size_mb, 1, 10_000);
        self.buffer_size = clamp_field("storage.buffer_size", self.buffer_size, 1, 100_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub window_size: usize,
    pub z_score_threshold: f64,
    pub lag_range_seconds: u64,
    pub cluster_window_seconds: f64,
    pub correlation_threshold: f64,
    pub precursor_threshold: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            z_score_threshold: 4.0,
            lag_range_seconds: 60,
            cluster_window_seconds: 30.0,
            correlation_threshold: 0.7,
            precursor_threshold: 0.3,
        }
    }
}

impl AnalysisConfig {
    fn validate(&mut self) {
        self.window_size = clamp_field("analysis.window_size", self.window_size, 10, 10_000);
        self.z_score_threshold = clamp_field("analysis.z_score_threshold", self.z_score_threshold, 1.0, 10.0);
        self.lag_range_seconds = clamp_field("analysis.lag_range_seconds", self.lag_range_seconds, 1, 3600);
        self.cluster_window_seconds =
            clamp_field("analysis.cluster_window_seconds", self.cluster_window_seconds, 0.1, 60.0);
        self.correlation_threshold = clamp_field("analysis.correlation_threshold", self.correlation_threshold, 0.0, 1.0);
        self.precursor_threshold = clamp_field("analysis.precursor_threshold", self.precursor_threshold, 0.0, 1.0);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub token: String,
    pub chat_id: String,
    pub cooldown_seconds: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: String::new(),
            chat_id: String::new(),
            cooldown_seconds: 60,
        }
    }
}

impl TelegramConfig {
    fn validate(&mut self) {
        self.cooldown_seconds = clamp_field("alerting.telegram.cooldown_seconds", self.cooldown_seconds, 0, 86_400);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub cooldown_seconds: u64,
    pub min_cluster_sensors: u8,
    pub telegram: TelegramConfig,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: None,
            cooldown_seconds: 300,
            min_cluster_sensors: 3,
            telegram: TelegramConfig::default(),
        }
    }
}

impl AlertingConfig {
    fn validate(&mut self) {
        self.cooldown_seconds = clamp_field("alerting.cooldown_seconds", self.cooldown_seconds, 0, 86_400);
        self.min_cluster_sensors = clamp_field("alerting.min_cluster_sensors", self.min_cluster_sensors, 2, 10);
        self.telegram.validate();
    }
}

/// Root configuration object. Carries `alerting`/`api_keys` for interface
/// parity with the original config schema even though nothing in this crate
/// consumes them -- the notification dispatcher they feed is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub sensors: HashMap<String, SensorConfig>,
    pub storage: StorageConfig,
    pub analysis: AnalysisConfig,
    pub alerting: AlertingConfig,
    pub api_keys: HashMap<String, String>,
}

impl Config {
    pub fn load(path: &Path) -> Self {
        let mut config = match fs::read_to_string(path) {
            Ok(text) => match toml::from_str::<Config>(&text) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!("failed to parse config at {path:?}: {e}, using defaults");
                    Config::default()
                }
            },
            Err(_) => {
                warn!("no config file at {path:?}, using defaults");
                Config::default()
            }
        };
        config.validate();
        config
    }

    fn validate(&mut self) {
        for (name, sensor) in self.sensors.iter_mut() {
            sensor.validate(name);
        }
        self.storage.validate();
        self.analysis.validate();
        self.alerting.validate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_interval_is_clamped_not_rejected() {
        let mut sensor = SensorConfig { interval_seconds: 9000.0, ..Default::default() };
        sensor.validate("crypto");
        assert_eq!(sensor.interval_seconds, 3600.0);
    }

    #[test]
    fn invalid_priority_falls_back_to_medium() {
        let mut sensor = SensorConfig { priority: "urgent".to_string(), ..Default::default() };
        sensor.validate("crypto");
        assert_eq!(sensor.priority, "medium");
    }

    #[test]
    fn missing_config_file_yields_validated_defaults() {
        let config = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert_eq!(config.storage.buffer_size, 1000);
        assert_eq!(config.analysis.window_size, 100);
    }

    #[test]
    fn buffer_size_floor_is_enforced() {
        let mut storage = StorageConfig { buffer_size: 0, ..Default::default() };
        storage.validate();
        assert_eq!(storage.buffer_size, 1);
    }
}
