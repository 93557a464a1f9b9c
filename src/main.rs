//! Composition root: wires the event bus, scheduler, sample sources,
//! detector, cluster detector, anomaly-index aggregator, pattern tracker,
//! storage and health surface into one running pipeline.
//!
//! Registers seven demo sources matching the anomaly-index aggregator's
//! known-source list (`anomaly_index.rs`); real collectors for crypto,
//! earthquake, space-weather, etc. feeds are out of scope (see
//! `source.rs`'s module doc) so each is a `SyntheticSource` standing in for
//! the network call a real source would make.

mod anomaly_index;
mod bus;
mod calibration;
mod cluster;
mod config;
mod detector;
mod error;
mod health;
mod patterns;
mod predictions;
mod scheduler;
mod source;
mod store;
mod types;

use log::info;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anomaly_index::AnomalyIndexCalculator;
use bus::{EventBus, EventFilter};
use calibration::{AutoCalibrator, CalibrationTracker};
use cluster::ClusterDetector;
use config::Config;
use detector::ThresholdDetector;
use health::HealthMonitor;
use patterns::{Condition, EventCategory, HistoricalPatternTracker};
use scheduler::Scheduler;
use source::{safe_collect, SampleSource, SourceConfig, SyntheticSource};
use store::JsonlStore;
use types::{now_unix, AnomalyEvent, EventType, Priority};

const DEMO_SOURCES: [(&str, f64, (f64, f64)); 7] = [
    ("quantum_rng", 0.5, (-0.05, 0.05)),
    ("earthquake", 1.0, (-0.5, 0.5)),
    ("crypto", 60_000.0, (-500.0, 500.0)),
    ("space_weather", 2.0, (-1.0, 1.0)),
    ("blockchain", 10.0, (-1.0, 1.0)),
    ("weather", 20.0, (-2.0, 2.0)),
    ("news", 5.0, (-2.0, 2.0)),
];

const RECENT_ANOMALY_WINDOW_SECONDS: f64 = 24.0 * 3600.0;
const RECENT_ANOMALY_CAP: usize = 5000;

fn main() {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    let config = Config::load(&config_path);

    let base_dir = PathBuf::from(&config.storage.base_path);
    let calibration_dir = base_dir.join("calibration");
    let patterns_dir = base_dir.join("patterns");
    let predictions_dir = base_dir.join("predictions");

    let bus = Arc::new(EventBus::default());
    let scheduler = Arc::new(Scheduler::new(10));

    let calibration = Arc::new(CalibrationTracker::new(calibration_dir));
    let auto_calibrator = Arc::new(AutoCalibrator::new(calibration.clone(), base_dir.join("calibration"), false));

    let detector = Arc::new(ThresholdDetector::new(Some(calibration.clone())));
    let cluster_detector = Arc::new(ClusterDetector::with_windows(config.analysis.cluster_window_seconds, 3600.0));
    let anomaly_index = Arc::new(AnomalyIndexCalculator::new());
    let pattern_tracker = Arc::new(HistoricalPatternTracker::new(patterns_dir));

    let store = Arc::new(JsonlStore::new(
        base_dir.clone(),
        config.storage.compression,
        Some(config.storage.max_file_size_mb),
        Some(config.storage.buffer_size),
    ));
    pattern_tracker.backfill_price_history(&store);

    let health_monitor = Arc::new(HealthMonitor::new(calibration.clone(), auto_calibrator.clone(), false));

    let recent_anomalies: Arc<Mutex<VecDeque<AnomalyEvent>>> = Arc::new(Mutex::new(VecDeque::new()));
    let current_condition: Arc<Mutex<Option<Condition>>> = Arc::new(Mutex::new(None));

    register_pipeline_subscriber(
        &bus,
        detector.clone(),
        cluster_detector.clone(),
        pattern_tracker.clone(),
        store.clone(),
        recent_anomalies.clone(),
        current_condition.clone(),
    );

    register_sources(&config, &bus, &scheduler, &health_monitor);
    register_maintenance_tasks(
        &scheduler,
        anomaly_index.clone(),
        pattern_tracker.clone(),
        store.clone(),
        auto_calibrator.clone(),
        recent_anomalies,
        current_condition,
        predictions_dir,
    );

    let running = Arc::new(AtomicBool::new(true));
    let health_thread = health::start_server(8080, health_monitor, running.clone());

    scheduler.start();
    info!("pipeline running, health server on :8080, ctrl-c to stop");

    wait_for_shutdown_signal();

    running.store(false, Ordering::Release);
    scheduler.stop(Duration::from_secs(5));
    pattern_tracker.save();
    store.flush_all().ok();
    let _ = health_thread.join();
}

/// A single bus subscriber drives storage, detection, clustering and
/// pattern matching for every `Data` event, mirroring the way the original
/// threads one reading through its whole analysis chain before moving on
/// to the next.
fn register_pipeline_subscriber(
    bus: &Arc<EventBus>,
    detector: Arc<ThresholdDetector>,
    cluster_detector: Arc<ClusterDetector>,
    pattern_tracker: Arc<HistoricalPatternTracker>,
    store: Arc<JsonlStore>,
    recent_anomalies: Arc<Mutex<VecDeque<AnomalyEvent>>>,
    current_condition: Arc<Mutex<Option<Condition>>>,
) {
    let bus_for_publish = bus.clone();
    let filter = EventFilter { event_types: Some(vec![EventType::Data]), ..Default::default() };
    bus.subscribe(
        Arc::new(move |event| {
            let timestamp = event.timestamp;
            let source = event.source.clone();

            let mut record = serde_json::Map::new();
            for (k, v) in &event.payload {
                record.insert(k.clone(), v.clone());
            }
            record.insert("timestamp".to_string(), serde_json::json!(timestamp));
            record.insert("source".to_string(), serde_json::json!(source));
            let _ = store.write(&source, serde_json::Value::Object(record));

            let fields: HashMap<String, serde_json::Value> = event.payload.clone();

            let anomalies = detector.evaluate(&source, timestamp, &fields);
            for anomaly in anomalies {
                bus_for_publish.publish(&anomaly.to_event());

                if let Some(cluster) = cluster_detector.add_anomaly(anomaly.clone()) {
                    let sources: Vec<String> = {
                        let mut s: Vec<String> = cluster
                            .anomalies
                            .iter()
                            .map(|a| a.sensor_source.clone())
                            .collect();
                        s.sort();
                        s.dedup();
                        s
                    };
                    let condition = Condition {
                        timestamp,
                        level: cluster.level,
                        sources,
                        anomaly_index: 0.0,
                        baseline_ratio: 0.0,
                    };
                    pattern_tracker.record_condition(condition.clone());
                    *current_condition.lock() = Some(condition);
                }

                let mut recent = recent_anomalies.lock();
                recent.push_back(anomaly);
                while recent.len() > RECENT_ANOMALY_CAP {
                    recent.pop_front();
                }
            }

            pattern_tracker.check_events(&source, timestamp, &fields);

            Ok(())
        }),
        Some(filter),
    );
}

fn register_sources(
    config: &Config,
    bus: &Arc<EventBus>,
    scheduler: &Arc<Scheduler>,
    health_monitor: &Arc<HealthMonitor>,
) {
    for (name, base_value, noise) in DEMO_SOURCES {
        let sensor_config = config.sensors.get(name).cloned().unwrap_or_default();
        if !sensor_config.enabled {
            info!("source '{name}' disabled by config, skipping registration");
            continue;
        }

        let source: Arc<dyn SampleSource> = Arc::new(SyntheticSource::new(name, base_value, noise));
        let source_config = SourceConfig {
            enabled: true,
            interval_seconds: sensor_config.interval_seconds,
            priority: sensor_config.priority(),
            ..Default::default()
        };

        let bus = bus.clone();
        let health_monitor = health_monitor.clone();
        let name_owned = name.to_string();
        let consecutive_errors = Arc::new(AtomicU64::new(0));
        scheduler.register(
            name_owned.clone(),
            source_config.interval_seconds,
            priority_for(&name_owned, config),
            Arc::new(move || {
                match safe_collect(source.as_ref(), &source_config, &bus, &consecutive_errors) {
                    Some(_) => health_monitor.record_success(&name_owned),
                    None => health_monitor.record_failure(&name_owned, "collection failed after retries"),
                }
                Ok(())
            }),
        );
    }
}

fn priority_for(name: &str, config: &Config) -> Priority {
    config
        .sensors
        .get(name)
        .map(|s| s.priority())
        .unwrap_or(Priority::Medium)
}

#[allow(clippy::too_many_arguments)]
fn register_maintenance_tasks(
    scheduler: &Arc<Scheduler>,
    anomaly_index: Arc<AnomalyIndexCalculator>,
    pattern_tracker: Arc<HistoricalPatternTracker>,
    store: Arc<JsonlStore>,
    auto_calibrator: Arc<AutoCalibrator>,
    recent_anomalies: Arc<Mutex<VecDeque<AnomalyEvent>>>,
    current_condition: Arc<Mutex<Option<Condition>>>,
    predictions_dir: PathBuf,
) {
    {
        let recent_anomalies = recent_anomalies.clone();
        scheduler.register(
            "anomaly_index_tick",
            60.0,
            Priority::Low,
            Arc::new(move || {
                let now = now_unix();
                let mut recent = recent_anomalies.lock();
                while let Some(front) = recent.front() {
                    if now - front.timestamp > RECENT_ANOMALY_WINDOW_SECONDS {
                        recent.pop_front();
                    } else {
                        break;
                    }
                }
                let snapshot = anomaly_index.calculate(now, recent.make_contiguous());
                let mut condition = current_condition.lock();
                if let Some(c) = condition.as_mut() {
                    c.anomaly_index = snapshot.index;
                    c.baseline_ratio = snapshot.baseline_ratio;
                }
                Ok(())
            }),
        );
    }

    {
        let store = store.clone();
        scheduler.register(
            "store_flush",
            30.0,
            Priority::Low,
            Arc::new(move || {
                store.flush_all().map_err(|e| e.to_string())
            }),
        );
    }

    {
        let pattern_tracker = pattern_tracker.clone();
        scheduler.register(
            "pattern_persist",
            300.0,
            Priority::Low,
            Arc::new(move || {
                pattern_tracker.save();
                Ok(())
            }),
        );
    }

    {
        let auto_calibrator = auto_calibrator.clone();
        scheduler.register(
            "calibration_check",
            3600.0,
            Priority::Low,
            Arc::new(move || {
                auto_calibrator.check_and_calibrate();
                Ok(())
            }),
        );
    }

    {
        let pattern_tracker = pattern_tracker.clone();
        let current_condition = current_condition.clone();
        scheduler.register(
            "predictions_write",
            300.0,
            Priority::Low,
            Arc::new(move || {
                let now = now_unix();
                let condition = current_condition.lock().clone();
                let entries = match condition {
                    Some(c) => {
                        let summaries = pattern_tracker.get_probabilities(&c, 5, None::<EventCategory>);
                        vec![(c.key(), c.level, c.sources.clone(), summaries)]
                    }
                    None => Vec::new(),
                };
                let predictions = predictions::build_predictions(&entries, now);
                predictions::write_predictions(&predictions_dir, predictions, now);
                Ok(())
            }),
        );
    }
}

/// Blocks the main thread until stdin closes (Ctrl-D) or a line is entered,
/// then returns so the caller can run its graceful-shutdown sequence. No
/// signal-handling crate is in the dependency stack, so SIGINT still kills
/// the process immediately per the OS default; this path covers the
/// supervised/piped-stdin case where a clean `scheduler.stop` matters.
fn wait_for_shutdown_signal() {
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);
}
