//! Health monitor + HTTP introspection endpoint.
//!
//! The monitor is ambient bookkeeping the distilled spec folds into the
//! `/health` response shape without specifying how it's computed; the
//! original's per-source stats (`sensors/base.py`'s `get_stats()`) are the
//! model for what's tracked here. The server itself is grounded on
//! `advanced/dashboard.rs`'s raw-socket HTTP listener, re-expressed on
//! `tiny_http` (a teacher dependency that dashboard.rs never actually used).

use log::{error, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tiny_http::{Method, Response, Server};

use crate::calibration::{AutoCalibrator, CalibrationTracker};
use crate::types::{now_unix, SensorStatus};

const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct ApiQuota {
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub usage_percent: f64,
    pub resets_in: f64,
}

struct SourceHealth {
    status: Mutex<SensorStatus>,
    disabled: AtomicBool,
    disabled_reason: Mutex<Option<String>>,
    consecutive_failures: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    last_success_at: Mutex<Option<f64>>,
    last_error: Mutex<Option<String>>,
    quota: Mutex<Option<ApiQuota>>,
    quota_window_start: Mutex<f64>,
}

impl SourceHealth {
    fn new() -> Self {
        Self {
            status: Mutex::new(SensorStatus::Running),
            disabled: AtomicBool::new(false),
            disabled_reason: Mutex::new(None),
            consecutive_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            last_success_at: Mutex::new(None),
            last_error: Mutex::new(None),
            quota: Mutex::new(None),
            quota_window_start: Mutex::new(now_unix()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorHealthView {
    pub status: SensorStatus,
    pub disabled: bool,
    pub disabled_reason: Option<String>,
    pub consecutive_failures: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_success_ago: Option<f64>,
    pub last_error: Option<String>,
}

/// Tracks per-source success/failure counters and API-quota usage behind
/// the `/health` surface. Auto-disables a source after
/// `failureThreshold` consecutive failures (§7); re-enabling is a manual
/// operator call, never exposed over the network.
pub struct HealthMonitor {
    sources: Mutex<HashMap<String, Arc<SourceHealth>>>,
    failure_threshold: u32,
    start_time: f64,
    calibration: Arc<CalibrationTracker>,
    auto_calibrator: Arc<AutoCalibrator>,
    auto_apply_enabled: bool,
}

impl HealthMonitor {
    pub fn new(
        calibration: Arc<CalibrationTracker>,
        auto_calibrator: Arc<AutoCalibrator>,
        auto_apply_enabled: bool,
    ) -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            start_time: now_unix(),
            calibration,
            auto_calibrator,
            auto_apply_enabled,
        }
    }

    fn entry(&self, source: &str) -> Arc<SourceHealth> {
        self.sources
            .lock()
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(SourceHealth::new()))
            .clone()
    }

    pub fn record_success(&self, source: &str) {
        let health = self.entry(source);
        health.total_successes.fetch_add(1, Ordering::Relaxed);
        health.consecutive_failures.store(0, Ordering::Relaxed);
        *health.last_success_at.lock() = Some(now_unix());
        *health.status.lock() = SensorStatus::Running;
    }

    pub fn record_failure(&self, source: &str, error: impl Into<String>) {
        let health = self.entry(source);
        health.total_failures.fetch_add(1, Ordering::Relaxed);
        let failures = health.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        *health.last_error.lock() = Some(error.into());
        if failures as u32 >= self.failure_threshold {
            health.disabled.store(true, Ordering::Relaxed);
            *health.disabled_reason.lock() =
                Some(format!("{failures} consecutive failures (threshold {})", self.failure_threshold));
            *health.status.lock() = SensorStatus::Error;
            info!("source '{source}' auto-disabled after {failures} consecutive failures");
        }
    }

    /// Manual operator action; no network surface exposes this.
    pub fn re_enable(&self, source: &str) -> bool {
        let sources = self.sources.lock();
        let Some(health) = sources.get(source) else { return false };
        health.disabled.store(false, Ordering::Relaxed);
        *health.disabled_reason.lock() = None;
        health.consecutive_failures.store(0, Ordering::Relaxed);
        *health.status.lock() = SensorStatus::Running;
        true
    }

    pub fn record_api_call(&self, source: &str, cost: u64, limit: u64, window_secs: f64) {
        let health = self.entry(source);
        let mut quota = health.quota.lock();
        let mut window_start = health.quota_window_start.lock();
        let now = now_unix();
        if now - *window_start > window_secs {
            *window_start = now;
            *quota = None;
        }
        let used = quota.as_ref().map(|q| q.used).unwrap_or(0) + cost;
        let remaining = limit.saturating_sub(used);
        *quota = Some(ApiQuota {
            limit,
            used,
            remaining,
            usage_percent: if limit > 0 { used as f64 / limit as f64 * 100.0 } else { 0.0 },
            resets_in: (window_secs - (now - *window_start)).max(0.0),
        });
    }

    pub fn sensor_view(&self, source: &str) -> Option<SensorHealthView> {
        let sources = self.sources.lock();
        let health = sources.get(source)?;
        Some(sensor_view(health))
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let sources = self.sources.lock();
        let mut sensors = HashMap::new();
        let mut api_quotas = HashMap::new();
        let mut healthy = 0usize;
        for (name, health) in sources.iter() {
            let view = sensor_view(health);
            if !view.disabled && view.status != SensorStatus::Error {
                healthy += 1;
            }
            sensors.insert(name.clone(), view);
            if let Some(q) = health.quota.lock().clone() {
                api_quotas.insert(name.clone(), q);
            }
        }
        let total = sensors.len();
        let (last_calibration, total_calibrations) = self.auto_calibrator.history_stats();

        HealthSnapshot {
            status: if healthy == total { "healthy" } else { "degraded" }.to_string(),
            uptime_seconds: now_unix() - self.start_time,
            sensors,
            sensors_healthy: healthy,
            sensors_total: total,
            api_quotas,
            calibration: CalibrationSummary {
                ready_for_calibration: self.calibration.ready_for_calibration(),
                days_collecting: self.calibration.days_collecting(),
                days_needed: 30.0,
                auto_apply_enabled: self.auto_apply_enabled,
                last_calibration,
                total_calibrations,
            },
            timestamp: now_unix(),
        }
    }
}

fn sensor_view(health: &SourceHealth) -> SensorHealthView {
    let last_success_ago = health.last_success_at.lock().map(|t| now_unix() - t);
    SensorHealthView {
        status: health.status.lock().clone(),
        disabled: health.disabled.load(Ordering::Relaxed),
        disabled_reason: health.disabled_reason.lock().clone(),
        consecutive_failures: health.consecutive_failures.load(Ordering::Relaxed),
        total_successes: health.total_successes.load(Ordering::Relaxed),
        total_failures: health.total_failures.load(Ordering::Relaxed),
        last_success_ago,
        last_error: health.last_error.lock().clone(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationSummary {
    pub ready_for_calibration: bool,
    pub days_collecting: f64,
    pub days_needed: f64,
    pub auto_apply_enabled: bool,
    pub last_calibration: Option<f64>,
    pub total_calibrations: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: String,
    pub uptime_seconds: f64,
    pub sensors: HashMap<String, SensorHealthView>,
    pub sensors_healthy: usize,
    pub sensors_total: usize,
    pub api_quotas: HashMap<String, ApiQuota>,
    pub calibration: CalibrationSummary,
    pub timestamp: f64,
}

/// Starts the health server on its own thread. `running` is polled once per
/// accepted connection (via `recv_timeout`) so `stop` can join promptly
/// instead of blocking forever on an idle listener, mirroring the teacher's
/// cooperative-shutdown dashboard thread.
pub fn start_server(port: u16, monitor: Arc<HealthMonitor>, running: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(("127.0.0.1", port)) {
            Ok(s) => s,
            Err(e) => {
                error!("health server failed to bind port {port}: {e}");
                return;
            }
        };
        info!("health server listening on http://127.0.0.1:{port}");

        while running.load(Ordering::Acquire) {
            let request = match server.recv_timeout(std::time::Duration::from_millis(200)) {
                Ok(Some(r)) => r,
                Ok(None) => continue,
                Err(e) => {
                    error!("health server accept error: {e}");
                    continue;
                }
            };
            handle_request(request, &monitor);
        }
        info!("health server stopped");
    })
}

fn handle_request(request: tiny_http::Request, monitor: &Arc<HealthMonitor>) {
    if *request.method() != Method::Get {
        let _ = request.respond(Response::from_string("method not allowed").with_status_code(405));
        return;
    }
    let url = request.url().to_string();
    if url == "/health" {
        let snapshot = monitor.snapshot();
        respond_json(request, &snapshot, 200);
    } else if let Some(name) = url.strip_prefix("/sensor/") {
        match monitor.sensor_view(name) {
            Some(view) => respond_json(request, &view, 200),
            None => {
                let _ = request.respond(Response::from_string(format!("unknown sensor '{name}'")).with_status_code(404));
            }
        }
    } else {
        let _ = request.respond(Response::from_string("not found").with_status_code(404));
    }
}

fn respond_json<T: Serialize>(request: tiny_http::Request, body: &T, status: u16) {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let header = tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap();
    let response = Response::from_string(json)
        .with_status_code(status)
        .with_header(header);
    let _ = request.respond(response);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        let dir = std::env::temp_dir().join(format!("health_test_{}", now_unix() as u64));
        let tracker = Arc::new(CalibrationTracker::new(&dir));
        let auto_calibrator = Arc::new(AutoCalibrator::new(tracker.clone(), &dir, false));
        HealthMonitor::new(tracker, auto_calibrator, false)
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let m = monitor();
        m.record_failure("crypto", "timeout");
        m.record_failure("crypto", "timeout");
        m.record_success("crypto");
        let view = m.sensor_view("crypto").unwrap();
        assert_eq!(view.consecutive_failures, 0);
        assert_eq!(view.status, SensorStatus::Running);
    }

    #[test]
    fn auto_disable_after_threshold() {
        let m = monitor();
        for _ in 0..3 {
            m.record_failure("earthquake", "rate limited");
        }
        let view = m.sensor_view("earthquake").unwrap();
        assert!(view.disabled);
        assert!(view.disabled_reason.is_some());
    }

    #[test]
    fn re_enable_clears_disabled_state() {
        let m = monitor();
        for _ in 0..3 {
            m.record_failure("weather", "boom");
        }
        assert!(m.re_enable("weather"));
        let view = m.sensor_view("weather").unwrap();
        assert!(!view.disabled);
        assert_eq!(view.consecutive_failures, 0);
    }

    #[test]
    fn snapshot_reports_degraded_when_any_sensor_disabled() {
        let m = monitor();
        m.record_success("crypto");
        for _ in 0..3 {
            m.record_failure("earthquake", "down");
        }
        let snapshot = m.snapshot();
        assert_eq!(snapshot.status, "degraded");
        assert_eq!(snapshot.sensors_healthy, 1);
        assert_eq!(snapshot.sensors_total, 2);
    }
}
