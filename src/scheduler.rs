//! Periodic, priority-ordered, non-overlapping task dispatch.
//!
//! The driver loop is paced the way `component_a/sensor.rs` paces sensor
//! releases, but on a 100ms poll tick rather than a sub-millisecond one:
//! this component drives minute-scale sampling tasks, not microsecond-scale
//! control loops.

use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::types::{now_unix, Priority, TaskStats};

const MIN_INTERVAL_SECS: f64 = 0.1;
const MAX_INTERVAL_SECS: f64 = 3600.0;
const POLL_TICK: Duration = Duration::from_millis(100);
const DEFAULT_CONCURRENCY: usize = 10;
const SLOT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_TASK_TIMEOUT_SECS: f64 = 30.0;

pub type TaskFn = dyn Fn() -> Result<(), String> + Send + Sync;

enum TaskState {
    Pending,
    Paused,
}

struct ScheduledTask {
    name: String,
    callback: Arc<TaskFn>,
    interval: f64,
    deadline_secs: f64,
    priority: Priority,
    registration_order: u64,
    state: Mutex<TaskState>,
    running: AtomicBool,
    next_run: Mutex<f64>,
    last_run: Mutex<Option<f64>>,
    run_count: AtomicU64,
    error_count: AtomicU64,
    consecutive_failures: AtomicU32,
    avg_duration_ms: Mutex<f64>,
    last_drift_ms: Mutex<f64>,
}

fn clamp_interval(interval: f64) -> f64 {
    let clamped = interval.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS);
    if (clamped - interval).abs() > f64::EPSILON {
        warn!("scheduler interval {interval}s clamped to {clamped}s");
    }
    clamped
}

fn priority_rank(p: Priority) -> u8 {
    match p {
        Priority::High => 0,
        Priority::Medium => 1,
        Priority::Low => 2,
    }
}

/// A counting-semaphore built from the teacher's channel-first concurrency
/// idiom: a bounded channel pre-loaded with `n` tokens stands in for a
/// semaphore permit, acquired by `recv_timeout` and released by dropping
/// the token back through the paired sender.
struct Semaphore {
    tx: crossbeam::channel::Sender<()>,
    rx: crossbeam::channel::Receiver<()>,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        let (tx, rx) = crossbeam::channel::bounded(permits);
        for _ in 0..permits {
            let _ = tx.send(());
        }
        Self { tx, rx }
    }

    fn try_acquire(self: &Arc<Self>, timeout: Duration) -> Option<SemaphorePermit> {
        self.rx
            .recv_timeout(timeout)
            .ok()
            .map(|_| SemaphorePermit { sem: self.clone() })
    }
}

struct SemaphorePermit {
    sem: Arc<Semaphore>,
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        let _ = self.sem.tx.send(());
    }
}

pub struct Scheduler {
    tasks: Mutex<Vec<Arc<ScheduledTask>>>,
    names: Mutex<HashMap<String, usize>>,
    semaphore: Arc<Semaphore>,
    running: Arc<AtomicBool>,
    driver: Mutex<Option<thread::JoinHandle<()>>>,
    next_registration: AtomicU64,
}

impl Scheduler {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            names: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(if max_concurrency == 0 {
                DEFAULT_CONCURRENCY
            } else {
                max_concurrency
            })),
            running: Arc::new(AtomicBool::new(false)),
            driver: Mutex::new(None),
            next_registration: AtomicU64::new(0),
        }
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        interval_seconds: f64,
        priority: Priority,
        callback: Arc<TaskFn>,
    ) {
        let name = name.into();
        let interval = clamp_interval(interval_seconds);
        let deadline_secs = DEFAULT_TASK_TIMEOUT_SECS.max(2.0 * interval);
        let order = self.next_registration.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(ScheduledTask {
            name: name.clone(),
            callback,
            interval,
            deadline_secs,
            priority,
            registration_order: order,
            state: Mutex::new(TaskState::Pending),
            running: AtomicBool::new(false),
            next_run: Mutex::new(now_unix()),
            last_run: Mutex::new(None),
            run_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            avg_duration_ms: Mutex::new(0.0),
            last_drift_ms: Mutex::new(0.0),
        });
        let mut tasks = self.tasks.lock();
        let mut names = self.names.lock();
        names.insert(name, tasks.len());
        tasks.push(task);
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut tasks = self.tasks.lock();
        let mut names = self.names.lock();
        if let Some(&idx) = names.get(name) {
            tasks.remove(idx);
            names.clear();
            for (i, t) in tasks.iter().enumerate() {
                names.insert(t.name.clone(), i);
            }
            true
        } else {
            false
        }
    }

    pub fn pause(&self, name: &str) -> bool {
        self.with_task(name, |t| *t.state.lock() = TaskState::Paused)
    }

    pub fn resume(&self, name: &str) -> bool {
        self.with_task(name, |t| {
            *t.state.lock() = TaskState::Pending;
            *t.next_run.lock() = now_unix();
        })
    }

    fn with_task(&self, name: &str, f: impl FnOnce(&ScheduledTask)) -> bool {
        let tasks = self.tasks.lock();
        let names = self.names.lock();
        if let Some(&idx) = names.get(name) {
            f(&tasks[idx]);
            true
        } else {
            false
        }
    }

    pub fn stats(&self) -> Vec<TaskStats> {
        self.tasks
            .lock()
            .iter()
            .map(|t| TaskStats {
                name: t.name.clone(),
                last_run: *t.last_run.lock(),
                next_run: Some(*t.next_run.lock()),
                run_count: t.run_count.load(Ordering::Relaxed),
                error_count: t.error_count.load(Ordering::Relaxed),
                avg_duration_ms: *t.avg_duration_ms.lock(),
                last_drift_ms: *t.last_drift_ms.lock(),
                consecutive_failures: t.consecutive_failures.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let handle = thread::spawn(move || this.drive());
        *self.driver.lock() = Some(handle);
    }

    pub fn stop(&self, timeout: Duration) {
        self.running.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let any_running = self
                .tasks
                .lock()
                .iter()
                .any(|t| t.running.load(Ordering::Acquire));
            if !any_running {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        if let Some(handle) = self.driver.lock().take() {
            let _ = handle.join();
        }
    }

    fn drive(self: Arc<Self>) {
        while self.running.load(Ordering::Acquire) {
            let now = now_unix();
            let mut ready: Vec<Arc<ScheduledTask>> = self
                .tasks
                .lock()
                .iter()
                .filter(|t| {
                    matches!(*t.state.lock(), TaskState::Pending)
                        && !t.running.load(Ordering::Acquire)
                        && *t.next_run.lock() <= now
                })
                .cloned()
                .collect();

            ready.sort_by(|a, b| {
                priority_rank(a.priority)
                    .cmp(&priority_rank(b.priority))
                    .then(a.registration_order.cmp(&b.registration_order))
            });

            for task in ready {
                if !task.running.compare_exchange(
                    false,
                    true,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ).is_ok() {
                    continue;
                }
                let Some(permit) = self.semaphore.try_acquire(SLOT_ACQUIRE_TIMEOUT) else {
                    warn!("scheduler: no free slot for '{}' within 1s, skipping", task.name);
                    task.running.store(false, Ordering::Release);
                    continue;
                };
                let task = task.clone();
                thread::spawn(move || {
                    let _permit = permit;
                    run_task(&task);
                });
            }

            spin_sleep::sleep(POLL_TICK);
        }
    }
}

fn run_task(task: &ScheduledTask) {
    let scheduled = *task.next_run.lock();
    let start = now_unix();
    let drift_ms = (start - scheduled) * 1000.0;

    let result = (task.callback)();
    let finish = now_unix();
    let duration_ms = (finish - start) * 1000.0;

    {
        let mut avg = task.avg_duration_ms.lock();
        *avg = *avg * 0.9 + duration_ms * 0.1;
    }
    *task.last_drift_ms.lock() = drift_ms;
    *task.last_run.lock() = Some(start);
    task.run_count.fetch_add(1, Ordering::Relaxed);

    match result {
        Ok(()) => {
            task.consecutive_failures.store(0, Ordering::Relaxed);
        }
        Err(e) => {
            task.error_count.fetch_add(1, Ordering::Relaxed);
            task.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            warn!("task '{}' failed: {e}", task.name);
        }
    }

    if duration_ms / 1000.0 > task.deadline_secs {
        warn!(
            "task '{}' exceeded its deadline of {:.1}s (took {:.1}s)",
            task.name,
            task.deadline_secs,
            duration_ms / 1000.0
        );
        task.error_count.fetch_add(1, Ordering::Relaxed);
        task.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    // A task's next run is scheduled normally whether or not it ran over its
    // deadline; the scheduler has no way to preempt a synchronous callback,
    // so overruns are surfaced as failures rather than enforced.
    *task.next_run.lock() = finish + task.interval;
    task.running.store(false, Ordering::Release);
    debug!("task '{}' ran in {duration_ms:.2}ms, drift {drift_ms:.2}ms", task.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as AU32;

    #[test]
    fn interval_is_clamped() {
        assert_eq!(clamp_interval(0.0), MIN_INTERVAL_SECS);
        assert_eq!(clamp_interval(10_000.0), MAX_INTERVAL_SECS);
        assert_eq!(clamp_interval(5.0), 5.0);
    }

    #[test]
    fn register_and_stats_roundtrip() {
        let sched = Scheduler::new(2);
        let calls = Arc::new(AU32::new(0));
        let c = calls.clone();
        sched.register(
            "demo",
            0.1,
            Priority::High,
            Arc::new(move || {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
        );
        let stats = sched.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].name, "demo");
        assert_eq!(stats[0].run_count, 0);
    }

    #[test]
    fn priority_rank_orders_high_before_low() {
        assert!(priority_rank(Priority::High) < priority_rank(Priority::Low));
    }

    #[test]
    fn run_task_resets_consecutive_failures_on_success() {
        let task = ScheduledTask {
            name: "t".into(),
            callback: Arc::new(|| Err("boom".into())),
            interval: 1.0,
            deadline_secs: 30.0,
            priority: Priority::Low,
            registration_order: 0,
            state: Mutex::new(TaskState::Pending),
            running: AtomicBool::new(false),
            next_run: Mutex::new(now_unix()),
            last_run: Mutex::new(None),
            run_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(2),
            avg_duration_ms: Mutex::new(0.0),
            last_drift_ms: Mutex::new(0.0),
        };
        run_task(&task);
        assert_eq!(task.consecutive_failures.load(Ordering::Relaxed), 3);
    }
}
