//! Signal producers.
//!
//! Each producer watches one runtime signal and reports anomalies to the
//! symptom aggregator. Periodic producers implement [`Monitor`] and are
//! driven by a [`MonitorSet`]; the tick latency monitor is push-based and
//! fed directly by the host.

pub mod deadlock;
pub mod gc;
pub mod memory;
pub mod performance;
pub mod probe;
pub mod threads;
pub mod watchdog;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

pub use deadlock::DeadlockMonitor;
pub use gc::GcPauseMonitor;
pub use memory::MemoryLeakMonitor;
pub use performance::TickLatencyMonitor;
pub use probe::{HeapUsage, ProcfsProbe, RuntimeProbe};
pub use threads::ThreadUsageMonitor;
pub use watchdog::ResourceWatchdog;

use crate::config::Config;
use crate::schedule::PeriodicTask;

/// When a periodic monitor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Delay before the first check.
    pub initial_delay: Duration,
    /// Time between checks.
    pub period: Duration,
}

impl Schedule {
    /// Same delay and period.
    pub fn every(period: Duration) -> Self {
        Self {
            initial_delay: period,
            period,
        }
    }
}

/// A periodic signal producer.
pub trait Monitor: Send + Sync {
    /// Name used for the task and in logs.
    fn name(&self) -> &'static str;

    /// Cadence, or `None` while disabled.
    fn schedule(&self) -> Option<Schedule>;

    /// Run one check. Missing data is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error when the check itself breaks; the runner logs it
    /// and keeps the schedule.
    fn check(&self) -> anyhow::Result<()>;

    /// Pick up new settings.
    fn reload(&self, config: &Config);

    /// Forget accumulated state (streaks, baselines).
    fn reset(&self);
}

/// Runs a group of monitors, one periodic task each.
pub struct MonitorSet {
    monitors: Vec<Arc<dyn Monitor>>,
    tasks: Mutex<Vec<PeriodicTask>>,
    running: AtomicBool,
}

impl std::fmt::Debug for MonitorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.monitors.iter().map(|m| m.name()).collect();
        f.debug_struct("MonitorSet")
            .field("monitors", &names)
            .field("tasks", &lock(&self.tasks).len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl MonitorSet {
    /// Group the given monitors.
    pub fn new(monitors: Vec<Arc<dyn Monitor>>) -> Self {
        Self {
            monitors,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Monitors in this set.
    pub fn monitors(&self) -> &[Arc<dyn Monitor>] {
        &self.monitors
    }

    /// Schedule every enabled monitor. No-op if already running.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut tasks = lock(&self.tasks);
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for monitor in &self.monitors {
            let Some(schedule) = monitor.schedule() else {
                debug!(monitor = monitor.name(), "monitor disabled");
                continue;
            };
            let this = Arc::clone(monitor);
            let spawned = PeriodicTask::spawn(
                monitor.name(),
                schedule.initial_delay,
                schedule.period,
                Arc::new(move || this.check()),
            );
            match spawned {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    tasks.clear();
                    self.running.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        }
        info!(running = tasks.len(), "signal producers started");
        Ok(())
    }

    /// Cancel every task and reset every monitor. Idempotent.
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        let stopped: Vec<PeriodicTask> = lock(&self.tasks).drain(..).collect();
        for task in &stopped {
            task.cancel();
        }
        for monitor in &self.monitors {
            monitor.reset();
        }
        if was_running {
            info!(stopped = stopped.len(), "signal producers stopped");
        }
    }

    /// Reload every monitor; reschedule if running.
    ///
    /// # Errors
    ///
    /// Returns an error if tasks must restart outside a tokio runtime.
    pub fn reload(&self, config: &Config) -> anyhow::Result<()> {
        for monitor in &self.monitors {
            monitor.reload(config);
        }
        if self.running.swap(false, Ordering::AcqRel) {
            let old: Vec<PeriodicTask> = lock(&self.tasks).drain(..).collect();
            for task in &old {
                task.cancel();
            }
            self.start()?;
        }
        Ok(())
    }

    /// Whether the set has been started and not stopped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
