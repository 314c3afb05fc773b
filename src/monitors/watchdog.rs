//! Hard caps on memory and thread count.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{lock, Monitor, RuntimeProbe, Schedule};
use crate::config::{Config, WatchdogConfig};
use crate::risk::{Severity, SymptomRecorder};

/// Symptom key for the memory cap.
pub const MEMORY_SYMPTOM: &str = "watchdog-memory";

/// Symptom key for the thread cap.
pub const THREADS_SYMPTOM: &str = "watchdog-threads";

/// Reports every check that finds the process over a configured cap.
pub struct ResourceWatchdog {
    probe: Arc<dyn RuntimeProbe>,
    recorder: Arc<dyn SymptomRecorder>,
    config: Mutex<WatchdogConfig>,
}

impl std::fmt::Debug for ResourceWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceWatchdog")
            .field("config", &*lock(&self.config))
            .finish_non_exhaustive()
    }
}

impl ResourceWatchdog {
    /// Create a watchdog.
    pub fn new(
        config: WatchdogConfig,
        probe: Arc<dyn RuntimeProbe>,
        recorder: Arc<dyn SymptomRecorder>,
    ) -> Self {
        Self {
            probe,
            recorder,
            config: Mutex::new(config),
        }
    }
}

impl Monitor for ResourceWatchdog {
    fn name(&self) -> &'static str {
        "watchdog"
    }

    fn schedule(&self) -> Option<Schedule> {
        let config = lock(&self.config);
        config
            .enabled
            .then(|| Schedule::every(Duration::from_secs(config.interval_secs)))
    }

    fn check(&self) -> anyhow::Result<()> {
        let (max_memory_mb, max_threads) = {
            let config = lock(&self.config);
            (config.max_memory_mb, config.max_threads)
        };

        if let Some(heap) = self.probe.heap() {
            let used_mb = heap.used_mb();
            if used_mb > max_memory_mb {
                self.recorder.record(
                    MEMORY_SYMPTOM,
                    Severity::High,
                    &format!("Memory use {used_mb} MB exceeds cap of {max_memory_mb} MB"),
                );
            }
        }

        if let Some(threads) = self.probe.thread_count() {
            if threads > max_threads {
                self.recorder.record(
                    THREADS_SYMPTOM,
                    Severity::Medium,
                    &format!("{threads} live threads exceed cap of {max_threads}"),
                );
            }
        }
        Ok(())
    }

    fn reload(&self, config: &Config) {
        *lock(&self.config) = config.watchdog.clone();
    }

    fn reset(&self) {}
}
