//! Sustained heap pressure.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use super::{lock, HeapUsage, Monitor, RuntimeProbe, Schedule};
use crate::config::{Config, MemoryLeakConfig};
use crate::risk::{Severity, SymptomRecorder};

/// Symptom key.
pub const SYMPTOM: &str = "memory-leak";

/// Reports heap usage that stays above a ratio for several checks in a row.
///
/// A single spike is normal; a streak suggests something is retaining
/// memory.
pub struct MemoryLeakMonitor {
    probe: Arc<dyn RuntimeProbe>,
    recorder: Arc<dyn SymptomRecorder>,
    config: Mutex<MemoryLeakConfig>,
    streak: Mutex<u32>,
}

impl std::fmt::Debug for MemoryLeakMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLeakMonitor")
            .field("config", &*lock(&self.config))
            .field("streak", &*lock(&self.streak))
            .finish_non_exhaustive()
    }
}

impl MemoryLeakMonitor {
    /// Create a monitor.
    pub fn new(
        config: MemoryLeakConfig,
        probe: Arc<dyn RuntimeProbe>,
        recorder: Arc<dyn SymptomRecorder>,
    ) -> Self {
        Self {
            probe,
            recorder,
            config: Mutex::new(config),
            streak: Mutex::new(0),
        }
    }

    /// Feed one heap reading. Returns the current pressure streak.
    pub fn observe(&self, heap: HeapUsage) -> u32 {
        let Some(ratio) = heap.ratio() else {
            return 0;
        };
        let (warn_ratio, warn_streak) = {
            let config = lock(&self.config);
            (config.warn_ratio, config.warn_streak)
        };

        let mut streak = lock(&self.streak);
        if ratio <= warn_ratio {
            if *streak >= warn_streak {
                info!(ratio, "heap pressure recovered");
            }
            *streak = 0;
            return 0;
        }

        *streak = streak.saturating_add(1);
        if *streak >= warn_streak {
            let percent = (ratio * 100.0).round();
            self.recorder.record(
                SYMPTOM,
                Severity::High,
                &format!(
                    "Heap at {percent}% of maximum for {} consecutive checks",
                    *streak
                ),
            );
        }
        *streak
    }
}

impl Monitor for MemoryLeakMonitor {
    fn name(&self) -> &'static str {
        "memory-leak"
    }

    fn schedule(&self) -> Option<Schedule> {
        let config = lock(&self.config);
        config
            .enabled
            .then(|| Schedule::every(Duration::from_secs(config.interval_secs)))
    }

    fn check(&self) -> anyhow::Result<()> {
        match self.probe.heap() {
            Some(heap) => {
                self.observe(heap);
            }
            None => debug!("heap usage unavailable"),
        }
        Ok(())
    }

    fn reload(&self, config: &Config) {
        *lock(&self.config) = config.memory_leak.clone();
    }

    fn reset(&self) {
        *lock(&self.streak) = 0;
    }
}
