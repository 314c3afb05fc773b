//! Long garbage collection pauses.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use super::{lock, Monitor, RuntimeProbe, Schedule};
use crate::config::{Config, GcConfig};
use crate::risk::{Severity, SymptomRecorder};

/// Symptom key.
pub const SYMPTOM: &str = "gc-pause";

/// Reports intervals in which the collector ran longer than allowed.
///
/// The probe reports cumulative collection time; the monitor compares
/// successive readings, so the first check only sets a baseline.
pub struct GcPauseMonitor {
    probe: Arc<dyn RuntimeProbe>,
    recorder: Arc<dyn SymptomRecorder>,
    config: Mutex<GcConfig>,
    last_total: Mutex<Option<Duration>>,
}

impl std::fmt::Debug for GcPauseMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcPauseMonitor")
            .field("config", &*lock(&self.config))
            .finish_non_exhaustive()
    }
}

impl GcPauseMonitor {
    /// Create a monitor.
    pub fn new(
        config: GcConfig,
        probe: Arc<dyn RuntimeProbe>,
        recorder: Arc<dyn SymptomRecorder>,
    ) -> Self {
        Self {
            probe,
            recorder,
            config: Mutex::new(config),
            last_total: Mutex::new(None),
        }
    }

    /// Compare a cumulative GC reading with the previous one.
    ///
    /// Returns the pause time attributed to this interval, if it exceeded
    /// the warning threshold.
    pub fn observe(&self, total: Duration) -> Option<Duration> {
        let warn_after = Duration::from_millis(lock(&self.config).pause_warn_ms);
        let previous = lock(&self.last_total).replace(total)?;
        let delta = total.saturating_sub(previous);
        if delta <= warn_after {
            return None;
        }
        let ms = delta.as_millis();
        self.recorder.record(
            SYMPTOM,
            Severity::High,
            &format!("Garbage collection took {ms} ms in one sampling interval"),
        );
        Some(delta)
    }
}

impl Monitor for GcPauseMonitor {
    fn name(&self) -> &'static str {
        "gc-pause"
    }

    fn schedule(&self) -> Option<Schedule> {
        let config = lock(&self.config);
        config
            .enabled
            .then(|| Schedule::every(Duration::from_secs(config.interval_secs)))
    }

    fn check(&self) -> anyhow::Result<()> {
        match self.probe.gc_time() {
            Some(total) => {
                if let Some(pause) = self.observe(total) {
                    debug!(pause_ms = pause.as_millis(), "long gc pause");
                }
            }
            None => debug!("gc time unavailable"),
        }
        Ok(())
    }

    fn reload(&self, config: &Config) {
        *lock(&self.config) = config.gc.clone();
    }

    fn reset(&self) {
        *lock(&self.last_total) = None;
    }
}
