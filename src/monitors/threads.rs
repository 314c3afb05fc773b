//! Threads spawned per module.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use super::{lock, Monitor, Schedule};
use crate::attribution::{Attribution, Attributor};
use crate::config::{Config, ThreadUsageConfig};
use crate::risk::{Severity, SymptomRecorder};
use crate::sampling::ThreadSampler;
use crate::stack::ThreadSample;

/// Symptom key prefix; the module id is appended.
pub const SYMPTOM_PREFIX: &str = "threads-";

/// Reports modules that own an unusual number of live threads.
///
/// Each thread is attributed by its stack, falling back to its name. Threads
/// nobody can be blamed for are ignored.
pub struct ThreadUsageMonitor {
    sampler: Arc<dyn ThreadSampler>,
    attributor: Arc<Attributor>,
    recorder: Arc<dyn SymptomRecorder>,
    config: Mutex<ThreadUsageConfig>,
}

impl std::fmt::Debug for ThreadUsageMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadUsageMonitor")
            .field("config", &*lock(&self.config))
            .finish_non_exhaustive()
    }
}

impl ThreadUsageMonitor {
    /// Create a monitor.
    pub fn new(
        config: ThreadUsageConfig,
        sampler: Arc<dyn ThreadSampler>,
        attributor: Arc<Attributor>,
        recorder: Arc<dyn SymptomRecorder>,
    ) -> Self {
        Self {
            sampler,
            attributor,
            recorder,
            config: Mutex::new(config),
        }
    }

    /// Count threads per attributed module.
    pub fn count_by_module(&self, threads: &[ThreadSample]) -> HashMap<String, u32> {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for thread in threads {
            let attribution = match self.attributor.attribute_from_stack(&thread.stack) {
                Attribution::Unknown => self.attributor.attribute_from_logger_name(&thread.name),
                known => known,
            };
            if let Attribution::Module(id) = attribution {
                let count = counts.entry(id).or_insert(0);
                *count = count.saturating_add(1);
            }
        }
        counts
    }

    /// Report modules over the limit in `threads`. Returns the offenders.
    pub fn observe(&self, threads: &[ThreadSample]) -> Vec<(String, u32)> {
        let warn = lock(&self.config).warn_threads;
        let mut offenders: Vec<(String, u32)> = self
            .count_by_module(threads)
            .into_iter()
            .filter(|(_, count)| *count > warn)
            .collect();
        offenders.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        for (module, count) in &offenders {
            let severity = if *count > warn.saturating_mul(2) {
                Severity::High
            } else {
                Severity::Medium
            };
            self.recorder.record(
                &format!("{SYMPTOM_PREFIX}{module}"),
                severity,
                &format!("Module {module} owns {count} live threads (limit {warn})"),
            );
        }
        offenders
    }
}

impl Monitor for ThreadUsageMonitor {
    fn name(&self) -> &'static str {
        "thread-usage"
    }

    fn schedule(&self) -> Option<Schedule> {
        let config = lock(&self.config);
        config
            .enabled
            .then(|| Schedule::every(Duration::from_secs(config.interval_secs)))
    }

    fn check(&self) -> anyhow::Result<()> {
        let threads = match self.sampler.dump_all() {
            Ok(threads) => threads,
            Err(e) => {
                debug!(error = %e, "thread dump unavailable");
                return Ok(());
            }
        };
        let offenders = self.observe(&threads);
        debug!(
            threads = threads.len(),
            offenders = offenders.len(),
            "thread usage checked"
        );
        Ok(())
    }

    fn reload(&self, config: &Config) {
        *lock(&self.config) = config.thread_usage.clone();
    }

    fn reset(&self) {}
}
