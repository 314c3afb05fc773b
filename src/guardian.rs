//! One-stop wiring of every diagnostic component.
//!
//! A [`Guardian`] owns the attributor, the symptom aggregator, both stall
//! detectors, and the signal producers, built from one [`Config`] and the
//! host's capabilities. The host calls [`Guardian::start`] once, feeds
//! [`Guardian::record_tick`] from its simulation loop, calls
//! [`Guardian::loading_complete`] when startup ends, and [`Guardian::stop`]
//! on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::attribution::{Attributor, AttributorOptions, CodeSourceResolver, NoCodeSource};
use crate::config::Config;
use crate::modules::ModuleRegistry;
use crate::monitors::{
    DeadlockMonitor, GcPauseMonitor, MemoryLeakMonitor, Monitor, MonitorSet, ResourceWatchdog,
    RuntimeProbe, ThreadUsageMonitor, TickLatencyMonitor,
};
use crate::risk::{
    AlertSink, LogAlertSink, RiskSettings, Severity, SymptomAggregator, SymptomRecorder,
};
use crate::sampling::ThreadSampler;
use crate::stall::{BundleSink, DumpWriter, LogBundleSink, StallDetector, StallProfile};

/// What the host provides.
#[derive(Clone)]
pub struct HostCapabilities {
    /// Thread enumeration and sampling.
    pub sampler: Arc<dyn ThreadSampler>,
    /// Process-wide counters.
    pub probe: Arc<dyn RuntimeProbe>,
    /// Class to artifact resolution.
    pub code_source: Arc<dyn CodeSourceResolver>,
    /// Composite alert destination.
    pub alert_sink: Arc<dyn AlertSink>,
}

impl std::fmt::Debug for HostCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCapabilities")
            .field("sampler", &self.sampler.capabilities())
            .finish_non_exhaustive()
    }
}

impl HostCapabilities {
    /// Capabilities with no code-source resolution and logged alerts.
    pub fn new(sampler: Arc<dyn ThreadSampler>, probe: Arc<dyn RuntimeProbe>) -> Self {
        Self {
            sampler,
            probe,
            code_source: Arc::new(NoCodeSource),
            alert_sink: Arc::new(LogAlertSink),
        }
    }

    /// Use the host's code-source resolver.
    #[must_use]
    pub fn with_code_source(mut self, code_source: Arc<dyn CodeSourceResolver>) -> Self {
        self.code_source = code_source;
        self
    }

    /// Deliver composite alerts somewhere other than the log.
    #[must_use]
    pub fn with_alert_sink(mut self, alert_sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = alert_sink;
        self
    }
}

/// The assembled diagnostic subsystem.
pub struct Guardian {
    attributor: Arc<Attributor>,
    aggregator: Arc<SymptomAggregator>,
    loading: Arc<StallDetector>,
    tick: Arc<StallDetector>,
    producers: MonitorSet,
    latency: TickLatencyMonitor,
}

impl std::fmt::Debug for Guardian {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guardian")
            .field("attributor", &self.attributor)
            .field("aggregator", &self.aggregator)
            .field("loading", &self.loading)
            .field("tick", &self.tick)
            .field("producers", &self.producers)
            .finish_non_exhaustive()
    }
}

impl Guardian {
    /// Wire every component. Nothing is scheduled until [`Guardian::start`].
    pub fn new(config: &Config, registry: Arc<ModuleRegistry>, host: HostCapabilities) -> Self {
        let attributor = Arc::new(Attributor::with_code_source(
            registry,
            Arc::clone(&host.code_source),
            AttributorOptions::from(&config.attribution),
        ));
        let aggregator = Arc::new(SymptomAggregator::with_sink(
            RiskSettings::from(&config.risk),
            Arc::clone(&host.alert_sink),
        ));
        let recorder: Arc<dyn SymptomRecorder> = Arc::clone(&aggregator) as _;
        let sinks = bundle_sinks(config);

        let build_detector = |profile: StallProfile| {
            let detector = sinks.iter().fold(
                StallDetector::new(
                    profile,
                    Arc::clone(&host.sampler),
                    Arc::clone(&attributor),
                    Arc::clone(&recorder),
                ),
                |detector, sink| detector.with_sink(Arc::clone(sink)),
            );
            Arc::new(detector)
        };
        let loading = build_detector(StallProfile::loading(&config.loading_hang));
        let tick = build_detector(StallProfile::tick(&config.tick_hang));

        let producers: Vec<Arc<dyn Monitor>> = vec![
            Arc::new(GcPauseMonitor::new(
                config.gc.clone(),
                Arc::clone(&host.probe),
                Arc::clone(&recorder),
            )),
            Arc::new(MemoryLeakMonitor::new(
                config.memory_leak.clone(),
                Arc::clone(&host.probe),
                Arc::clone(&recorder),
            )),
            Arc::new(ResourceWatchdog::new(
                config.watchdog.clone(),
                Arc::clone(&host.probe),
                Arc::clone(&recorder),
            )),
            Arc::new(ThreadUsageMonitor::new(
                config.thread_usage.clone(),
                Arc::clone(&host.sampler),
                Arc::clone(&attributor),
                Arc::clone(&recorder),
            )),
            Arc::new(DeadlockMonitor::new(
                config.deadlock.clone(),
                Arc::clone(&host.sampler),
                Arc::clone(&attributor),
                Arc::clone(&recorder),
            )),
        ];
        let latency = TickLatencyMonitor::new(config.performance.clone(), Arc::clone(&recorder));

        Self {
            attributor,
            aggregator,
            loading,
            tick,
            producers: MonitorSet::new(producers),
            latency,
        }
    }

    /// Shared attributor.
    pub fn attributor(&self) -> &Arc<Attributor> {
        &self.attributor
    }

    /// Shared aggregator.
    pub fn aggregator(&self) -> &Arc<SymptomAggregator> {
        &self.aggregator
    }

    /// Loading-phase stall detector.
    pub fn loading_detector(&self) -> &Arc<StallDetector> {
        &self.loading
    }

    /// Tick-thread stall detector.
    pub fn tick_detector(&self) -> &Arc<StallDetector> {
        &self.tick
    }

    /// Schedule every enabled component. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn start(&self) -> anyhow::Result<()> {
        self.aggregator.start()?;
        self.loading.start()?;
        self.tick.start()?;
        self.producers.start()?;
        info!("guardian started");
        Ok(())
    }

    /// Cancel every task and clear all state. Idempotent.
    pub fn stop(&self) {
        self.producers.stop();
        self.tick.stop();
        self.loading.stop();
        self.aggregator.stop();
        self.latency.reset();
        info!("guardian stopped");
    }

    /// Push new settings to every component.
    ///
    /// Attribution settings are fixed at construction, like the module
    /// registry.
    ///
    /// # Errors
    ///
    /// Returns an error if a running component cannot be rescheduled.
    pub fn reload_from_config(&self, config: &Config) -> anyhow::Result<()> {
        self.aggregator.reload(RiskSettings::from(&config.risk))?;
        self.loading
            .reload(StallProfile::loading(&config.loading_hang))?;
        self.tick.reload(StallProfile::tick(&config.tick_hang))?;
        self.producers.reload(config)?;
        self.latency.reload(&config.performance);
        info!("guardian reloaded");
        Ok(())
    }

    /// The host finished loading; stop watching the loading phase.
    pub fn loading_complete(&self) {
        self.loading.disarm();
    }

    /// Feed one simulation tick duration.
    pub fn record_tick(&self, duration: Duration) {
        self.latency.record_tick(duration);
    }

    /// Record a symptom from outside the built-in producers.
    pub fn record_symptom(&self, key: &str, severity: Severity, description: &str) {
        self.aggregator.record_symptom(key, severity, description);
    }

    /// Start, then follow config changes until shutdown is signalled.
    ///
    /// Exits when the shutdown flag turns true or its sender is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial start fails.
    pub async fn run(
        &self,
        mut config_rx: watch::Receiver<Arc<Config>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        self.start()?;

        loop {
            tokio::select! {
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        // Watcher gone; keep running on the last config.
                        if shutdown_rx.changed().await.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                    let config = Arc::clone(&config_rx.borrow_and_update());
                    if let Err(e) = self.reload_from_config(&config) {
                        warn!(error = %format!("{e:#}"), "config reload failed");
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("guardian shutting down");
                        break;
                    }
                }
            }
        }

        self.stop();
        Ok(())
    }
}

fn bundle_sinks(config: &Config) -> Vec<Arc<dyn BundleSink>> {
    let mut sinks: Vec<Arc<dyn BundleSink>> = vec![Arc::new(LogBundleSink)];
    if config.reports.write_dumps {
        match config.dump_dir() {
            Ok(dir) => sinks.push(Arc::new(DumpWriter::new(dir))),
            Err(e) => warn!(error = %e, "no dump directory, stall reports go to the log only"),
        }
    }
    sinks
}
