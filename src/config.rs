//! Configuration loading, validation, and hot reload.
//!
//! All settings live in a single `crashwatch.toml`. Every section is
//! optional; an empty file yields the defaults below. The file is re-read on
//! change by [`ConfigWatcher`] and published through a `tokio::sync::watch`
//! channel, so monitors can pick up new thresholds without a restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "CRASHWATCH_CONFIG";

/// Default config file name inside [`config_dir`].
pub const CONFIG_FILE: &str = "crashwatch.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Symptom aggregation and composite alerting.
    pub risk: RiskConfig,
    /// Startup/loading phase stall watcher.
    pub loading_hang: LoadingHangConfig,
    /// Simulation tick thread stall watcher.
    pub tick_hang: TickHangConfig,
    /// Garbage collection pause producer.
    pub gc: GcConfig,
    /// Sustained heap pressure producer.
    pub memory_leak: MemoryLeakConfig,
    /// Hard resource caps.
    pub watchdog: WatchdogConfig,
    /// Per-module thread counts.
    pub thread_usage: ThreadUsageConfig,
    /// Tick latency producer.
    pub performance: PerformanceConfig,
    /// Lock cycle detection.
    pub deadlock: DeadlockConfig,
    /// Culprit attribution tunables.
    pub attribution: AttributionConfig,
    /// Where the module registry comes from.
    pub modules: ModulesConfig,
    /// Stall report artifacts.
    pub reports: ReportsConfig,
    /// Log filter and file retention.
    pub logging: LoggingConfig,
}

/// Symptom aggregator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Whether symptoms are recorded and evaluated at all.
    pub enabled: bool,
    /// Symptom lifetime; weights decay linearly to zero over this span.
    pub ttl_secs: u64,
    /// Minimum time between two composite alerts.
    pub alert_cooldown_secs: u64,
    /// Combined score at which an alert is raised.
    pub alert_threshold: f64,
    /// Period of the evaluation task.
    pub evaluation_interval_secs: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            alert_cooldown_secs: 60,
            alert_threshold: 5.0,
            evaluation_interval_secs: 30,
        }
    }
}

/// Loading-phase stall watcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadingHangConfig {
    /// Whether the watcher is armed at startup.
    pub enabled: bool,
    /// Candidate thread names, in priority order.
    pub thread_names: Vec<String>,
    /// Delay before the first sample.
    pub initial_delay_secs: u64,
    /// Sampling period.
    pub interval_secs: u64,
    /// Minimum time without progress before a stall can be confirmed.
    pub threshold_secs: u64,
    /// Consecutive unchanged samples required to confirm.
    pub required_matches: u32,
    /// CPU time a thread must burn between samples to count as progressing.
    pub min_cpu_delta_ms: u64,
}

impl Default for LoadingHangConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            thread_names: vec!["Render thread".to_owned(), "main".to_owned()],
            initial_delay_secs: 10,
            interval_secs: 10,
            threshold_secs: 60,
            required_matches: 4,
            min_cpu_delta_ms: 50,
        }
    }
}

/// Tick-thread stall watcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickHangConfig {
    /// Whether the watcher runs.
    pub enabled: bool,
    /// Candidate thread names, in priority order.
    pub thread_names: Vec<String>,
    /// Delay before the first sample.
    pub initial_delay_secs: u64,
    /// Sampling period.
    pub interval_secs: u64,
    /// Minimum time without progress before a stall can be confirmed.
    pub threshold_secs: u64,
    /// Consecutive unchanged samples required to confirm.
    pub required_matches: u32,
    /// CPU time a thread must burn between samples to count as progressing.
    pub min_cpu_delta_ms: u64,
}

impl Default for TickHangConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            thread_names: vec!["Server thread".to_owned()],
            initial_delay_secs: 10,
            interval_secs: 5,
            threshold_secs: 10,
            required_matches: 3,
            min_cpu_delta_ms: 50,
        }
    }
}

/// GC pause producer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Whether the producer runs.
    pub enabled: bool,
    /// Sampling period.
    pub interval_secs: u64,
    /// Collection time per period above which a pause is reported.
    pub pause_warn_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            pause_warn_ms: 2000,
        }
    }
}

/// Heap pressure producer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryLeakConfig {
    /// Whether the producer runs.
    pub enabled: bool,
    /// Sampling period.
    pub interval_secs: u64,
    /// Used/max heap ratio counted as pressure.
    pub warn_ratio: f64,
    /// Consecutive pressured samples before a symptom is recorded.
    pub warn_streak: u32,
}

impl Default for MemoryLeakConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            warn_ratio: 0.9,
            warn_streak: 3,
        }
    }
}

/// Resource watchdog settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Whether the watchdog runs.
    pub enabled: bool,
    /// Sampling period.
    pub interval_secs: u64,
    /// Heap usage cap in megabytes.
    pub max_memory_mb: u64,
    /// Live thread cap.
    pub max_threads: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            max_memory_mb: 8000,
            max_threads: 300,
        }
    }
}

/// Per-module thread usage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadUsageConfig {
    /// Whether the producer runs.
    pub enabled: bool,
    /// Sampling period.
    pub interval_secs: u64,
    /// Threads attributed to one module above which it is reported.
    pub warn_threads: u32,
}

impl Default for ThreadUsageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            warn_threads: 50,
        }
    }
}

/// Tick latency settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Whether tick durations are tracked.
    pub enabled: bool,
    /// Tick duration counted as slow.
    pub slow_tick_ms: u64,
    /// Number of recent tick durations kept for averaging.
    pub window: usize,
    /// Every n-th consecutive slow tick escalates to HIGH.
    pub escalate_every: u32,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slow_tick_ms: 100,
            window: 100,
            escalate_every: 10,
        }
    }
}

/// Deadlock detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlockConfig {
    /// Whether the detector runs.
    pub enabled: bool,
    /// Sampling period.
    pub interval_secs: u64,
}

impl Default for DeadlockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
        }
    }
}

/// Culprit attribution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    /// Allow the last-resort byte scan of module archives.
    pub deep_scan: bool,
    /// Entry extensions inspected by the byte scan.
    pub compiled_extensions: Vec<String>,
    /// Runtime/platform namespaces never blamed.
    pub platform_prefixes: Vec<String>,
    /// Host application namespaces never blamed.
    pub host_prefixes: Vec<String>,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            deep_scan: true,
            compiled_extensions: vec!["class".to_owned()],
            platform_prefixes: default_platform_prefixes(),
            host_prefixes: Vec::new(),
        }
    }
}

impl AttributionConfig {
    /// Platform and host prefixes combined.
    pub fn core_prefixes(&self) -> Vec<String> {
        self.platform_prefixes
            .iter()
            .chain(self.host_prefixes.iter())
            .cloned()
            .collect()
    }
}

/// Module registry source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    /// TOML manifest of `[[module]]` entries. Takes precedence over `dir`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<PathBuf>,
    /// Directory of module archives to scan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// Stall report output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportsConfig {
    /// Write dump files for confirmed stalls.
    pub write_dumps: bool,
    /// Dump directory. Defaults to `<config dir>/reports`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dump_dir: Option<PathBuf>,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            write_dumps: true,
            dump_dir: None,
        }
    }
}

/// Log output settings. Read once at startup; hot reload ignores them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directives used when neither `CRASHWATCH_LOG` nor `RUST_LOG`
    /// is set, e.g. `"info,crashwatch::stall=debug"`.
    pub level: String,
    /// Log directory. Defaults to `<config dir>/logs`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Rotated daily files to keep.
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            dir: None,
            max_files: 7,
        }
    }
}

/// Namespaces of language runtimes that are never a module's fault.
pub fn default_platform_prefixes() -> Vec<String> {
    [
        "java.", "javax.", "jdk.", "sun.", "com.sun.", "std::", "core::", "alloc::",
    ]
    .iter()
    .map(|p| (*p).to_owned())
    .collect()
}

impl Config {
    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first out-of-range setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        let risk = &self.risk;
        anyhow::ensure!(risk.ttl_secs > 0, "risk.ttl_secs must be positive");
        anyhow::ensure!(
            risk.alert_threshold.is_finite() && risk.alert_threshold > 0.0,
            "risk.alert_threshold must be a positive number"
        );
        anyhow::ensure!(
            risk.evaluation_interval_secs > 0,
            "risk.evaluation_interval_secs must be positive"
        );

        validate_stall(
            "loading_hang",
            self.loading_hang.interval_secs,
            self.loading_hang.required_matches,
            self.loading_hang.min_cpu_delta_ms,
            &self.loading_hang.thread_names,
        )?;
        validate_stall(
            "tick_hang",
            self.tick_hang.interval_secs,
            self.tick_hang.required_matches,
            self.tick_hang.min_cpu_delta_ms,
            &self.tick_hang.thread_names,
        )?;

        anyhow::ensure!(
            (100..=60_000).contains(&self.gc.pause_warn_ms),
            "gc.pause_warn_ms must be within 100..=60000"
        );
        anyhow::ensure!(self.gc.interval_secs > 0, "gc.interval_secs must be positive");

        let leak = &self.memory_leak;
        anyhow::ensure!(
            (0.0..=1.0).contains(&leak.warn_ratio),
            "memory_leak.warn_ratio must be within 0..=1"
        );
        anyhow::ensure!(
            (1..=100).contains(&leak.warn_streak),
            "memory_leak.warn_streak must be within 1..=100"
        );
        anyhow::ensure!(
            (5..=600).contains(&leak.interval_secs),
            "memory_leak.interval_secs must be within 5..=600"
        );

        anyhow::ensure!(
            (512..=65_536).contains(&self.watchdog.max_memory_mb),
            "watchdog.max_memory_mb must be within 512..=65536"
        );
        anyhow::ensure!(
            (32..=10_000).contains(&self.watchdog.max_threads),
            "watchdog.max_threads must be within 32..=10000"
        );
        anyhow::ensure!(
            self.watchdog.interval_secs > 0,
            "watchdog.interval_secs must be positive"
        );

        anyhow::ensure!(
            self.thread_usage.warn_threads > 0,
            "thread_usage.warn_threads must be positive"
        );
        anyhow::ensure!(
            self.thread_usage.interval_secs > 0,
            "thread_usage.interval_secs must be positive"
        );

        anyhow::ensure!(
            self.performance.slow_tick_ms > 0,
            "performance.slow_tick_ms must be positive"
        );
        anyhow::ensure!(self.performance.window > 0, "performance.window must be positive");
        anyhow::ensure!(
            self.performance.escalate_every > 0,
            "performance.escalate_every must be positive"
        );

        anyhow::ensure!(
            self.deadlock.interval_secs > 0,
            "deadlock.interval_secs must be positive"
        );

        EnvFilter::try_new(&self.logging.level)
            .with_context(|| format!("logging.level {:?} is not a filter", self.logging.level))?;
        anyhow::ensure!(
            self.logging.max_files > 0,
            "logging.max_files must be positive"
        );
        Ok(())
    }

    /// Resolve the stall dump directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no directory is configured and the home directory
    /// cannot be determined.
    pub fn dump_dir(&self) -> anyhow::Result<PathBuf> {
        match self.reports.dump_dir {
            Some(ref dir) => Ok(dir.clone()),
            None => Ok(config_dir()?.join("reports")),
        }
    }

    /// Resolve the log directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no directory is configured and the home directory
    /// cannot be determined.
    pub fn logs_dir(&self) -> anyhow::Result<PathBuf> {
        match self.logging.dir {
            Some(ref dir) => Ok(dir.clone()),
            None => Ok(config_dir()?.join("logs")),
        }
    }
}

fn validate_stall(
    section: &str,
    interval_secs: u64,
    required_matches: u32,
    min_cpu_delta_ms: u64,
    names: &[String],
) -> anyhow::Result<()> {
    anyhow::ensure!(interval_secs > 0, "{section}.interval_secs must be positive");
    anyhow::ensure!(
        required_matches > 0,
        "{section}.required_matches must be positive"
    );
    // A zero delta would count every sample with CPU time as progress.
    anyhow::ensure!(
        min_cpu_delta_ms > 0,
        "{section}.min_cpu_delta_ms must be positive"
    );
    anyhow::ensure!(
        !names.is_empty(),
        "{section}.thread_names must name at least one thread"
    );
    Ok(())
}

/// Load and validate a config file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or validated.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("invalid config at {}", path.display()))
}

/// Load the config if the file exists, otherwise return the defaults.
///
/// # Errors
///
/// Returns an error if an existing file cannot be read, parsed, or validated.
pub fn load_or_default(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        info!(path = %path.display(), "no config file found, using defaults");
        Ok(Config::default())
    }
}

/// Parse and validate config text.
///
/// # Errors
///
/// Returns an error if the TOML is malformed or a value is out of range.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config TOML")?;
    config.validate()?;
    Ok(config)
}

/// Resolve the default config directory (`~/.crashwatch/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".crashwatch"))
}

/// Resolve the config file path: `$CRASHWATCH_CONFIG`, else
/// `~/.crashwatch/crashwatch.toml`.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_path() -> anyhow::Result<PathBuf> {
    config_path_with(|key| std::env::var(key).ok())
}

/// Resolve the config path using a custom env resolver.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> anyhow::Result<PathBuf> {
    if let Some(path) = env(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    Ok(config_dir()?.join(CONFIG_FILE))
}

/// Watches the config file and republishes it on every valid change.
///
/// Invalid edits are logged and ignored; the last good config stays live.
pub struct ConfigWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("path", &self.path)
            .finish()
    }
}

impl ConfigWatcher {
    /// Start watching `path`, seeding the channel with `initial`.
    ///
    /// The parent directory is watched so editors that replace the file on
    /// save are still seen.
    ///
    /// # Errors
    ///
    /// Returns an error if the watcher cannot be created.
    pub fn spawn(
        path: PathBuf,
        initial: Config,
    ) -> anyhow::Result<(Self, watch::Receiver<Arc<Config>>)> {
        let (config_tx, config_rx) = watch::channel(Arc::new(initial));
        let (event_tx, event_rx) = std::sync::mpsc::channel::<PathBuf>();

        let mut watcher =
            notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
                if let Ok(evt) = event {
                    for path in evt.paths {
                        if event_tx.send(path).is_err() {
                            return;
                        }
                    }
                }
            })
            .context("failed to create config watcher")?;

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        if dir.is_dir() {
            watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("failed to watch {}", dir.display()))?;
        } else {
            warn!(dir = %dir.display(), "config directory missing, hot reload disabled");
        }

        let file_name = path.file_name().map(std::ffi::OsStr::to_os_string);
        let watched = path.clone();
        std::thread::spawn(move || {
            while let Ok(changed) = event_rx.recv() {
                if changed.file_name().map(std::ffi::OsStr::to_os_string) != file_name {
                    continue;
                }
                if !watched.exists() {
                    debug!(path = %watched.display(), "config file removed, keeping last config");
                    continue;
                }
                match load_config(&watched) {
                    Ok(config) => {
                        let changed = config_tx.send_if_modified(|current| {
                            if **current == config {
                                return false;
                            }
                            *current = Arc::new(config);
                            true
                        });
                        if changed {
                            info!(path = %watched.display(), "config reloaded");
                        }
                    }
                    Err(e) => {
                        warn!(path = %watched.display(), error = %format!("{e:#}"), "ignoring invalid config change");
                    }
                }
                if config_tx.is_closed() {
                    break;
                }
            }
        });

        info!(path = %path.display(), "config watcher started");
        Ok((
            Self {
                path,
                _watcher: watcher,
            },
            config_rx,
        ))
    }

    /// Path of the watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
