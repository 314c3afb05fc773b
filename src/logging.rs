//! Log subscriber setup.
//!
//! The `watch` subcommand writes JSON lines to a daily-rotated file and
//! mirrors human-readable output to stderr. One-shot subcommands log to
//! stderr only, at `warn` unless overridden, so their stdout report stays
//! readable.
//!
//! The filter is taken from `CRASHWATCH_LOG`, then `RUST_LOG`, then the
//! configured level.

use std::path::PathBuf;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Environment variable holding filter directives; wins over `RUST_LOG`.
pub const LOG_ENV: &str = "CRASHWATCH_LOG";

/// Rotated files are named `crashwatch.YYYY-MM-DD.log`.
pub const LOG_FILE_PREFIX: &str = "crashwatch";

/// Extension of the rotated log files.
pub const LOG_FILE_SUFFIX: &str = "log";

/// Default filter for one-shot subcommands.
const CLI_LEVEL: &str = "warn";

/// Where and how much the watcher logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Directory holding the rotated files.
    pub dir: PathBuf,
    /// Fallback filter directives.
    pub level: String,
    /// Rotated files kept before the oldest is deleted.
    pub max_files: usize,
}

impl LogSettings {
    /// Resolve settings from the `[logging]` section.
    ///
    /// # Errors
    ///
    /// Returns an error if no directory is configured and the home directory
    /// cannot be determined.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            dir: config.logs_dir()?,
            level: config.logging.level.clone(),
            max_files: config.logging.max_files,
        })
    }
}

/// Keeps the background log writer alive.
///
/// Dropping it flushes pending entries and closes the file, so hold it for
/// the whole run.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

impl std::fmt::Debug for LoggingGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingGuard").finish_non_exhaustive()
    }
}

/// Install the watcher's subscriber: JSON file layer plus stderr layer.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created, the appender
/// cannot be built, or a global subscriber is already installed.
pub fn init_production(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let appender = file_appender(settings)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter(&settings.level))
        .with(json_layer)
        .with(console_layer)
        .try_init()
        .context("failed to install log subscriber")?;

    Ok(LoggingGuard { _guard: guard })
}

/// Build the daily-rotated appender, creating the directory if needed.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or written.
pub fn file_appender(settings: &LogSettings) -> anyhow::Result<RollingFileAppender> {
    std::fs::create_dir_all(&settings.dir).with_context(|| {
        format!(
            "failed to create logs directory {}",
            settings.dir.display()
        )
    })?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(settings.max_files)
        .build(&settings.dir)
        .with_context(|| format!("failed to open log file in {}", settings.dir.display()))
}

/// Install a stderr-only subscriber for one-shot subcommands. Does nothing
/// if a subscriber is already installed.
pub fn init_cli() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(CLI_LEVEL))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Filter from the first valid of `CRASHWATCH_LOG` and `RUST_LOG`, else
/// `fallback`. An unparsable `fallback` falls back to `info`.
pub fn env_filter(fallback: &str) -> EnvFilter {
    [LOG_ENV, EnvFilter::DEFAULT_ENV]
        .into_iter()
        .find_map(|var| EnvFilter::try_from_env(var).ok())
        .or_else(|| EnvFilter::try_new(fallback).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}
