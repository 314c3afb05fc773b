//! Destinations for confirmed-stall bundles.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, info, warn};

use super::bundle::{self, DiagnosticBundle};

/// Receives confirmed-stall bundles.
///
/// Sinks run on the detecting background worker and must swallow their own
/// failures.
pub trait BundleSink: Send + Sync {
    /// Handle one bundle.
    fn publish(&self, bundle: &DiagnosticBundle);
}

/// Logs a WARN line per stall plus the stalled stack at DEBUG.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogBundleSink;

impl BundleSink for LogBundleSink {
    fn publish(&self, bundle: &DiagnosticBundle) {
        warn!(
            role = %bundle.role,
            thread = %bundle.thread.name,
            module = %bundle.module,
            stalled_ms = bundle.stalled_for_ms,
            samples = bundle.matches,
            "stall confirmed"
        );
        if let Some(ref lock) = bundle.lock {
            warn!(
                lock = %lock.lock,
                owner = lock.owner_name.as_deref().unwrap_or("unknown"),
                "stalled thread is waiting on a lock"
            );
        }
        for frame in &bundle.thread.frames {
            debug!(role = %bundle.role, "    at {frame}");
        }
    }
}

/// Writes each bundle as a set of report files:
///
/// - `<role>-<ts>-main.log`: the stalled thread
/// - `<role>-<ts>-threads.log`: the other threads, platform frames removed
/// - `<role>-<ts>-summary.txt`: one line per thread
/// - `<role>-<ts>-suspects.txt`: threads per module
/// - `<role>-<ts>.json`: the whole bundle
#[derive(Debug, Clone)]
pub struct DumpWriter {
    dir: PathBuf,
}

impl DumpWriter {
    /// Write dumps under `dir`, creating it on first use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write every file for `bundle` and return their paths.
    ///
    /// # Errors
    ///
    /// Returns an error on the first file that cannot be written.
    pub fn write(&self, bundle: &DiagnosticBundle) -> anyhow::Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create dump directory {}", self.dir.display()))?;

        let stem = format!(
            "{}-{}",
            bundle.role,
            bundle.detected_at.format("%Y%m%d_%H%M%S")
        );
        let json = serde_json::to_string_pretty(bundle).context("failed to serialize bundle")?;

        let files = [
            (format!("{stem}-main.log"), bundle::render_main(bundle)),
            (format!("{stem}-threads.log"), bundle::render_threads(bundle)),
            (format!("{stem}-summary.txt"), bundle::render_summary(bundle)),
            (format!("{stem}-suspects.txt"), bundle::render_suspects(bundle)),
            (format!("{stem}.json"), json),
        ];

        let mut written = Vec::with_capacity(files.len());
        for (name, contents) in files {
            let path = self.dir.join(name);
            std::fs::write(&path, contents)
                .with_context(|| format!("failed to write {}", path.display()))?;
            written.push(path);
        }
        Ok(written)
    }
}

impl BundleSink for DumpWriter {
    fn publish(&self, bundle: &DiagnosticBundle) {
        match self.write(bundle) {
            Ok(paths) => {
                if let Some(main) = paths.first() {
                    info!(role = %bundle.role, path = %main.display(), "stall report written");
                }
            }
            Err(e) => {
                warn!(role = %bundle.role, error = %format!("{e:#}"), "failed to write stall report");
            }
        }
    }
}
