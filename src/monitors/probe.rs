//! Process-level runtime metrics.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Heap or resident memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapUsage {
    /// Bytes in use.
    pub used: u64,
    /// Upper bound, if the host has one.
    pub max: Option<u64>,
}

impl HeapUsage {
    /// `used / max`, when a bound is known.
    #[allow(clippy::cast_precision_loss)]
    pub fn ratio(&self) -> Option<f64> {
        match self.max {
            Some(max) if max > 0 => Some(self.used as f64 / max as f64),
            _ => None,
        }
    }

    /// Used memory in whole megabytes.
    pub fn used_mb(&self) -> u64 {
        self.used / (1024 * 1024)
    }
}

/// Host capability: process-wide counters. Every method is optional; `None`
/// means the host cannot report it.
pub trait RuntimeProbe: Send + Sync {
    /// Cumulative time spent in garbage collection.
    fn gc_time(&self) -> Option<Duration>;

    /// Current heap usage.
    fn heap(&self) -> Option<HeapUsage>;

    /// Live thread count.
    fn thread_count(&self) -> Option<u32>;
}

/// [`RuntimeProbe`] for an external Linux process.
///
/// Heap is the resident set (`VmRSS`) bounded by `MemTotal`; there is no
/// collector to report on.
#[derive(Debug, Clone)]
pub struct ProcfsProbe {
    status: PathBuf,
    meminfo: PathBuf,
}

impl ProcfsProbe {
    /// Probe for `pid` under the real `/proc`.
    pub fn new(pid: u32) -> Self {
        Self::with_root(Path::new("/proc"), pid)
    }

    /// Probe rooted at an alternative procfs mount.
    pub fn with_root(root: &Path, pid: u32) -> Self {
        Self {
            status: root.join(pid.to_string()).join("status"),
            meminfo: root.join("meminfo"),
        }
    }

    fn status_field(&self, key: &str) -> Option<u64> {
        let status = std::fs::read_to_string(&self.status).ok()?;
        field(&status, key)
    }
}

impl RuntimeProbe for ProcfsProbe {
    fn gc_time(&self) -> Option<Duration> {
        None
    }

    fn heap(&self) -> Option<HeapUsage> {
        let rss_kb = self.status_field("VmRSS")?;
        let total_kb = std::fs::read_to_string(&self.meminfo)
            .ok()
            .and_then(|meminfo| field(&meminfo, "MemTotal"));
        Some(HeapUsage {
            used: rss_kb.saturating_mul(1024),
            max: total_kb.map(|kb| kb.saturating_mul(1024)),
        })
    }

    fn thread_count(&self) -> Option<u32> {
        self.status_field("Threads")
            .and_then(|n| u32::try_from(n).ok())
    }
}

/// First number on the `key:` line of a procfs key/value file.
fn field(text: &str, key: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim() != key {
            return None;
        }
        value.split_whitespace().next()?.parse().ok()
    })
}
