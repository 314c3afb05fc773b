//! Thread enumeration and sampling.
//!
//! The host implements [`ThreadSampler`] once. Optional abilities (CPU
//! time, lock ownership, kernel stacks) are probed when the sampler is
//! built and reported through [`SamplerCapabilities`]; callers check the
//! cached flags instead of probing on every call.

pub mod procfs;

use std::path::PathBuf;

use tracing::debug;

use crate::stack::{ThreadInfo, ThreadSample};

/// Why a sample could not be taken.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    /// The host cannot introspect threads at all.
    #[error("thread sampling unsupported: {0}")]
    Unsupported(String),

    /// Reading host state failed.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File or resource that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Host state was readable but malformed.
    #[error("malformed sample data: {0}")]
    Malformed(String),
}

/// Optional sampler abilities, probed once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerCapabilities {
    /// Per-thread CPU time is reported.
    pub cpu_time: bool,
    /// Lock waits and owners are reported.
    pub lock_info: bool,
    /// Stacks are kernel wait stacks rather than user frames.
    pub kernel_stacks: bool,
}

/// Host facility for thread enumeration and stack/CPU sampling.
pub trait ThreadSampler: Send + Sync {
    /// List live threads.
    ///
    /// # Errors
    ///
    /// Returns an error when enumeration is unsupported or fails.
    fn list_threads(&self) -> Result<Vec<ThreadInfo>, SampleError>;

    /// Sample one thread. `Ok(None)` means the thread has exited.
    ///
    /// # Errors
    ///
    /// Returns an error when the thread exists but cannot be read.
    fn sample(&self, id: u64) -> Result<Option<ThreadSample>, SampleError>;

    /// Cached capability probe.
    fn capabilities(&self) -> SamplerCapabilities;

    /// Sample every live thread, skipping threads that exit or fail mid-dump.
    ///
    /// # Errors
    ///
    /// Returns an error only when the thread list itself is unavailable.
    fn dump_all(&self) -> Result<Vec<ThreadSample>, SampleError> {
        let threads = self.list_threads()?;
        let mut samples = Vec::with_capacity(threads.len());
        for thread in threads {
            match self.sample(thread.id) {
                Ok(Some(sample)) => samples.push(sample),
                Ok(None) => {}
                Err(e) => debug!(thread = %thread.name, error = %e, "skipping thread in dump"),
            }
        }
        Ok(samples)
    }
}

/// Finds a monitored thread by name.
///
/// Names are tried in order, so `["Render thread", "main"]` prefers the
/// render thread and falls back to `main`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMatcher {
    names: Vec<String>,
}

impl ThreadMatcher {
    /// Create a matcher for the given names, highest priority first.
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Candidate names in priority order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Pick the highest-priority live thread.
    pub fn find<'a>(&self, threads: &'a [ThreadInfo]) -> Option<&'a ThreadInfo> {
        self.names
            .iter()
            .find_map(|name| threads.iter().find(|t| t.name == *name))
    }

    /// Enumerate threads through `sampler` and pick the best match.
    ///
    /// Enumeration failures count as "not found".
    pub fn locate(&self, sampler: &dyn ThreadSampler) -> Option<ThreadInfo> {
        match sampler.list_threads() {
            Ok(threads) => self.find(&threads).cloned(),
            Err(e) => {
                debug!(error = %e, "thread enumeration failed");
                None
            }
        }
    }
}
