//! Diagnostic snapshot taken when a stall is confirmed, and its text renderings.

use std::collections::HashMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::attribution::{Attribution, Attributor};
use crate::stack::{Frame, LockWait, ThreadSample, ThreadState};

/// One thread as it appears in a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadReport {
    /// Host thread id.
    pub id: u64,
    /// Thread name.
    pub name: String,
    /// Scheduling state.
    pub state: ThreadState,
    /// Best-guess owning module.
    pub module: Attribution,
    /// Frames, most recent first.
    pub frames: Vec<Frame>,
}

impl ThreadReport {
    /// Report for a thread with its complete stack.
    pub fn full(sample: &ThreadSample, attributor: &Attributor) -> Self {
        Self {
            id: sample.id,
            name: sample.name.clone(),
            state: sample.state,
            module: attributor.attribute_from_stack(&sample.stack),
            frames: sample.stack.clone(),
        }
    }

    /// Report keeping only non-platform frames.
    ///
    /// Returns `None` when nothing but platform frames remain.
    pub fn filtered(sample: &ThreadSample, attributor: &Attributor) -> Option<Self> {
        let frames: Vec<Frame> = sample
            .stack
            .iter()
            .filter(|f| !attributor.is_core_frame(f))
            .cloned()
            .collect();
        if frames.is_empty() {
            return None;
        }
        Some(Self {
            id: sample.id,
            name: sample.name.clone(),
            state: sample.state,
            module: attributor.attribute_from_stack(&sample.stack),
            frames,
        })
    }
}

/// Immutable snapshot of a confirmed stall.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticBundle {
    /// Detector role (`loading`, `tick`).
    pub role: String,
    /// Wall-clock confirmation time.
    pub detected_at: DateTime<Utc>,
    /// Implicated module.
    pub module: Attribution,
    /// Most recent frame of the stalled thread.
    pub top_frame: Option<Frame>,
    /// Frame most likely responsible.
    pub culprit_frame: Option<Frame>,
    /// What the stalled thread is blocked on.
    pub lock: Option<LockWait>,
    /// Top frame of the lock owner, when it could be sampled.
    pub lock_owner_frame: Option<Frame>,
    /// Time since the thread last made progress.
    pub stalled_for_ms: u64,
    /// Consecutive unchanged samples.
    pub matches: u32,
    /// CPU consumed since the previous sample, if reported.
    pub cpu_delta_ms: Option<u64>,
    /// The stalled thread with its full stack.
    pub thread: ThreadReport,
    /// Other live threads with platform frames removed.
    pub threads: Vec<ThreadReport>,
}

impl DiagnosticBundle {
    /// Module to thread-count pairs across the other threads, busiest first.
    pub fn suspects(&self) -> Vec<(String, usize)> {
        suspects(&self.threads)
    }

    /// One-line description used for the stall symptom.
    pub fn headline(&self) -> String {
        let seconds = self.stalled_for_ms / 1000;
        let frame = self
            .culprit_frame
            .as_ref()
            .map_or_else(|| "unknown frame".to_owned(), ToString::to_string);
        format!(
            "{} thread '{}' stalled for {seconds}s at {frame} (module {})",
            self.role, self.thread.name, self.module
        )
    }
}

/// Count threads per attributed module, highest count first.
///
/// Unattributed threads are left out.
pub fn suspects(threads: &[ThreadReport]) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for thread in threads {
        if let Some(id) = thread.module.module_id() {
            let entry = counts.entry(id).or_insert(0);
            *entry = entry.saturating_add(1);
        }
    }
    let mut ranked: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(id, n)| (id.to_owned(), n))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

/// Stalled-thread report.
pub fn render_main(bundle: &DiagnosticBundle) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Stall detected ({})", bundle.role);
    let _ = writeln!(out, "Time: {}", bundle.detected_at.to_rfc3339());
    let _ = writeln!(
        out,
        "Thread: {} (id {}) [{}]",
        bundle.thread.name, bundle.thread.id, bundle.thread.state
    );
    let _ = writeln!(out, "Module: {}", bundle.module);
    let _ = writeln!(
        out,
        "Stalled for: {} ms over {} samples",
        bundle.stalled_for_ms, bundle.matches
    );
    if let Some(cpu) = bundle.cpu_delta_ms {
        let _ = writeln!(out, "CPU since last sample: {cpu} ms");
    }
    if let Some(ref frame) = bundle.culprit_frame {
        let _ = writeln!(out, "Culprit frame: {frame}");
    }
    if let Some(ref lock) = bundle.lock {
        let _ = writeln!(out, "Waiting on: {}", lock.lock);
        if let Some(ref owner) = lock.owner_name {
            let id = lock
                .owner_id
                .map_or_else(String::new, |id| format!(" (id {id})"));
            let _ = writeln!(out, "Lock owner: {owner}{id}");
        }
        if let Some(ref frame) = bundle.lock_owner_frame {
            let _ = writeln!(out, "Lock owner at: {frame}");
        }
    }
    out.push('\n');
    for frame in &bundle.thread.frames {
        let _ = writeln!(out, "    at {frame}");
    }
    out
}

/// Filtered dump of the other threads.
pub fn render_threads(bundle: &DiagnosticBundle) -> String {
    let mut out = String::new();
    for thread in &bundle.threads {
        let _ = writeln!(
            out,
            "\"{}\" id={} {} module={}",
            thread.name, thread.id, thread.state, thread.module
        );
        for frame in &thread.frames {
            let _ = writeln!(out, "    at {frame}");
        }
        out.push('\n');
    }
    out
}

/// `thread - module [state] (n frames)` per thread.
pub fn render_summary(bundle: &DiagnosticBundle) -> String {
    let mut out = String::new();
    for thread in std::iter::once(&bundle.thread).chain(bundle.threads.iter()) {
        let _ = writeln!(
            out,
            "{} - {} [{}] ({} frames)",
            thread.name,
            thread.module,
            thread.state,
            thread.frames.len()
        );
    }
    out
}

/// `module: n thread(s)` per suspect module.
pub fn render_suspects(bundle: &DiagnosticBundle) -> String {
    let mut out = String::new();
    for (module, count) in bundle.suspects() {
        let noun = if count == 1 { "thread" } else { "threads" };
        let _ = writeln!(out, "{module}: {count} {noun}");
    }
    out
}
