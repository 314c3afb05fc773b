//! [`ThreadSampler`] for an external Linux process, backed by `/proc`.
//!
//! Reads `/proc/<pid>/task/<tid>/{comm,stat,stack,wchan,syscall}` via
//! `std::fs`. Kernel stacks need root; without them the stack is the wait
//! channel plus the current syscall, which is still enough to tell a thread
//! parked on the same futex from one making progress.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{SampleError, SamplerCapabilities, ThreadSampler};
use crate::stack::{parse_stack, Frame, ThreadInfo, ThreadSample, ThreadState, KERNEL_NAMESPACE};

/// Kernel clock ticks per second as exposed to userspace (`USER_HZ`).
const CLOCK_TICKS_PER_SEC: u64 = 100;

/// Class name given to syscall frames.
const SYSCALL_NAMESPACE: &str = "syscall";

/// Samples threads of one process through procfs.
#[derive(Debug, Clone)]
pub struct ProcfsSampler {
    pid: u32,
    task_dir: PathBuf,
    capabilities: SamplerCapabilities,
}

impl ProcfsSampler {
    /// Sampler for `pid` under the real `/proc`.
    ///
    /// # Errors
    ///
    /// Returns an error if the process does not exist.
    pub fn new(pid: u32) -> Result<Self, SampleError> {
        Self::with_root(Path::new("/proc"), pid)
    }

    /// Sampler rooted at an alternative procfs mount.
    ///
    /// # Errors
    ///
    /// Returns an error if `<root>/<pid>/task` does not exist.
    pub fn with_root(root: &Path, pid: u32) -> Result<Self, SampleError> {
        let task_dir = root.join(pid.to_string()).join("task");
        if !task_dir.is_dir() {
            return Err(SampleError::Unsupported(format!(
                "no procfs task directory at {}",
                task_dir.display()
            )));
        }

        let main = task_dir.join(pid.to_string());
        let capabilities = SamplerCapabilities {
            cpu_time: std::fs::read_to_string(main.join("stat"))
                .ok()
                .and_then(|stat| parse_stat(&stat))
                .is_some(),
            lock_info: false,
            kernel_stacks: std::fs::read_to_string(main.join("stack")).is_ok(),
        };
        tracing::debug!(pid, ?capabilities, "procfs sampler probed");

        Ok(Self {
            pid,
            task_dir,
            capabilities,
        })
    }

    /// Process being sampled.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn read(&self, tid: u64, file: &str) -> Result<Option<String>, SampleError> {
        let path = self.task_dir.join(tid.to_string()).join(file);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SampleError::Io { path, source }),
        }
    }

    fn read_stack(&self, tid: u64) -> Vec<Frame> {
        if self.capabilities.kernel_stacks {
            if let Ok(Some(text)) = self.read(tid, "stack") {
                let frames = parse_stack(&text);
                if !frames.is_empty() {
                    return frames;
                }
            }
        }

        let mut frames = Vec::new();
        if let Ok(Some(wchan)) = self.read(tid, "wchan") {
            let wchan = wchan.trim();
            if !wchan.is_empty() && wchan != "0" {
                frames.push(Frame::new(KERNEL_NAMESPACE, wchan));
            }
        }
        if let Ok(Some(syscall)) = self.read(tid, "syscall") {
            if let Some(frame) = syscall_frame(&syscall) {
                frames.push(frame);
            }
        }
        frames
    }
}

impl ThreadSampler for ProcfsSampler {
    fn list_threads(&self) -> Result<Vec<ThreadInfo>, SampleError> {
        let entries = std::fs::read_dir(&self.task_dir).map_err(|source| SampleError::Io {
            path: self.task_dir.clone(),
            source,
        })?;

        let mut threads = Vec::new();
        for entry in entries.flatten() {
            let Some(id) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            // Threads may exit between listing and reading their name.
            if let Ok(Some(comm)) = self.read(id, "comm") {
                threads.push(ThreadInfo {
                    id,
                    name: comm.trim_end().to_owned(),
                });
            }
        }
        threads.sort_by_key(|t| t.id);
        Ok(threads)
    }

    fn sample(&self, id: u64) -> Result<Option<ThreadSample>, SampleError> {
        let Some(stat) = self.read(id, "stat")? else {
            return Ok(None);
        };
        let parsed = parse_stat(&stat)
            .ok_or_else(|| SampleError::Malformed(format!("unparseable stat for thread {id}")))?;

        Ok(Some(ThreadSample {
            id,
            name: parsed.name,
            state: parsed.state,
            stack: self.read_stack(id),
            cpu_time: Some(parsed.cpu_time),
            lock: None,
        }))
    }

    fn capabilities(&self) -> SamplerCapabilities {
        self.capabilities
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Stat {
    name: String,
    state: ThreadState,
    cpu_time: Duration,
}

/// Parse `pid (comm) state ppid ... utime stime ...`.
///
/// `comm` may contain spaces and parentheses, so split at the last `)`.
fn parse_stat(stat: &str) -> Option<Stat> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let name = stat.get(open.checked_add(1)?..close)?.to_owned();
    let rest = stat.get(close.checked_add(1)?..)?;

    // fields[0] = state (field 3), utime = field 14, stime = field 15.
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let state = parse_state(fields.first()?);
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let ticks = utime.saturating_add(stime);
    let millis = ticks.saturating_mul(1000) / CLOCK_TICKS_PER_SEC;

    Some(Stat {
        name,
        state,
        cpu_time: Duration::from_millis(millis),
    })
}

fn parse_state(s: &str) -> ThreadState {
    match s.chars().next() {
        Some('R') => ThreadState::Runnable,
        Some('S' | 'I') => ThreadState::Waiting,
        Some('D') => ThreadState::DiskSleep,
        Some('T' | 't') => ThreadState::Stopped,
        Some('Z' | 'X') => ThreadState::Zombie,
        _ => ThreadState::Unknown,
    }
}

/// `/proc/.../syscall` is `nr arg1 .. arg6 sp pc`, `running`, or `-1 sp pc`.
fn syscall_frame(text: &str) -> Option<Frame> {
    let mut parts = text.split_whitespace();
    let nr = parts.next()?;
    if nr == "running" || nr.starts_with('-') {
        return None;
    }
    let frame = Frame::new(SYSCALL_NAMESPACE, nr);
    Some(match parts.next() {
        Some(arg) => frame.with_location(arg),
        None => frame,
    })
}
