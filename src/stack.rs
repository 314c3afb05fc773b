//! Stack frames, thread samples, and stack-trace text parsing.
//!
//! Frames are host-agnostic: a JVM frame (`pkg.Class.method`), a Rust
//! backtrace symbol (`crate::module::func`), and a kernel wait channel all
//! map onto the same [`Frame`] shape so attribution can treat them alike.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// JVM-style frame: `at pkg.Class.method(File.java:12)`.
static JVM_FRAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^\s*at\s+(?:[\w.$@-]*/)*([\w$.]+)\.([\w$<>-]+)\(([^)]*)\)").ok()
});

/// Rust backtrace frame: `  3: crate::module::func` (optionally with an address).
static RUST_FRAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^\s*\d+:\s+(?:0x[0-9a-fA-F]+\s+-\s+)?([\w:<>$. ]+?)(?:::h[0-9a-f]{16})?\s*$").ok()
});

/// Kernel stack line from `/proc/<pid>/task/<tid>/stack`: `[<0>] futex_wait+0x1/0x2`.
static KERNEL_FRAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*\[<[0-9a-fx]+>\]\s+([\w.]+)\+0x[0-9a-f]+/0x[0-9a-f]+").ok());

/// Class name used for frames that come from the kernel rather than user code.
pub const KERNEL_NAMESPACE: &str = "kernel";

/// A single stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frame {
    /// Fully qualified owner of the code (class, module path, or `kernel`).
    pub class_name: String,
    /// Method or function name.
    pub method: String,
    /// Source location (`File.java:12`, `Native Method`), if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Frame {
    /// Create a frame without source location.
    pub fn new(class_name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method: method.into(),
            location: None,
        }
    }

    /// Attach a source location.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Dotted, lowercase namespace of the owning class.
    ///
    /// `::` and `/` separators are folded to `.` so module-id boundary
    /// matching works the same for every frame flavour.
    pub fn namespace(&self) -> String {
        normalize_namespace(&self.class_name)
    }

    /// Parse a single line of stack-trace text.
    ///
    /// Returns `None` for lines that are not frames (headers, `... 12 more`).
    pub fn parse_line(line: &str) -> Option<Self> {
        if let Some(caps) = JVM_FRAME.as_ref().and_then(|re| re.captures(line)) {
            let location = caps.get(3).map(|m| m.as_str().to_owned());
            return Some(Self {
                class_name: caps.get(1)?.as_str().to_owned(),
                method: caps.get(2)?.as_str().to_owned(),
                location: location.filter(|l| !l.is_empty()),
            });
        }

        if let Some(caps) = KERNEL_FRAME.as_ref().and_then(|re| re.captures(line)) {
            return Some(Self::new(KERNEL_NAMESPACE, caps.get(1)?.as_str()));
        }

        if let Some(caps) = RUST_FRAME.as_ref().and_then(|re| re.captures(line)) {
            let symbol = caps.get(1)?.as_str().trim();
            return Some(match symbol.rsplit_once("::") {
                Some((path, func)) => Self::new(path, func),
                None => Self::new("", symbol),
            });
        }

        None
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.class_name.contains("::") {
            "::"
        } else {
            "."
        };
        if self.class_name.is_empty() {
            write!(f, "{}", self.method)?;
        } else {
            write!(f, "{}{sep}{}", self.class_name, self.method)?;
        }
        if let Some(ref location) = self.location {
            write!(f, "({location})")?;
        }
        Ok(())
    }
}

/// Parse a block of stack-trace text into frames, skipping non-frame lines.
pub fn parse_stack(text: &str) -> Vec<Frame> {
    text.lines().filter_map(Frame::parse_line).collect()
}

/// Fold a class or logger name into the dotted lowercase form used for matching.
pub fn normalize_namespace(name: &str) -> String {
    name.replace("::", ".").replace('/', ".").to_lowercase()
}

/// Scheduling state of a sampled thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    /// Running or runnable.
    Runnable,
    /// Blocked on a monitor or mutex.
    Blocked,
    /// Waiting indefinitely (condition variable, futex).
    Waiting,
    /// Waiting with a timeout or sleeping interruptibly.
    TimedWaiting,
    /// Uninterruptible sleep, typically disk I/O.
    DiskSleep,
    /// Stopped or traced.
    Stopped,
    /// Exited but not yet reaped.
    Zombie,
    /// State could not be determined.
    Unknown,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Runnable => "RUNNABLE",
            Self::Blocked => "BLOCKED",
            Self::Waiting => "WAITING",
            Self::TimedWaiting => "TIMED_WAITING",
            Self::DiskSleep => "DISK_SLEEP",
            Self::Stopped => "STOPPED",
            Self::Zombie => "ZOMBIE",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

/// What a thread is blocked on, when the sampler can tell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockWait {
    /// Identifier of the lock or monitor being waited on.
    pub lock: String,
    /// Name of the thread currently holding the lock.
    #[serde(default)]
    pub owner_name: Option<String>,
    /// Id of the thread currently holding the lock.
    #[serde(default)]
    pub owner_id: Option<u64>,
}

/// Identity of a live thread, as returned by thread enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    /// Host-specific thread id.
    pub id: u64,
    /// Thread name.
    pub name: String,
}

/// One point-in-time sample of a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSample {
    /// Host-specific thread id.
    pub id: u64,
    /// Thread name.
    pub name: String,
    /// Scheduling state at sample time.
    pub state: ThreadState,
    /// Frames, most recent call first.
    pub stack: Vec<Frame>,
    /// Total CPU time consumed by the thread, if the host reports it.
    pub cpu_time: Option<Duration>,
    /// Lock the thread is waiting on, if any.
    pub lock: Option<LockWait>,
}
