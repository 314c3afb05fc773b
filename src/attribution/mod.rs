//! Culprit attribution: map runtime evidence back to a responsible module.
//!
//! Heuristics run cheapest first. For each frame, top to bottom:
//! 1. the module id appears on a namespace boundary of the frame's class;
//! 2. the class's defining artifact (code source) is a module's artifact.
//!
//! Only when a missing-class fault stays unresolved does
//! [`Attributor::attribute_from_fault`] fall back to the byte scan in
//! [`archive`], which reads every module's compiled code.
//!
//! `Unknown` is an expected outcome, not an error.

pub mod archive;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Serialize, Serializer};
use tracing::{debug, info};

use crate::config::AttributionConfig;
use crate::modules::ModuleRegistry;
use crate::stack::{normalize_namespace, Frame};

/// Result label used when no module could be implicated.
pub const UNKNOWN: &str = "Unknown";

/// Outcome of an attribution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Attribution {
    /// The module with this id is the best guess.
    Module(String),
    /// No heuristic matched.
    Unknown,
}

impl Attribution {
    /// Module id, or `"Unknown"`.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Module(id) => id,
            Self::Unknown => UNKNOWN,
        }
    }

    /// Module id when one was found.
    pub fn module_id(&self) -> Option<&str> {
        match self {
            Self::Module(id) => Some(id),
            Self::Unknown => None,
        }
    }

    /// Whether a module was implicated.
    pub fn is_known(&self) -> bool {
        matches!(self, Self::Module(_))
    }
}

impl fmt::Display for Attribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Attribution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Host capability: resolve the artifact that defined a class.
pub trait CodeSourceResolver: Send + Sync {
    /// Path of the archive or directory the class was loaded from, if known.
    fn code_source(&self, class_name: &str) -> Option<PathBuf>;
}

/// Resolver for hosts that cannot report code sources.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCodeSource;

impl CodeSourceResolver for NoCodeSource {
    fn code_source(&self, _class_name: &str) -> Option<PathBuf> {
        None
    }
}

/// Resolver backed by a fixed table of class-name prefixes.
///
/// The longest matching prefix wins. Useful for hosts that publish their
/// class-to-artifact mapping up front, and for offline analysis.
#[derive(Debug, Clone, Default)]
pub struct PrefixCodeSource {
    prefixes: HashMap<String, PathBuf>,
}

impl PrefixCodeSource {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map every class under `prefix` to `artifact`.
    #[must_use]
    pub fn with(mut self, prefix: impl Into<String>, artifact: impl Into<PathBuf>) -> Self {
        self.prefixes.insert(prefix.into(), artifact.into());
        self
    }
}

impl CodeSourceResolver for PrefixCodeSource {
    fn code_source(&self, class_name: &str) -> Option<PathBuf> {
        self.prefixes
            .iter()
            .filter(|(prefix, _)| class_name.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, path)| path.clone())
    }
}

/// Category of a failure handed to [`Attributor::attribute_from_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A class or symbol could not be found at load/link time.
    MissingClass,
    /// Any other failure.
    Other,
}

/// A failure with its stack, the input to fault attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Failure category.
    pub kind: FaultKind,
    /// Failure message; for missing-class faults, the missing class name.
    pub message: Option<String>,
    /// Frames, most recent call first.
    pub stack: Vec<Frame>,
}

impl Fault {
    /// A missing-class failure for `class_name`.
    pub fn missing_class(class_name: impl Into<String>, stack: Vec<Frame>) -> Self {
        Self {
            kind: FaultKind::MissingClass,
            message: Some(class_name.into()),
            stack,
        }
    }

    /// Any other failure.
    pub fn other(message: impl Into<String>, stack: Vec<Frame>) -> Self {
        Self {
            kind: FaultKind::Other,
            message: Some(message.into()),
            stack,
        }
    }

    /// Parse a textual stack trace whose first non-frame line is the
    /// failure header (`some.Error: message`).
    pub fn parse(text: &str) -> Self {
        let header = text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && Frame::parse_line(line).is_none())
            .unwrap_or_default();
        let stack = crate::stack::parse_stack(text);

        let (error_type, message) = match header.split_once(':') {
            Some((ty, msg)) => (ty.trim(), Some(msg.trim().to_owned())),
            None => (header, None),
        };
        let error_name = error_type.rsplit(['.', ':']).next().unwrap_or_default();
        let kind = if matches!(error_name, "NoClassDefFoundError" | "ClassNotFoundException") {
            FaultKind::MissingClass
        } else {
            FaultKind::Other
        };

        Self {
            kind,
            message: message.filter(|m| !m.is_empty()),
            stack,
        }
    }

    /// Internal (slash-separated) name of the missing class, if this is a
    /// missing-class fault.
    pub fn missing_internal_name(&self) -> Option<String> {
        if self.kind != FaultKind::MissingClass {
            return None;
        }
        let name = self.message.as_deref()?.trim();
        if name.is_empty() {
            return None;
        }
        Some(name.replace('.', "/"))
    }
}

/// Tunables for the attributor.
#[derive(Debug, Clone)]
pub struct AttributorOptions {
    /// Class-name prefixes of the platform and host core, skipped when
    /// choosing a culprit frame.
    pub core_prefixes: Vec<String>,
    /// Whether the last-resort archive byte scan may run.
    pub deep_scan: bool,
    /// File extensions of compiled entries inspected by the byte scan.
    pub compiled_extensions: Vec<String>,
}

impl Default for AttributorOptions {
    fn default() -> Self {
        Self {
            core_prefixes: crate::config::default_platform_prefixes(),
            deep_scan: true,
            compiled_extensions: vec!["class".to_owned()],
        }
    }
}

impl From<&AttributionConfig> for AttributorOptions {
    fn from(config: &AttributionConfig) -> Self {
        Self {
            core_prefixes: config.core_prefixes(),
            deep_scan: config.deep_scan,
            compiled_extensions: config.compiled_extensions.clone(),
        }
    }
}

#[derive(Debug)]
struct ModuleKey {
    id: String,
    lower: String,
    artifact: PathBuf,
    artifact_is_dir: bool,
}

/// Pure attribution service over an immutable module registry.
pub struct Attributor {
    registry: Arc<ModuleRegistry>,
    code_source: Arc<dyn CodeSourceResolver>,
    options: AttributorOptions,
    keys: Vec<ModuleKey>,
}

impl fmt::Debug for Attributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attributor")
            .field("modules", &self.keys.len())
            .field("options", &self.options)
            .finish()
    }
}

impl Attributor {
    /// Create an attributor without a code-source resolver.
    pub fn new(registry: Arc<ModuleRegistry>, options: AttributorOptions) -> Self {
        Self::with_code_source(registry, Arc::new(NoCodeSource), options)
    }

    /// Create an attributor using the host's code-source resolver.
    pub fn with_code_source(
        registry: Arc<ModuleRegistry>,
        code_source: Arc<dyn CodeSourceResolver>,
        options: AttributorOptions,
    ) -> Self {
        let keys = registry
            .iter()
            .map(|module| ModuleKey {
                id: module.id.clone(),
                lower: module.id.to_lowercase(),
                artifact: normalize_path(&module.artifact),
                artifact_is_dir: module.artifact.is_dir(),
            })
            .collect();
        Self {
            registry,
            code_source,
            options,
            keys,
        }
    }

    /// The registry snapshot this attributor matches against.
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Class-name prefixes treated as platform/host core.
    pub fn core_prefixes(&self) -> &[String] {
        &self.options.core_prefixes
    }

    /// Attribute a stack, scanning frames most-recent-call first.
    pub fn attribute_from_stack(&self, frames: &[Frame]) -> Attribution {
        frames
            .iter()
            .find_map(|frame| self.module_for_frame(frame))
            .map_or(Attribution::Unknown, Attribution::Module)
    }

    /// Attribute a failure.
    ///
    /// Falls back to the archive byte scan only for missing-class faults the
    /// stack heuristics could not resolve.
    pub fn attribute_from_fault(&self, fault: &Fault) -> Attribution {
        let attribution = self.attribute_from_stack(&fault.stack);
        if attribution.is_known() || !self.options.deep_scan {
            return attribution;
        }

        let Some(internal) = fault.missing_internal_name() else {
            return attribution;
        };

        info!(class = %internal, modules = self.keys.len(), "stack inconclusive, scanning module archives");
        archive::scan_for_reference(
            &self.registry,
            internal.as_bytes(),
            &self.options.compiled_extensions,
        )
        .map_or(Attribution::Unknown, Attribution::Module)
    }

    /// Attribute a logger name (exact id or namespace boundary match).
    pub fn attribute_from_logger_name(&self, logger: &str) -> Attribution {
        if logger.is_empty() {
            return Attribution::Unknown;
        }
        let lower = normalize_namespace(logger);
        self.keys
            .iter()
            .find(|key| lower == key.lower || boundary_match(&lower, &key.lower))
            .map_or(Attribution::Unknown, |key| Attribution::Module(key.id.clone()))
    }

    /// Pick the frame most likely to explain a stack.
    ///
    /// First module-attributable frame; else first frame outside the core
    /// prefixes; else the top frame. `None` only for an empty stack.
    pub fn find_culprit_frame<'a>(&self, frames: &'a [Frame]) -> Option<&'a Frame> {
        frames
            .iter()
            .find(|frame| self.module_for_frame(frame).is_some())
            .or_else(|| frames.iter().find(|frame| !self.is_core_frame(frame)))
            .or_else(|| frames.first())
    }

    /// Whether a frame belongs to the platform or host core.
    pub fn is_core_frame(&self, frame: &Frame) -> bool {
        self.options
            .core_prefixes
            .iter()
            .any(|prefix| frame.class_name.starts_with(prefix.as_str()))
    }

    fn module_for_frame(&self, frame: &Frame) -> Option<String> {
        let namespace = frame.namespace();
        if let Some(key) = self
            .keys
            .iter()
            .find(|key| boundary_match(&namespace, &key.lower))
        {
            return Some(key.id.clone());
        }
        self.module_by_code_source(&frame.class_name)
    }

    fn module_by_code_source(&self, class_name: &str) -> Option<String> {
        let source = self.code_source.code_source(class_name)?;
        let source = normalize_path(&source);

        let found = self.keys.iter().find(|key| {
            if source == key.artifact {
                return true;
            }
            if key.artifact_is_dir {
                return source.starts_with(&key.artifact);
            }
            source.file_name().is_some() && source.file_name() == key.artifact.file_name()
        });

        if let Some(key) = found {
            debug!(class = class_name, module = %key.id, "attributed by code source");
        }
        found.map(|key| key.id.clone())
    }
}

/// `id.*`, `*.id.*`, or `*.id` on a dotted lowercase namespace.
fn boundary_match(namespace: &str, id: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    namespace
        .strip_prefix(id)
        .is_some_and(|rest| rest.starts_with('.'))
        || namespace.contains(&format!(".{id}."))
        || namespace.ends_with(&format!(".{id}"))
}

/// Canonicalize when possible, otherwise make absolute lexically.
fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(real) = path.canonicalize() {
        return real;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
