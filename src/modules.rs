//! Registry of loaded extension modules.
//!
//! The registry is built once at startup (from a TOML manifest or by scanning
//! a directory of module archives) and never mutated afterwards, so every
//! reader can share it through an `Arc` without locking.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::ModulesConfig;

/// File extensions recognised as packaged module archives.
const ARCHIVE_EXTENSIONS: [&str; 2] = ["jar", "zip"];

/// One loaded extension module.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModuleInfo {
    /// Stable module identifier used in attribution results.
    pub id: String,
    /// Human-readable module name.
    #[serde(default, rename = "name")]
    pub display_name: String,
    /// Packaged archive or exploded directory the module was loaded from.
    pub artifact: PathBuf,
}

impl ModuleInfo {
    /// Create a module entry. The display name defaults to the id.
    pub fn new(id: impl Into<String>, artifact: impl Into<PathBuf>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            artifact: artifact.into(),
        }
    }

    /// Override the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default, rename = "module")]
    modules: Vec<ModuleInfo>,
}

/// Immutable snapshot of every loaded module.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: Vec<ModuleInfo>,
}

impl ModuleRegistry {
    /// Build a registry from an explicit module list.
    pub fn new(modules: Vec<ModuleInfo>) -> Self {
        Self { modules }
    }

    /// Load a registry from a TOML manifest of `[[module]]` tables.
    ///
    /// Relative artifact paths are resolved against the manifest's directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be read or parsed.
    pub fn from_manifest(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read module manifest {}", path.display()))?;
        let manifest: Manifest = toml::from_str(&contents)
            .with_context(|| format!("failed to parse module manifest {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let modules = manifest
            .modules
            .into_iter()
            .map(|mut module| {
                if module.display_name.is_empty() {
                    module.display_name.clone_from(&module.id);
                }
                if module.artifact.is_relative() {
                    module.artifact = base.join(&module.artifact);
                }
                module
            })
            .collect::<Vec<_>>();

        info!(count = modules.len(), manifest = %path.display(), "module registry loaded");
        Ok(Self { modules })
    }

    /// Build a registry by scanning a directory for module archives and
    /// exploded module directories.
    ///
    /// The module id is the lowercase file stem with any trailing version
    /// suffix removed (`Alpha-1.2.0.jar` becomes `alpha`).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn scan_dir(dir: &Path) -> anyhow::Result<Self> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read module directory {}", dir.display()))?;

        let mut modules = Vec::new();
        for entry in entries {
            let entry = entry.context("failed to read directory entry")?;
            let path = entry.path();

            let is_archive = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ARCHIVE_EXTENSIONS.contains(&ext.to_lowercase().as_str()));
            if !is_archive && !path.is_dir() {
                continue;
            }

            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                debug!(path = %path.display(), "skipping module with non-utf8 name");
                continue;
            };
            let id = module_id_from_stem(stem);
            if id.is_empty() {
                continue;
            }
            modules.push(ModuleInfo::new(id, path.clone()).with_display_name(stem));
        }

        modules.sort_by(|a, b| a.id.cmp(&b.id));
        info!(count = modules.len(), dir = %dir.display(), "module directory scanned");
        Ok(Self { modules })
    }

    /// Build the registry named by the config: the manifest if set, else the
    /// scanned directory, else an empty registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured source cannot be read.
    pub fn load(config: &ModulesConfig) -> anyhow::Result<Self> {
        if let Some(ref manifest) = config.manifest {
            return Self::from_manifest(manifest);
        }
        if let Some(ref dir) = config.dir {
            return Self::scan_dir(dir);
        }
        debug!("no module source configured, attribution limited to unknown");
        Ok(Self::default())
    }

    /// Iterate over all modules in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modules.iter()
    }

    /// Look up a module by id (case-insensitive).
    pub fn get(&self, id: &str) -> Option<&ModuleInfo> {
        self.modules.iter().find(|m| m.id.eq_ignore_ascii_case(id))
    }

    /// Number of registered modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether no modules are registered.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Derive a module id from an artifact file stem.
fn module_id_from_stem(stem: &str) -> String {
    // Cut at the first `-`/`_`/`+` that starts a version (a digit or `v<digit>`).
    let bytes = stem.as_bytes();
    let mut cut = stem.len();
    for (idx, ch) in stem.char_indices() {
        if !matches!(ch, '-' | '_' | '+') {
            continue;
        }
        let next = idx.saturating_add(1);
        let after = bytes.get(next).copied();
        let after_v = bytes.get(next.saturating_add(1)).copied();
        let starts_version = after.is_some_and(|b| b.is_ascii_digit())
            || (matches!(after, Some(b'v' | b'V')) && after_v.is_some_and(|b| b.is_ascii_digit()));
        if starts_version {
            cut = idx;
            break;
        }
    }
    stem[..cut].to_lowercase()
}
