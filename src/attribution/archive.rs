//! Last-resort attribution: grep module code for a referenced name.
//!
//! Opens every module artifact (zip-format archive or exploded directory)
//! and searches compiled entries for the raw bytes of a missing class's
//! internal name. Cost is proportional to the total compiled code of all
//! modules, so this only runs on failure paths after every cheaper
//! heuristic came back empty. Matches are best effort and may be false
//! positives (any module that references the name is reported).

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::Context;
use tracing::debug;

use crate::modules::ModuleRegistry;

/// Return the id of the first module whose compiled code contains `needle`.
///
/// Unreadable artifacts are skipped.
pub fn scan_for_reference(
    registry: &ModuleRegistry,
    needle: &[u8],
    extensions: &[String],
) -> Option<String> {
    if needle.is_empty() {
        return None;
    }

    for module in registry.iter() {
        let result = if module.artifact.is_dir() {
            scan_directory(&module.artifact, needle, extensions)
        } else {
            scan_archive(&module.artifact, needle, extensions)
        };

        match result {
            Ok(true) => {
                debug!(module = %module.id, "missing name referenced by module code");
                return Some(module.id.clone());
            }
            Ok(false) => {}
            Err(e) => {
                debug!(module = %module.id, error = %e, "skipping unreadable module artifact");
            }
        }
    }
    None
}

/// Search a zip-format archive's compiled entries.
///
/// # Errors
///
/// Returns an error if the archive cannot be opened or is not a zip file.
pub fn scan_archive(path: &Path, needle: &[u8], extensions: &[String]) -> anyhow::Result<bool> {
    let file =
        File::open(path).with_context(|| format!("failed to open archive {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("failed to read archive {}", path.display()))?;

    let mut buf = Vec::new();
    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(archive = %path.display(), index, error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if entry.is_dir() || !has_extension(entry.name(), extensions) {
            continue;
        }

        buf.clear();
        if entry.read_to_end(&mut buf).is_err() {
            continue;
        }
        if contains(&buf, needle) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Search an exploded module directory recursively.
///
/// # Errors
///
/// Returns an error if the root directory cannot be read.
pub fn scan_directory(root: &Path, needle: &[u8], extensions: &[String]) -> anyhow::Result<bool> {
    let mut pending = vec![root.to_path_buf()];
    let mut first = true;

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if first => {
                return Err(e).with_context(|| format!("failed to read {}", dir.display()));
            }
            Err(_) => continue,
        };
        first = false;

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let name = path.to_string_lossy();
            if !has_extension(&name, extensions) {
                continue;
            }
            if std::fs::read(&path).is_ok_and(|bytes| contains(&bytes, needle)) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn has_extension(name: &str, extensions: &[String]) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(_, ext)| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}
