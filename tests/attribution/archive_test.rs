//! Byte scan over packaged and exploded module artifacts.

use std::io::Write;
use std::path::{Path, PathBuf};

use crashwatch::attribution::archive::{scan_archive, scan_directory, scan_for_reference};
use crashwatch::modules::{ModuleInfo, ModuleRegistry};

/// Write a stored (uncompressed) zip archive with the given entries.
pub fn write_jar(dir: &Path, name: &str, entries: &[(&str, &str)]) -> PathBuf {
    let path = dir.join(name);
    let file = std::fs::File::create(&path).expect("should create archive");
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    for (entry, contents) in entries {
        zip.start_file(*entry, options).expect("should start entry");
        zip.write_all(contents.as_bytes()).expect("should write entry");
    }
    zip.finish().expect("should finish archive");
    path
}

fn class_ext() -> Vec<String> {
    vec!["class".to_owned()]
}

#[test]
fn archive_scan_checks_compiled_entries_only() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let jar = write_jar(
        tmp.path(),
        "notes.jar",
        &[
            ("README.txt", "mentions com/example/Missing"),
            ("a/B.class", "unrelated"),
        ],
    );
    let found = scan_archive(&jar, b"com/example/Missing", &class_ext()).expect("archive opens");
    assert!(!found);

    let found = scan_archive(&jar, b"com/example/Missing", &["txt".to_owned()])
        .expect("archive opens");
    assert!(found);
}

#[test]
fn archive_scan_reports_non_zip_as_error() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("plain.jar");
    std::fs::write(&path, b"plain text").expect("should write file");
    assert!(scan_archive(&path, b"x", &class_ext()).is_err());
}

#[test]
fn directory_scan_recurses() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let nested = tmp.path().join("epsilon").join("net").join("eps");
    std::fs::create_dir_all(&nested).expect("should create dirs");
    std::fs::write(nested.join("Hook.class"), b"\x00com/example/Missing\x00")
        .expect("should write class");

    let root = tmp.path().join("epsilon");
    assert!(scan_directory(&root, b"com/example/Missing", &class_ext()).expect("dir readable"));
    assert!(!scan_directory(&root, b"com/example/Other", &class_ext()).expect("dir readable"));
    assert!(scan_directory(&tmp.path().join("absent"), b"x", &class_ext()).is_err());
}

#[test]
fn registry_scan_returns_first_referencing_module() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let exploded = tmp.path().join("zeta");
    std::fs::create_dir_all(&exploded).expect("should create dir");
    std::fs::write(exploded.join("Z.class"), b"com/example/Missing").expect("should write class");
    let jar = write_jar(tmp.path(), "eta.jar", &[("e/E.class", "com/example/Missing")]);

    let registry = ModuleRegistry::new(vec![
        ModuleInfo::new("zeta", exploded),
        ModuleInfo::new("eta", jar),
    ]);
    assert_eq!(
        scan_for_reference(&registry, b"com/example/Missing", &class_ext()).as_deref(),
        Some("zeta")
    );
    assert_eq!(scan_for_reference(&registry, b"", &class_ext()), None);
    assert_eq!(
        scan_for_reference(&registry, b"com/example/Nowhere", &class_ext()),
        None
    );
}
