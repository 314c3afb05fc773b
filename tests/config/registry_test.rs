//! Module registry sources named by `[modules]`.

use crashwatch::config::ModulesConfig;
use crashwatch::modules::ModuleRegistry;

#[test]
fn manifest_resolves_relative_artifacts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manifest = dir.path().join("modules.toml");
    std::fs::write(
        &manifest,
        r#"
[[module]]
id = "alpha"
name = "Alpha Tools"
artifact = "mods/alpha.jar"

[[module]]
id = "beta"
artifact = "/opt/beta.jar"
"#,
    )
    .expect("write manifest");

    let registry = ModuleRegistry::load(&ModulesConfig {
        manifest: Some(manifest),
        dir: None,
    })
    .expect("manifest loads");

    assert_eq!(registry.len(), 2);
    let alpha = registry.get("alpha").expect("alpha registered");
    assert_eq!(alpha.display_name, "Alpha Tools");
    assert_eq!(alpha.artifact, dir.path().join("mods/alpha.jar"));
    let beta = registry.get("beta").expect("beta registered");
    assert_eq!(beta.display_name, "beta");
}

#[test]
fn directory_scan_finds_archives_and_exploded_modules() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("Alpha-1.2.0.jar"), b"").expect("write jar");
    std::fs::write(dir.path().join("beta_v2.zip"), b"").expect("write zip");
    std::fs::write(dir.path().join("notes.txt"), b"").expect("write txt");
    std::fs::create_dir(dir.path().join("gamma")).expect("mkdir");

    let registry = ModuleRegistry::load(&ModulesConfig {
        manifest: None,
        dir: Some(dir.path().to_path_buf()),
    })
    .expect("directory scans");

    let ids: Vec<&str> = registry.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["alpha", "beta", "gamma"]);
    assert_eq!(
        registry.get("alpha").expect("alpha").display_name,
        "Alpha-1.2.0"
    );
}

#[test]
fn no_source_is_an_empty_registry() {
    let registry = ModuleRegistry::load(&ModulesConfig::default()).expect("empty");
    assert!(registry.is_empty());
}

#[test]
fn unreadable_sources_are_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("missing");
    assert!(ModuleRegistry::load(&ModulesConfig {
        manifest: Some(missing.join("modules.toml")),
        dir: None,
    })
    .is_err());
    assert!(ModuleRegistry::load(&ModulesConfig {
        manifest: None,
        dir: Some(missing),
    })
    .is_err());
}
