//! Hot reload through `ConfigWatcher`.

use std::time::Duration;

use crashwatch::config::{load_config, Config, ConfigWatcher};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn valid_edit_is_published() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("crashwatch.toml");
    std::fs::write(&path, "[risk]\nalert_threshold = 5.0\n").expect("write config");
    let initial = load_config(&path).expect("initial config");

    let (watcher, mut rx) = ConfigWatcher::spawn(path.clone(), initial).expect("watcher starts");
    assert_eq!(watcher.path(), path.as_path());
    assert!((rx.borrow().risk.alert_threshold - 5.0).abs() < f64::EPSILON);

    std::fs::write(&path, "[risk]\nalert_threshold = 8.0\n").expect("rewrite config");
    tokio::time::timeout(WAIT, rx.changed())
        .await
        .expect("reload should arrive")
        .expect("watcher alive");
    assert!((rx.borrow().risk.alert_threshold - 8.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn invalid_edit_keeps_last_good_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("crashwatch.toml");
    std::fs::write(&path, "").expect("write config");

    let (_watcher, mut rx) =
        ConfigWatcher::spawn(path.clone(), Config::default()).expect("watcher starts");

    std::fs::write(&path, "[risk]\nttl_secs = 0\n").expect("write invalid config");
    let outcome = tokio::time::timeout(Duration::from_millis(500), rx.changed()).await;
    assert!(outcome.is_err(), "invalid config must not be published");
    assert_eq!(**rx.borrow(), Config::default());

    std::fs::write(&path, "[risk]\nttl_secs = 120\n").expect("fix config");
    tokio::time::timeout(WAIT, rx.changed())
        .await
        .expect("reload should arrive")
        .expect("watcher alive");
    assert_eq!(rx.borrow().risk.ttl_secs, 120);
}

#[tokio::test]
async fn unrelated_files_are_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("crashwatch.toml");
    std::fs::write(&path, "").expect("write config");

    let (_watcher, mut rx) =
        ConfigWatcher::spawn(path.clone(), Config::default()).expect("watcher starts");

    std::fs::write(dir.path().join("other.toml"), "[risk]\nttl_secs = 10\n").expect("write");
    let outcome = tokio::time::timeout(Duration::from_millis(500), rx.changed()).await;
    assert!(outcome.is_err());
}
