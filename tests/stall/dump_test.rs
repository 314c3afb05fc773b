//! Report files written by `DumpWriter`.

use chrono::Utc;

use crashwatch::attribution::Attribution;
use crashwatch::stack::ThreadState;
use crashwatch::stall::{BundleSink, DiagnosticBundle, DumpWriter, ThreadReport};

use crate::support::frame;

fn bundle() -> DiagnosticBundle {
    let thread = ThreadReport {
        id: 1,
        name: "Render thread".to_owned(),
        state: ThreadState::Waiting,
        module: Attribution::Module("gamma".to_owned()),
        frames: vec![
            frame("java.lang.Object", "wait"),
            frame("com.example.gamma.Textures", "load"),
        ],
    };
    DiagnosticBundle {
        role: "loading".to_owned(),
        detected_at: Utc::now(),
        module: Attribution::Module("gamma".to_owned()),
        top_frame: thread.frames.first().cloned(),
        culprit_frame: thread.frames.get(1).cloned(),
        lock: None,
        lock_owner_frame: None,
        stalled_for_ms: 60_000,
        matches: 4,
        cpu_delta_ms: Some(0),
        thread,
        threads: Vec::new(),
    }
}

#[test]
fn writes_all_report_files() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let dir = tmp.path().join("dumps");
    let writer = DumpWriter::new(&dir);

    let paths = writer.write(&bundle()).expect("dump written");
    assert_eq!(paths.len(), 5);
    for path in &paths {
        assert!(path.exists(), "{} missing", path.display());
        assert!(path.starts_with(&dir));
    }

    let names: Vec<String> = paths
        .iter()
        .filter_map(|p| p.file_name()?.to_str().map(str::to_owned))
        .collect();
    assert!(names.iter().all(|n| n.starts_with("loading-")));
    for suffix in ["-main.log", "-threads.log", "-summary.txt", "-suspects.txt", ".json"] {
        assert!(names.iter().any(|n| n.ends_with(suffix)), "no {suffix} file");
    }

    let main = std::fs::read_to_string(&paths[0]).expect("main report readable");
    assert!(main.contains("Culprit frame: com.example.gamma.Textures.load"));
    assert!(main.contains("CPU since last sample: 0 ms"));

    let json_path = paths
        .iter()
        .find(|p| p.extension().is_some_and(|e| e == "json"))
        .expect("json report");
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(json_path).expect("json readable"))
            .expect("valid json");
    assert_eq!(json["module"], "gamma");
    assert_eq!(json["thread"]["state"], "waiting");
    assert_eq!(json["stalled_for_ms"], 60_000);
}

#[test]
fn unwritable_directory_is_an_error_not_a_panic() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let blocker = tmp.path().join("file");
    std::fs::write(&blocker, b"x").expect("should write file");

    let writer = DumpWriter::new(blocker.join("dumps"));
    assert!(writer.write(&bundle()).is_err());
    writer.publish(&bundle());
}
