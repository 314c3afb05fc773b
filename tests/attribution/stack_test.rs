//! Stack, logger-name, and culprit-frame attribution.

use std::sync::Arc;

use crashwatch::attribution::{Attribution, Attributor, AttributorOptions, PrefixCodeSource};
use crashwatch::modules::{ModuleInfo, ModuleRegistry};
use crashwatch::stack::parse_stack;

use crate::support::{attributor, frame, registry};

fn module(id: &str) -> Attribution {
    Attribution::Module(id.to_owned())
}

#[test]
fn most_recent_module_frame_wins() {
    let attributor = attributor(&["alpha", "beta"]);
    let stack = vec![
        frame("java.lang.Thread", "sleep"),
        frame("com.example.beta.Loader", "load"),
        frame("com.example.alpha.Engine", "run"),
    ];
    assert_eq!(attributor.attribute_from_stack(&stack), module("beta"));

    let reversed: Vec<_> = stack.into_iter().rev().collect();
    assert_eq!(attributor.attribute_from_stack(&reversed), module("alpha"));
}

#[test]
fn platform_only_stack_is_unknown() {
    let attributor = attributor(&["alpha"]);
    let stack = vec![
        frame("java.lang.Object", "wait"),
        frame("java.util.concurrent.locks.LockSupport", "park"),
    ];
    let result = attributor.attribute_from_stack(&stack);
    assert_eq!(result, Attribution::Unknown);
    assert_eq!(result.to_string(), "Unknown");
    assert!(attributor.attribute_from_stack(&[]).module_id().is_none());
}

#[test]
fn id_must_sit_on_a_namespace_boundary() {
    let attributor = attributor(&["alpha"]);
    assert_eq!(
        attributor.attribute_from_stack(&[frame("com.alphabet.Thing", "go")]),
        Attribution::Unknown
    );
    assert_eq!(
        attributor.attribute_from_stack(&[frame("alpha.core.Engine", "go")]),
        module("alpha")
    );
    assert_eq!(
        attributor.attribute_from_stack(&[frame("net.mods.alpha", "init")]),
        module("alpha")
    );
}

#[test]
fn matching_ignores_case() {
    let attributor = attributor(&["Alpha"]);
    assert_eq!(
        attributor.attribute_from_stack(&[frame("com.example.alpha.Engine", "run")]),
        module("Alpha")
    );
}

#[test]
fn rust_symbols_match_like_classes() {
    let attributor = attributor(&["beta_mod"]);
    let stack = parse_stack(
        "   0: std::thread::sleep\n   1: beta_mod::world::Chunk::load::h0123456789abcdef\n",
    );
    assert_eq!(stack.len(), 2);
    assert_eq!(attributor.attribute_from_stack(&stack), module("beta_mod"));
}

#[test]
fn code_source_attributes_shaded_classes() {
    let registry = Arc::new(ModuleRegistry::new(vec![ModuleInfo::new(
        "gamma",
        "/opt/mods/gamma-1.0.jar",
    )]));
    let code_source = PrefixCodeSource::new().with("org.shaded.", "/opt/mods/gamma-1.0.jar");
    let attributor = Attributor::with_code_source(
        registry,
        Arc::new(code_source),
        AttributorOptions::default(),
    );

    let stack = vec![
        frame("java.lang.Thread", "run"),
        frame("org.shaded.util.Pool", "take"),
    ];
    assert_eq!(attributor.attribute_from_stack(&stack), module("gamma"));
}

#[test]
fn code_source_matches_archive_file_name_elsewhere() {
    let registry = Arc::new(ModuleRegistry::new(vec![ModuleInfo::new(
        "gamma",
        "/opt/mods/gamma-1.0.jar",
    )]));
    let code_source = PrefixCodeSource::new().with("org.shaded.", "/var/cache/copy/gamma-1.0.jar");
    let attributor = Attributor::with_code_source(
        registry,
        Arc::new(code_source),
        AttributorOptions::default(),
    );
    assert_eq!(
        attributor.attribute_from_stack(&[frame("org.shaded.util.Pool", "take")]),
        module("gamma")
    );
}

#[test]
fn code_source_inside_exploded_module_directory() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let module_dir = tmp.path().join("delta");
    let classes = module_dir.join("classes");
    std::fs::create_dir_all(&classes).expect("should create module dir");

    let registry = Arc::new(ModuleRegistry::new(vec![ModuleInfo::new(
        "delta",
        module_dir.clone(),
    )]));
    let code_source = PrefixCodeSource::new().with("io.vendor.", classes);
    let attributor = Attributor::with_code_source(
        registry,
        Arc::new(code_source),
        AttributorOptions::default(),
    );
    assert_eq!(
        attributor.attribute_from_stack(&[frame("io.vendor.Client", "send")]),
        module("delta")
    );
}

#[test]
fn logger_names_match_exactly_or_on_boundaries() {
    let attributor = attributor(&["alpha", "beta"]);
    assert_eq!(attributor.attribute_from_logger_name("alpha"), module("alpha"));
    assert_eq!(attributor.attribute_from_logger_name("ALPHA"), module("alpha"));
    assert_eq!(
        attributor.attribute_from_logger_name("com.example.beta.Network"),
        module("beta")
    );
    assert_eq!(attributor.attribute_from_logger_name("alpha::net"), module("alpha"));
    assert_eq!(
        attributor.attribute_from_logger_name("alphabet"),
        Attribution::Unknown
    );
    assert_eq!(attributor.attribute_from_logger_name(""), Attribution::Unknown);
}

#[test]
fn culprit_prefers_module_frame() {
    let attributor = attributor(&["beta"]);
    let stack = vec![
        frame("java.lang.Object", "wait"),
        frame("org.lib.Util", "call"),
        frame("com.example.beta.Task", "run"),
    ];
    let culprit = attributor.find_culprit_frame(&stack).expect("culprit frame");
    assert_eq!(culprit.class_name, "com.example.beta.Task");
}

#[test]
fn culprit_falls_back_to_first_non_core_frame() {
    let attributor = attributor(&["beta"]);
    let stack = vec![
        frame("java.lang.Object", "wait"),
        frame("org.lib.Util", "call"),
        frame("java.lang.Thread", "run"),
    ];
    let culprit = attributor.find_culprit_frame(&stack).expect("culprit frame");
    assert_eq!(culprit.class_name, "org.lib.Util");
}

#[test]
fn culprit_falls_back_to_top_frame_then_none() {
    let attributor = attributor(&["beta"]);
    let stack = vec![
        frame("java.lang.Object", "wait"),
        frame("java.lang.Thread", "run"),
    ];
    let culprit = attributor.find_culprit_frame(&stack).expect("culprit frame");
    assert_eq!(culprit.method, "wait");
    assert!(attributor.find_culprit_frame(&[]).is_none());
}

#[test]
fn host_prefixes_count_as_core() {
    let options = AttributorOptions {
        core_prefixes: vec!["java.".to_owned(), "net.host.".to_owned()],
        ..AttributorOptions::default()
    };
    let attributor = Attributor::new(registry(&["beta"]), options);
    let stack = vec![
        frame("net.host.Server", "tick"),
        frame("org.lib.Util", "call"),
    ];
    assert!(attributor.is_core_frame(&stack[0]));
    let culprit = attributor.find_culprit_frame(&stack).expect("culprit frame");
    assert_eq!(culprit.class_name, "org.lib.Util");
}
