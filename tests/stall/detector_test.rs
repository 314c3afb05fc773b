//! Stall state machine: debounce, confirmation, reset, and lifecycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crashwatch::config::{LoadingHangConfig, TickHangConfig};
use crashwatch::risk::Severity;
use crashwatch::sampling::ThreadMatcher;
use crashwatch::stack::{Frame, ThreadInfo};
use crashwatch::stall::{Lifecycle, StallDetector, StallPhase, StallProfile, TickOutcome};

use crate::support::{attributor, frame, later, thread, FakeSampler, MemoryRecorder};

fn profile(required_matches: u32, threshold_secs: u64) -> StallProfile {
    StallProfile {
        role: "tick".to_owned(),
        symptom_key: "tick-hang".to_owned(),
        enabled: true,
        thread_names: vec!["Server thread".to_owned()],
        initial_delay: Duration::ZERO,
        interval: Duration::from_secs(5),
        hang_threshold: Duration::from_secs(threshold_secs),
        required_matches,
        min_cpu_delta: Duration::from_millis(50),
        lifecycle: Lifecycle::UntilShutdown,
    }
}

fn stuck_stack() -> Vec<Frame> {
    vec![
        frame("java.lang.Object", "wait"),
        frame("com.example.alpha.World", "tick"),
    ]
}

fn setup(profile: StallProfile) -> (StallDetector, Arc<FakeSampler>, Arc<MemoryRecorder>) {
    let sampler = FakeSampler::new(vec![thread(1, "Server thread", stuck_stack(), 1_000)]);
    let recorder = MemoryRecorder::new();
    let detector = StallDetector::new(
        profile,
        Arc::clone(&sampler) as _,
        attributor(&["alpha", "beta"]),
        Arc::clone(&recorder) as _,
    );
    (detector, sampler, recorder)
}

fn matches_of(outcome: &TickOutcome) -> Option<u32> {
    match outcome {
        TickOutcome::Suspect { matches, .. } => Some(*matches),
        _ => None,
    }
}

#[test]
fn first_sample_counts_as_progress() {
    let (detector, _sampler, recorder) = setup(profile(3, 10));
    let t0 = Instant::now();
    assert_eq!(detector.tick_at(t0), TickOutcome::Progressing);
    assert_eq!(detector.phase(), StallPhase::Progressing);
    assert_eq!(detector.state().last_progress, Some(t0));
    assert!(recorder.records().is_empty());
}

#[test]
fn confirms_only_after_matches_and_threshold() {
    let (detector, _sampler, recorder) = setup(profile(3, 10));
    let t0 = Instant::now();
    detector.tick_at(t0);

    let second = detector.tick_at(later(t0, 5));
    assert_eq!(
        second,
        TickOutcome::Suspect {
            matches: 1,
            stalled_for: Duration::from_secs(5)
        }
    );
    assert_eq!(detector.phase(), StallPhase::Suspect);

    // Threshold reached, but only two identical samples so far.
    assert_eq!(matches_of(&detector.tick_at(later(t0, 10))), Some(2));

    let bundle = match detector.tick_at(later(t0, 15)) {
        TickOutcome::Confirmed(bundle) => bundle,
        other => panic!("expected confirmation, got {other:?}"),
    };
    assert_eq!(bundle.matches, 3);
    assert_eq!(bundle.stalled_for_ms, 15_000);
    assert_eq!(bundle.module.as_str(), "alpha");

    let records = recorder.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, "tick-hang");
    assert_eq!(records[0].severity, Severity::Critical);
    assert_eq!(records[0].description, bundle.headline());
}

#[test]
fn many_matches_wait_for_threshold() {
    let mut quick = profile(2, 10);
    quick.interval = Duration::from_secs(1);
    let (detector, _sampler, _recorder) = setup(quick);
    let t0 = Instant::now();
    detector.tick_at(t0);

    for s in 1..10 {
        let outcome = detector.tick_at(later(t0, s));
        assert_eq!(outcome.phase(), Some(StallPhase::Suspect), "at {s}s");
    }
    let outcome = detector.tick_at(later(t0, 10));
    assert_eq!(outcome.phase(), Some(StallPhase::ConfirmedStall));
}

#[test]
fn confirmation_resets_so_one_stall_reports_once_per_window() {
    let (detector, _sampler, recorder) = setup(profile(3, 10));
    let t0 = Instant::now();
    for s in [0, 5, 10, 15] {
        detector.tick_at(later(t0, s));
    }
    assert_eq!(recorder.records().len(), 1);
    assert_eq!(detector.phase(), StallPhase::Progressing);
    assert_eq!(detector.state().last_progress, Some(later(t0, 15)));
    assert!(detector.state().last_stack.is_some());

    assert_eq!(matches_of(&detector.tick_at(later(t0, 20))), Some(1));
    assert_eq!(matches_of(&detector.tick_at(later(t0, 25))), Some(2));
    assert_eq!(recorder.records().len(), 1);

    assert!(matches!(
        detector.tick_at(later(t0, 30)),
        TickOutcome::Confirmed(_)
    ));
    assert_eq!(recorder.records().len(), 2);
}

#[test]
fn cpu_advance_counts_as_progress() {
    let (detector, sampler, recorder) = setup(profile(1, 5));
    let t0 = Instant::now();
    detector.tick_at(t0);

    for (s, cpu) in [(5, 1_100), (10, 1_200), (15, 1_300), (20, 1_400)] {
        sampler.set(vec![thread(1, "Server thread", stuck_stack(), cpu)]);
        assert_eq!(detector.tick_at(later(t0, s)), TickOutcome::Progressing);
    }
    assert!(recorder.records().is_empty());
}

#[test]
fn small_cpu_advance_is_not_progress() {
    let (detector, sampler, _recorder) = setup(profile(3, 10));
    let t0 = Instant::now();
    detector.tick_at(t0);

    sampler.set(vec![thread(1, "Server thread", stuck_stack(), 1_010)]);
    assert_eq!(matches_of(&detector.tick_at(later(t0, 5))), Some(1));
}

#[test]
fn idle_cpu_is_never_progress() {
    let mut zero = profile(1, 0);
    zero.min_cpu_delta = Duration::ZERO;
    let (detector, _sampler, recorder) = setup(zero);
    let t0 = Instant::now();
    detector.tick_at(t0);

    assert!(matches!(
        detector.tick_at(later(t0, 5)),
        TickOutcome::Confirmed(_)
    ));
    assert_eq!(recorder.keys(), vec!["tick-hang"]);
}

#[test]
fn stack_change_counts_as_progress() {
    let (detector, sampler, _recorder) = setup(profile(3, 10));
    let t0 = Instant::now();
    detector.tick_at(t0);
    detector.tick_at(later(t0, 5));

    sampler.set(vec![thread(
        1,
        "Server thread",
        vec![frame("com.example.alpha.World", "save")],
        1_000,
    )]);
    assert_eq!(detector.tick_at(later(t0, 10)), TickOutcome::Progressing);
    assert_eq!(detector.state().matches, 0);
}

#[test]
fn stack_change_after_threshold_restarts_the_count() {
    let (detector, sampler, recorder) = setup(profile(3, 10));
    let t0 = Instant::now();
    detector.tick_at(t0);
    assert_eq!(matches_of(&detector.tick_at(later(t0, 11))), Some(1));
    assert_eq!(matches_of(&detector.tick_at(later(t0, 16))), Some(2));

    sampler.set(vec![thread(
        1,
        "Server thread",
        vec![frame("com.example.alpha.World", "save")],
        1_000,
    )]);
    assert_eq!(detector.tick_at(later(t0, 21)), TickOutcome::Progressing);
    assert_eq!(matches_of(&detector.tick_at(later(t0, 26))), Some(1));
    assert_eq!(matches_of(&detector.tick_at(later(t0, 31))), Some(2));
    assert!(recorder.records().is_empty());
}

#[test]
fn stop_during_a_cycle_discards_its_result() {
    let (detector, sampler, recorder) = setup(profile(1, 0));
    let detector = Arc::new(detector);
    let t0 = Instant::now();
    detector.tick_at(t0);
    assert_ne!(detector.state(), Default::default());

    let weak = Arc::downgrade(&detector);
    sampler.on_sample(move || {
        if let Some(detector) = weak.upgrade() {
            detector.stop();
        }
    });
    assert_eq!(detector.tick_at(later(t0, 5)), TickOutcome::Inactive);
    assert_eq!(detector.state(), Default::default());
    assert_eq!(detector.epoch(), 1);
    assert!(recorder.records().is_empty());
}

#[test]
fn missing_thread_leaves_state_alone() {
    let (detector, sampler, recorder) = setup(profile(3, 10));
    let t0 = Instant::now();
    detector.tick_at(t0);

    sampler.set(vec![thread(9, "Worker", stuck_stack(), 0)]);
    assert_eq!(detector.tick_at(later(t0, 5)), TickOutcome::NoThread);

    sampler.fail_enumeration(true);
    assert_eq!(detector.tick_at(later(t0, 10)), TickOutcome::NoThread);

    assert_eq!(detector.state().matches, 0);
    assert_eq!(detector.state().last_progress, Some(t0));
    assert!(recorder.records().is_empty());
}

#[test]
fn disarmed_or_disabled_detector_is_inactive() {
    let (detector, _sampler, _recorder) = setup(profile(3, 10));
    detector.disarm();
    assert!(!detector.is_armed());
    assert_eq!(detector.tick(), TickOutcome::Inactive);

    let mut off = profile(3, 10);
    off.enabled = false;
    let (detector, _sampler, _recorder) = setup(off);
    assert_eq!(detector.tick(), TickOutcome::Inactive);
}

#[test]
fn thread_names_are_tried_in_priority_order() {
    let matcher = ThreadMatcher::new(vec!["Render thread".to_owned(), "main".to_owned()]);
    let threads = vec![
        ThreadInfo {
            id: 2,
            name: "main".to_owned(),
        },
        ThreadInfo {
            id: 3,
            name: "Render thread".to_owned(),
        },
    ];
    assert_eq!(matcher.find(&threads).map(|t| t.id), Some(3));
    assert_eq!(matcher.find(&threads[..1]).map(|t| t.id), Some(2));
    assert!(matcher.find(&[]).is_none());
}

#[test]
fn role_profiles_follow_config() {
    let loading = StallProfile::loading(&LoadingHangConfig::default());
    assert_eq!(loading.symptom_key, "loading-hang");
    assert_eq!(loading.lifecycle, Lifecycle::UntilDisarmed);
    assert_eq!(loading.thread_names, vec!["Render thread", "main"]);

    let tick = StallProfile::tick(&TickHangConfig::default());
    assert_eq!(tick.symptom_key, "tick-hang");
    assert_eq!(tick.lifecycle, Lifecycle::UntilShutdown);
    assert_eq!(tick.hang_threshold, Duration::from_secs(10));
    assert_eq!(tick.required_matches, 3);
}

#[tokio::test]
async fn scheduled_detector_reports_and_stops() {
    let mut fast = profile(2, 0);
    fast.interval = Duration::from_millis(10);
    let (detector, _sampler, recorder) = setup(fast);
    let detector = Arc::new(detector);

    detector.start().expect("starts inside runtime");
    assert!(detector.is_running());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(recorder.keys().iter().any(|k| k == "tick-hang"));

    detector.stop();
    assert!(!detector.is_running());
    assert_eq!(detector.state(), Default::default());
}

#[tokio::test]
async fn disarmed_detector_does_not_start() {
    let (detector, _sampler, _recorder) = setup(profile(3, 10));
    let detector = Arc::new(detector);
    detector.disarm();
    detector.start().expect("start is a no-op");
    assert!(!detector.is_running());
}

#[tokio::test]
async fn reload_to_disabled_stops_sampling() {
    let mut fast = profile(3, 10);
    fast.interval = Duration::from_millis(10);
    let (detector, _sampler, _recorder) = setup(fast.clone());
    let detector = Arc::new(detector);
    detector.start().expect("starts inside runtime");

    fast.enabled = false;
    detector.reload(fast).expect("reload succeeds");
    assert!(!detector.is_running());
    assert!(!detector.profile().enabled);
}

#[tokio::test]
async fn enabling_reload_starts_a_started_detector() {
    let mut fast = profile(3, 10);
    fast.interval = Duration::from_millis(10);
    fast.enabled = false;
    let (detector, _sampler, _recorder) = setup(fast.clone());
    let detector = Arc::new(detector);

    detector.start().expect("start while disabled is a no-op");
    assert!(!detector.is_running());

    fast.enabled = true;
    detector.reload(fast.clone()).expect("reload succeeds");
    assert!(detector.is_running());

    fast.enabled = false;
    detector.reload(fast.clone()).expect("reload succeeds");
    assert!(!detector.is_running());
    fast.enabled = true;
    detector.reload(fast.clone()).expect("reload succeeds");
    assert!(detector.is_running());

    detector.stop();
    detector.reload(fast).expect("reload succeeds");
    assert!(!detector.is_running());
}
