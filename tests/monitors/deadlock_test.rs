//! Wait-for cycles between threads.

use std::sync::Arc;

use crashwatch::config::DeadlockConfig;
use crashwatch::monitors::deadlock::{find_deadlocks, SYMPTOM};
use crashwatch::monitors::{DeadlockMonitor, Monitor};
use crashwatch::risk::Severity;
use crashwatch::sampling::SamplerCapabilities;

use crate::support::{attributor, blocked, frame, thread, FakeSampler, MemoryRecorder};

fn two_cycles() -> Vec<crashwatch::stack::ThreadSample> {
    vec![
        blocked(1, "Alpha IO", vec![frame("com.example.alpha.Io", "flush")], 2),
        blocked(2, "Server thread", vec![frame("net.host.World", "save")], 1),
        blocked(4, "pool-4", vec![], 5),
        blocked(5, "pool-5", vec![], 3),
        blocked(3, "pool-3", vec![], 4),
        // Waits on a deadlocked thread but is not part of the cycle.
        blocked(6, "pool-6", vec![], 1),
        thread(7, "idle", vec![], 0),
    ]
}

#[test]
fn finds_each_cycle_once_in_canonical_order() {
    assert_eq!(find_deadlocks(&two_cycles()), vec![vec![1, 2], vec![3, 4, 5]]);
}

#[test]
fn no_cycle_without_mutual_waits() {
    let chain = vec![
        blocked(1, "a", vec![], 2),
        blocked(2, "b", vec![], 3),
        thread(3, "c", vec![], 0),
        blocked(9, "self", vec![], 9),
    ];
    assert!(find_deadlocks(&chain).is_empty());
}

#[test]
fn reports_new_cycles_until_cleared() {
    let recorder = MemoryRecorder::new();
    let monitor = DeadlockMonitor::new(
        DeadlockConfig::default(),
        FakeSampler::new(Vec::new()),
        attributor(&["alpha"]),
        Arc::clone(&recorder) as _,
    );

    assert_eq!(monitor.observe(&two_cycles()).len(), 2);
    assert!(monitor.observe(&two_cycles()).is_empty());

    let records = recorder.records();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.key == SYMPTOM && r.severity == Severity::Critical));
    assert_eq!(
        records[0].description,
        "Deadlock between threads 'Alpha IO' (alpha), 'Server thread' (Unknown)"
    );

    assert!(monitor.observe(&[]).is_empty());
    assert_eq!(monitor.observe(&two_cycles()).len(), 2);
    assert_eq!(recorder.records().len(), 4);
}

#[test]
fn check_idles_without_lock_info() {
    let recorder = MemoryRecorder::new();
    let sampler = FakeSampler::with_capabilities(two_cycles(), SamplerCapabilities::default());
    let monitor = DeadlockMonitor::new(
        DeadlockConfig::default(),
        sampler,
        attributor(&["alpha"]),
        Arc::clone(&recorder) as _,
    );
    monitor.check().expect("check runs");
    assert!(recorder.records().is_empty());
}

#[test]
fn check_uses_sampler_dump() {
    let recorder = MemoryRecorder::new();
    let monitor = DeadlockMonitor::new(
        DeadlockConfig::default(),
        FakeSampler::new(two_cycles()),
        attributor(&["alpha"]),
        Arc::clone(&recorder) as _,
    );
    monitor.check().expect("check runs");
    assert_eq!(recorder.records().len(), 2);

    monitor.reset();
    monitor.check().expect("check runs");
    assert_eq!(recorder.records().len(), 4);
}
