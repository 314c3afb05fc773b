//! Symptom bookkeeping and decayed scoring.

use std::time::{Duration, Instant};

use crashwatch::risk::{recurrence, RiskSettings, Severity, SymptomAggregator};

use crate::support::later;

fn settings() -> RiskSettings {
    RiskSettings {
        enabled: true,
        ttl: Duration::from_secs(300),
        alert_cooldown: Duration::from_secs(60),
        alert_threshold: 5.0,
        evaluation_interval: Duration::from_secs(30),
    }
}

fn close(actual: f64, expected: f64) -> bool {
    (actual - expected).abs() < 1e-3
}

#[test]
fn gc_and_memory_example() {
    let aggregator = SymptomAggregator::new(settings());
    let t0 = Instant::now();

    aggregator.record_symptom_at("gc", Severity::High, "gc pause", t0);
    aggregator.record_symptom_at("mem", Severity::High, "heap pressure", t0);
    let first = aggregator.evaluate_at(t0);
    assert!(close(first.score, 1.806), "score was {}", first.score);
    assert!(first.alert.is_none());

    for _ in 0..8 {
        aggregator.record_symptom_at("gc", Severity::High, "gc pause", t0);
    }
    let second = aggregator.evaluate_at(t0);
    assert_eq!(aggregator.symptom("gc").map(|s| s.count), Some(9));
    assert!(close(second.score, 3.903), "score was {}", second.score);
    assert!(second.alert.is_none());
    assert_eq!(second.symptoms[0].key, "gc");
}

#[test]
fn weight_decays_to_zero_then_evicts() {
    let aggregator = SymptomAggregator::new(settings());
    let t0 = Instant::now();
    aggregator.record_symptom_at("gc", Severity::Critical, "gc pause", t0);

    let scores: Vec<f64> = [0, 60, 150, 299]
        .iter()
        .map(|s| aggregator.evaluate_at(later(t0, *s)).score)
        .collect();
    assert!(scores.windows(2).all(|w| w[1] < w[0]), "scores {scores:?}");

    let at_ttl = aggregator.evaluate_at(later(t0, 300));
    assert!(at_ttl.score.abs() < f64::EPSILON);
    assert!(at_ttl.symptoms.is_empty());
    assert_eq!(at_ttl.evicted, 0);

    let past_ttl = aggregator.evaluate_at(later(t0, 301));
    assert_eq!(past_ttl.evicted, 1);
    assert!(aggregator.symptom("gc").is_none());
}

#[test]
fn recurrence_refreshes_age() {
    let aggregator = SymptomAggregator::new(settings());
    let t0 = Instant::now();
    aggregator.record_symptom_at("tick", Severity::Medium, "slow", t0);
    aggregator.record_symptom_at("tick", Severity::Medium, "slow", later(t0, 200));

    let evaluation = aggregator.evaluate_at(later(t0, 400));
    assert_eq!(evaluation.evicted, 0);
    assert!(evaluation.score > 0.0);

    let symptom = aggregator.symptom("tick").expect("symptom still live");
    assert_eq!(symptom.first_seen, t0);
    assert_eq!(symptom.last_seen, later(t0, 200));
    assert_eq!(symptom.count, 2);
}

#[test]
fn severity_never_regresses() {
    let aggregator = SymptomAggregator::new(settings());
    let t0 = Instant::now();
    aggregator.record_symptom_at("watch", Severity::High, "first", t0);
    aggregator.record_symptom_at("watch", Severity::Low, "minor", t0);

    let symptom = aggregator.symptom("watch").expect("symptom");
    assert_eq!(symptom.severity, Severity::High);
    assert_eq!(symptom.description, "first");
    assert_eq!(symptom.count, 2);

    aggregator.record_symptom_at("watch", Severity::Critical, "worse", t0);
    let symptom = aggregator.symptom("watch").expect("symptom");
    assert_eq!(symptom.severity, Severity::Critical);
    assert_eq!(symptom.description, "worse");
}

#[test]
fn recurrence_is_logarithmic() {
    assert!(close(recurrence(1), 0.30103));
    assert!(close(recurrence(9), 1.0));
    assert!(close(recurrence(99), 2.0));
    assert!(recurrence(99) < 10.0 * recurrence(9));
}

#[test]
fn disabled_aggregator_ignores_records() {
    let aggregator = SymptomAggregator::new(RiskSettings {
        enabled: false,
        ..settings()
    });
    aggregator.record_symptom("gc", Severity::Critical, "ignored");
    assert!(aggregator.symptoms().is_empty());
    assert!(aggregator.evaluate().score.abs() < f64::EPSILON);
}

#[test]
fn symptoms_listed_by_key() {
    let aggregator = SymptomAggregator::new(settings());
    aggregator.record_symptom("zeta", Severity::Low, "z");
    aggregator.record_symptom("alpha", Severity::Low, "a");
    let keys: Vec<String> = aggregator.symptoms().into_iter().map(|s| s.key).collect();
    assert_eq!(keys, vec!["alpha", "zeta"]);
}
