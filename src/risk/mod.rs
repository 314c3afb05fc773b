//! Symptom aggregation and composite crash-risk alerting.
//!
//! Producers report named symptoms with a severity. The aggregator keeps one
//! entry per key, weights each by severity, recurrence, and age, and
//! periodically sums the weights into a single score. When the score crosses
//! the alert threshold a single composite alert names the top contributors,
//! at most once per cooldown.
//!
//! ```text
//! weight = severity.weight * log10(1 + count) * max(0, 1 - age / ttl)
//! ```
//!
//! Age is measured from the last time a symptom was seen, so a recurring
//! symptom stays fresh while a one-off fades to zero and is evicted.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::schedule::PeriodicTask;

/// Number of symptoms named in an alert.
const ALERT_TOP_N: usize = 3;

/// Symptom severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Weight 1.
    Low,
    /// Weight 2.
    Medium,
    /// Weight 3.
    High,
    /// Weight 4.
    Critical,
}

impl Severity {
    /// Scoring weight.
    pub fn weight(self) -> f64 {
        match self {
            Self::Low => 1.0,
            Self::Medium => 2.0,
            Self::High => 3.0,
            Self::Critical => 4.0,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

/// Linear decay factor: 1 when fresh, 0 at and beyond `ttl`.
pub fn decay(age: Duration, ttl: Duration) -> f64 {
    if ttl.is_zero() {
        return 0.0;
    }
    (1.0 - age.as_secs_f64() / ttl.as_secs_f64()).max(0.0)
}

/// Recurrence factor `log10(1 + count)`.
#[allow(clippy::cast_precision_loss)]
pub fn recurrence(count: u64) -> f64 {
    (1.0 + count as f64).log10()
}

/// Anything that accepts symptoms.
///
/// Producers and stall detectors depend on this rather than on the
/// aggregator itself.
pub trait SymptomRecorder: Send + Sync {
    /// Record one occurrence of a symptom. Never fails.
    fn record(&self, key: &str, severity: Severity, description: &str);
}

/// One tracked symptom.
#[derive(Debug, Clone, PartialEq)]
pub struct Symptom {
    /// Signal source key.
    pub key: String,
    /// Highest severity seen while live.
    pub severity: Severity,
    /// Latest description recorded at equal or higher severity.
    pub description: String,
    /// First occurrence.
    pub first_seen: Instant,
    /// Latest occurrence.
    pub last_seen: Instant,
    /// Number of occurrences.
    pub count: u64,
}

impl Symptom {
    /// Weight at `now` under `ttl`.
    pub fn weight_at(&self, now: Instant, ttl: Duration) -> f64 {
        let age = now.saturating_duration_since(self.last_seen);
        self.severity.weight() * recurrence(self.count) * decay(age, ttl)
    }

    fn refresh(&mut self, severity: Severity, description: &str, now: Instant) {
        if severity >= self.severity {
            self.severity = severity;
            description.clone_into(&mut self.description);
        }
        self.last_seen = now;
        self.count = self.count.saturating_add(1);
    }
}

/// Aggregator tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskSettings {
    /// Record and evaluate symptoms at all.
    pub enabled: bool,
    /// Symptom lifetime.
    pub ttl: Duration,
    /// Minimum gap between alerts.
    pub alert_cooldown: Duration,
    /// Score at which an alert is raised.
    pub alert_threshold: f64,
    /// Evaluation period.
    pub evaluation_interval: Duration,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self::from(&RiskConfig::default())
    }
}

impl From<&RiskConfig> for RiskSettings {
    fn from(config: &RiskConfig) -> Self {
        Self {
            enabled: config.enabled,
            ttl: Duration::from_secs(config.ttl_secs),
            alert_cooldown: Duration::from_secs(config.alert_cooldown_secs),
            alert_threshold: config.alert_threshold,
            evaluation_interval: Duration::from_secs(config.evaluation_interval_secs),
        }
    }
}

/// A symptom's contribution to one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightedSymptom {
    /// Signal source key.
    pub key: String,
    /// Severity at evaluation time.
    pub severity: Severity,
    /// Latest description.
    pub description: String,
    /// Occurrences so far.
    pub count: u64,
    /// Decayed weight.
    pub weight: f64,
}

impl fmt::Display for WeightedSymptom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} x{})", self.description, self.severity, self.count)
    }
}

/// A composite crash-risk alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAlert {
    /// Combined score that triggered the alert.
    pub score: f64,
    /// Wall-clock time the alert was raised.
    pub raised_at: DateTime<Utc>,
    /// Heaviest symptoms, descending.
    pub top: Vec<WeightedSymptom>,
    /// Rendered one-line message.
    pub message: String,
}

impl RiskAlert {
    fn new(score: f64, top: Vec<WeightedSymptom>) -> Self {
        let raised_at = Utc::now();
        let signals = top
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        let message = format!(
            "Potential crash risk detected (score {score:.2}) at {}. Signals: {signals}",
            raised_at.format("%H:%M:%S")
        );
        Self {
            score,
            raised_at,
            top,
            message,
        }
    }
}

/// Receives composite alerts.
pub trait AlertSink: Send + Sync {
    /// Deliver one alert.
    fn alert(&self, alert: &RiskAlert);
}

/// Emits alerts as a single WARN event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, alert: &RiskAlert) {
        warn!(
            score = alert.score,
            symptoms = alert.top.len(),
            "{}",
            alert.message
        );
    }
}

/// Outcome of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Evaluation {
    /// Sum of live symptom weights.
    pub score: f64,
    /// Contributing symptoms, heaviest first.
    pub symptoms: Vec<WeightedSymptom>,
    /// Symptoms evicted for exceeding the TTL.
    pub evicted: usize,
    /// Alert raised by this pass, if any.
    pub alert: Option<RiskAlert>,
}

#[derive(Debug, Default)]
struct State {
    symptoms: HashMap<String, Symptom>,
    last_alert: Option<Instant>,
}

/// Time-decayed symptom registry with a rate-limited composite alert.
pub struct SymptomAggregator {
    state: Mutex<State>,
    settings: Mutex<RiskSettings>,
    sink: Arc<dyn AlertSink>,
    task: Mutex<Option<PeriodicTask>>,
    /// Set by `start`, cleared by `stop`; survives disabled reloads.
    active: AtomicBool,
}

impl fmt::Debug for SymptomAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymptomAggregator")
            .field("symptoms", &lock(&self.state).symptoms.len())
            .field("settings", &*lock(&self.settings))
            .field("running", &self.is_running())
            .finish()
    }
}

impl SymptomAggregator {
    /// Create an aggregator that logs alerts.
    pub fn new(settings: RiskSettings) -> Self {
        Self::with_sink(settings, Arc::new(LogAlertSink))
    }

    /// Create an aggregator delivering alerts to `sink`.
    pub fn with_sink(settings: RiskSettings, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            settings: Mutex::new(settings),
            sink,
            task: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    /// Current settings.
    pub fn settings(&self) -> RiskSettings {
        lock(&self.settings).clone()
    }

    /// Record a symptom now.
    pub fn record_symptom(&self, key: &str, severity: Severity, description: &str) {
        self.record_symptom_at(key, severity, description, Instant::now());
    }

    /// Record a symptom at an explicit instant.
    ///
    /// A new key starts at count 1. An existing key has its count and
    /// last-seen time bumped; severity and description change only when the
    /// new severity is at least the current one. No-op while disabled.
    pub fn record_symptom_at(&self, key: &str, severity: Severity, description: &str, now: Instant) {
        if !lock(&self.settings).enabled {
            return;
        }
        let mut state = lock(&self.state);
        match state.symptoms.get_mut(key) {
            Some(symptom) => symptom.refresh(severity, description, now),
            None => {
                state.symptoms.insert(
                    key.to_owned(),
                    Symptom {
                        key: key.to_owned(),
                        severity,
                        description: description.to_owned(),
                        first_seen: now,
                        last_seen: now,
                        count: 1,
                    },
                );
            }
        }
        debug!(key, %severity, "symptom recorded");
    }

    /// Evaluate now.
    pub fn evaluate(&self) -> Evaluation {
        self.evaluate_at(Instant::now())
    }

    /// Evict expired symptoms, score the rest, and alert if due.
    pub fn evaluate_at(&self, now: Instant) -> Evaluation {
        let settings = self.settings();
        let mut evaluation = Evaluation::default();

        {
            let mut state = lock(&self.state);
            let before = state.symptoms.len();
            state
                .symptoms
                .retain(|_, s| now.saturating_duration_since(s.last_seen) <= settings.ttl);
            evaluation.evicted = before.saturating_sub(state.symptoms.len());

            if state.symptoms.is_empty() {
                return evaluation;
            }

            for symptom in state.symptoms.values() {
                let weight = symptom.weight_at(now, settings.ttl);
                if weight <= 0.0 {
                    continue;
                }
                evaluation.score += weight;
                evaluation.symptoms.push(WeightedSymptom {
                    key: symptom.key.clone(),
                    severity: symptom.severity,
                    description: symptom.description.clone(),
                    count: symptom.count,
                    weight,
                });
            }
            evaluation
                .symptoms
                .sort_by(|a, b| b.weight.total_cmp(&a.weight));

            let cooled_down = state
                .last_alert
                .is_none_or(|last| now.saturating_duration_since(last) > settings.alert_cooldown);
            if evaluation.score >= settings.alert_threshold && cooled_down {
                state.last_alert = Some(now);
                let top = evaluation
                    .symptoms
                    .iter()
                    .take(ALERT_TOP_N)
                    .cloned()
                    .collect();
                evaluation.alert = Some(RiskAlert::new(evaluation.score, top));
            }
        }

        debug!(
            score = evaluation.score,
            live = evaluation.symptoms.len(),
            evicted = evaluation.evicted,
            "risk evaluated"
        );
        if let Some(ref alert) = evaluation.alert {
            self.sink.alert(alert);
        }
        evaluation
    }

    /// Copy of one symptom.
    pub fn symptom(&self, key: &str) -> Option<Symptom> {
        lock(&self.state).symptoms.get(key).cloned()
    }

    /// Copy of every tracked symptom, sorted by key.
    pub fn symptoms(&self) -> Vec<Symptom> {
        let mut all: Vec<Symptom> = lock(&self.state).symptoms.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Start periodic evaluation. No-op if running. While disabled nothing
    /// is scheduled, but a later enabling [`reload`](Self::reload) starts
    /// evaluation.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.active.store(true, Ordering::Release);
        self.schedule()
    }

    fn schedule(self: &Arc<Self>) -> anyhow::Result<()> {
        let settings = self.settings();
        if !settings.enabled {
            debug!("risk aggregator disabled");
            return Ok(());
        }
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        let this = Arc::downgrade(self);
        *task = Some(PeriodicTask::spawn(
            "risk-evaluation",
            settings.evaluation_interval,
            settings.evaluation_interval,
            Arc::new(move || {
                if let Some(aggregator) = this.upgrade() {
                    aggregator.evaluate();
                }
                Ok(())
            }),
        )?);
        info!(
            ttl_secs = settings.ttl.as_secs(),
            threshold = settings.alert_threshold,
            "risk aggregator started"
        );
        Ok(())
    }

    /// Cancel evaluation and forget every symptom. Idempotent.
    pub fn stop(&self) {
        self.active.store(false, Ordering::Release);
        self.halt();
    }

    fn halt(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.cancel();
            info!("risk aggregator stopped");
        }
        let mut state = lock(&self.state);
        state.symptoms.clear();
        state.last_alert = None;
    }

    /// Apply new settings. Once started, evaluation follows the enabled
    /// flag: disabling halts it and forgets symptoms, enabling schedules it
    /// with the new cadence.
    ///
    /// # Errors
    ///
    /// Returns an error if evaluation must restart outside a tokio runtime.
    pub fn reload(self: &Arc<Self>, settings: RiskSettings) -> anyhow::Result<()> {
        let enabled = settings.enabled;
        *lock(&self.settings) = settings;

        if !enabled {
            self.halt();
            return Ok(());
        }
        if let Some(task) = lock(&self.task).take() {
            task.cancel();
        }
        if self.active.load(Ordering::Acquire) {
            self.schedule()?;
        }
        Ok(())
    }

    /// Whether periodic evaluation is scheduled.
    pub fn is_running(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl SymptomRecorder for SymptomAggregator {
    fn record(&self, key: &str, severity: Severity, description: &str) {
        self.record_symptom(key, severity, description);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
