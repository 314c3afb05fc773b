//! Stall detection for a monitored thread role.
//!
//! A [`StallDetector`] samples one thread at a fixed cadence. A thread whose
//! stack changes, or whose CPU time advances by at least the minimum delta,
//! is progressing. Otherwise each identical sample bumps a match counter. A
//! stall is confirmed only when both hold:
//!
//! - time since the last progress is at least the hang threshold
//! - the match counter has reached the required minimum
//!
//! Confirmation produces a [`DiagnosticBundle`], records a CRITICAL symptom
//! keyed to the detector, and resets to progressing so one stuck thread
//! yields one report per threshold window instead of one per tick.
//!
//! The same detector serves two roles: the loading watcher disarms itself
//! when the host reports the phase complete, the tick watcher runs until
//! shutdown.

pub mod bundle;
pub mod sink;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};

pub use bundle::{DiagnosticBundle, ThreadReport};
pub use sink::{BundleSink, DumpWriter, LogBundleSink};

use crate::attribution::Attributor;
use crate::config::{LoadingHangConfig, TickHangConfig};
use crate::risk::{Severity, SymptomRecorder};
use crate::sampling::{ThreadMatcher, ThreadSampler};
use crate::schedule::PeriodicTask;
use crate::stack::{Frame, ThreadSample};

/// Symptom key of the loading watcher.
pub const LOADING_SYMPTOM: &str = "loading-hang";

/// Symptom key of the tick watcher.
pub const TICK_SYMPTOM: &str = "tick-hang";

/// Where a role currently sits in the stall state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallPhase {
    /// Last sample showed progress.
    Progressing,
    /// Identical samples seen, not yet confirmed.
    Suspect,
    /// A stall was confirmed on the last tick.
    ConfirmedStall,
}

/// How long a detector stays active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Active until [`StallDetector::disarm`] (a startup phase finished).
    UntilDisarmed,
    /// Active until [`StallDetector::stop`].
    UntilShutdown,
}

/// Role-specific tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct StallProfile {
    /// Role name used in logs and report file names.
    pub role: String,
    /// Symptom key recorded on confirmation.
    pub symptom_key: String,
    /// Whether the detector runs at all.
    pub enabled: bool,
    /// Thread names to watch, highest priority first.
    pub thread_names: Vec<String>,
    /// Delay before the first sample.
    pub initial_delay: Duration,
    /// Sampling period.
    pub interval: Duration,
    /// Minimum time without progress before confirming.
    pub hang_threshold: Duration,
    /// Consecutive identical samples required to confirm.
    pub required_matches: u32,
    /// CPU advance that counts as progress.
    pub min_cpu_delta: Duration,
    /// Active lifetime.
    pub lifecycle: Lifecycle,
}

impl StallProfile {
    /// Loading/startup phase watcher.
    pub fn loading(config: &LoadingHangConfig) -> Self {
        Self {
            role: "loading".to_owned(),
            symptom_key: LOADING_SYMPTOM.to_owned(),
            enabled: config.enabled,
            thread_names: config.thread_names.clone(),
            initial_delay: Duration::from_secs(config.initial_delay_secs),
            interval: Duration::from_secs(config.interval_secs),
            hang_threshold: Duration::from_secs(config.threshold_secs),
            required_matches: config.required_matches,
            min_cpu_delta: Duration::from_millis(config.min_cpu_delta_ms),
            lifecycle: Lifecycle::UntilDisarmed,
        }
    }

    /// Simulation tick thread watcher.
    pub fn tick(config: &TickHangConfig) -> Self {
        Self {
            role: "tick".to_owned(),
            symptom_key: TICK_SYMPTOM.to_owned(),
            enabled: config.enabled,
            thread_names: config.thread_names.clone(),
            initial_delay: Duration::from_secs(config.initial_delay_secs),
            interval: Duration::from_secs(config.interval_secs),
            hang_threshold: Duration::from_secs(config.threshold_secs),
            required_matches: config.required_matches,
            min_cpu_delta: Duration::from_millis(config.min_cpu_delta_ms),
            lifecycle: Lifecycle::UntilShutdown,
        }
    }
}

/// Per-role sampling state. Only the detector's own tick writes it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StallState {
    /// Stack seen at the last progress point.
    pub last_stack: Option<Vec<Frame>>,
    /// CPU time at the previous sample.
    pub last_cpu: Option<Duration>,
    /// When progress was last observed.
    pub last_progress: Option<Instant>,
    /// Consecutive identical samples since then.
    pub matches: u32,
}

impl StallState {
    fn phase(&self) -> StallPhase {
        if self.matches == 0 {
            StallPhase::Progressing
        } else {
            StallPhase::Suspect
        }
    }
}

/// Result of one detector tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Detector is disarmed or disabled.
    Inactive,
    /// The monitored thread does not exist (or exited mid-sample).
    NoThread,
    /// Sampling failed; state untouched.
    SampleFailed,
    /// The thread moved.
    Progressing,
    /// Unchanged, not yet confirmed.
    Suspect {
        /// Consecutive identical samples.
        matches: u32,
        /// Time since the last progress.
        stalled_for: Duration,
    },
    /// A stall was confirmed and reported.
    Confirmed(Box<DiagnosticBundle>),
}

impl TickOutcome {
    /// State machine phase after this tick.
    pub fn phase(&self) -> Option<StallPhase> {
        match self {
            Self::Progressing => Some(StallPhase::Progressing),
            Self::Suspect { .. } => Some(StallPhase::Suspect),
            Self::Confirmed(_) => Some(StallPhase::ConfirmedStall),
            Self::Inactive | Self::NoThread | Self::SampleFailed => None,
        }
    }
}

struct Confirmation {
    sample: ThreadSample,
    stalled_for: Duration,
    matches: u32,
    cpu_delta: Option<Duration>,
}

/// Generic stall state machine for one thread role.
pub struct StallDetector {
    profile: Mutex<StallProfile>,
    sampler: Arc<dyn ThreadSampler>,
    attributor: Arc<Attributor>,
    recorder: Arc<dyn SymptomRecorder>,
    sinks: Vec<Arc<dyn BundleSink>>,
    state: Mutex<StallState>,
    armed: AtomicBool,
    task: Mutex<Option<PeriodicTask>>,
    /// Set by `start`, cleared by `stop`; survives disabled reloads.
    active: AtomicBool,
    /// Bumped on every halt. A cycle that began under an older epoch
    /// discards its result.
    epoch: AtomicU64,
}

impl std::fmt::Debug for StallDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StallDetector")
            .field("profile", &*lock(&self.profile))
            .field("state", &*lock(&self.state))
            .field("armed", &self.armed.load(Ordering::Relaxed))
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl StallDetector {
    /// Create an armed detector with no bundle sinks.
    pub fn new(
        profile: StallProfile,
        sampler: Arc<dyn ThreadSampler>,
        attributor: Arc<Attributor>,
        recorder: Arc<dyn SymptomRecorder>,
    ) -> Self {
        Self {
            profile: Mutex::new(profile),
            sampler,
            attributor,
            recorder,
            sinks: Vec::new(),
            state: Mutex::new(StallState::default()),
            armed: AtomicBool::new(true),
            task: Mutex::new(None),
            active: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        }
    }

    /// Add a destination for confirmed-stall bundles.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn BundleSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Current profile.
    pub fn profile(&self) -> StallProfile {
        lock(&self.profile).clone()
    }

    /// Copy of the sampling state.
    pub fn state(&self) -> StallState {
        lock(&self.state).clone()
    }

    /// Current phase.
    pub fn phase(&self) -> StallPhase {
        lock(&self.state).phase()
    }

    /// Number of times sampling has been halted and its state reset.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Whether the detector still accepts ticks.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Run one sampling cycle now.
    pub fn tick(&self) -> TickOutcome {
        self.tick_at(Instant::now())
    }

    /// Run one sampling cycle at an explicit instant.
    ///
    /// A cycle overtaken by [`stop`](Self::stop) returns
    /// [`TickOutcome::Inactive`] and leaves the reset state alone.
    pub fn tick_at(&self, now: Instant) -> TickOutcome {
        let epoch = self.epoch();
        let profile = self.profile();
        if !profile.enabled || !self.is_armed() {
            return TickOutcome::Inactive;
        }

        let matcher = ThreadMatcher::new(profile.thread_names.clone());
        let Some(thread) = matcher.locate(self.sampler.as_ref()) else {
            return TickOutcome::NoThread;
        };
        let sample = match self.sampler.sample(thread.id) {
            Ok(Some(sample)) => sample,
            Ok(None) => return TickOutcome::NoThread,
            Err(e) => {
                debug!(role = %profile.role, thread = %thread.name, error = %e, "sample failed");
                return TickOutcome::SampleFailed;
            }
        };

        let confirmation = {
            let mut state = lock(&self.state);
            if self.epoch() != epoch {
                return TickOutcome::Inactive;
            }

            let cpu_delta = match (sample.cpu_time, state.last_cpu) {
                (Some(current), Some(previous)) => Some(current.saturating_sub(previous)),
                _ => None,
            };
            if sample.cpu_time.is_some() {
                state.last_cpu = sample.cpu_time;
            }

            let stack_changed = state.last_stack.as_ref() != Some(&sample.stack);
            let cpu_advanced =
                cpu_delta.is_some_and(|d| !d.is_zero() && d >= profile.min_cpu_delta);
            let last_progress = match state.last_progress {
                Some(at) if !stack_changed && !cpu_advanced => at,
                _ => {
                    state.last_stack = Some(sample.stack.clone());
                    state.last_progress = Some(now);
                    state.matches = 0;
                    return TickOutcome::Progressing;
                }
            };

            state.matches = state.matches.saturating_add(1);
            let stalled_for = now.saturating_duration_since(last_progress);
            if stalled_for < profile.hang_threshold || state.matches < profile.required_matches {
                debug!(
                    role = %profile.role,
                    matches = state.matches,
                    stalled_ms = millis(stalled_for),
                    "thread unchanged"
                );
                return TickOutcome::Suspect {
                    matches: state.matches,
                    stalled_for,
                };
            }

            let confirmation = Confirmation {
                sample,
                stalled_for,
                matches: state.matches,
                cpu_delta,
            };
            // Keep the stack; the next episode starts from here.
            state.matches = 0;
            state.last_progress = Some(now);
            confirmation
        };

        let bundle = self.build_bundle(&profile, confirmation);
        if self.epoch() != epoch {
            debug!(role = %profile.role, "stopped mid-cycle, dropping bundle");
            return TickOutcome::Inactive;
        }
        self.recorder
            .record(&profile.symptom_key, Severity::Critical, &bundle.headline());
        for sink in &self.sinks {
            sink.publish(&bundle);
        }
        TickOutcome::Confirmed(Box::new(bundle))
    }

    fn build_bundle(&self, profile: &StallProfile, confirmation: Confirmation) -> DiagnosticBundle {
        let Confirmation {
            sample,
            stalled_for,
            matches,
            cpu_delta,
        } = confirmation;

        let dump = match self.sampler.dump_all() {
            Ok(dump) => dump,
            Err(e) => {
                debug!(role = %profile.role, error = %e, "thread dump unavailable");
                Vec::new()
            }
        };

        let lock_owner_frame = sample
            .lock
            .as_ref()
            .and_then(|lock| lock.owner_id)
            .and_then(|owner| dump.iter().find(|t| t.id == owner))
            .and_then(|owner| owner.stack.first().cloned());

        let threads = dump
            .iter()
            .filter(|t| t.id != sample.id)
            .filter_map(|t| ThreadReport::filtered(t, &self.attributor))
            .collect();

        let thread = ThreadReport::full(&sample, &self.attributor);
        DiagnosticBundle {
            role: profile.role.clone(),
            detected_at: chrono::Utc::now(),
            module: thread.module.clone(),
            top_frame: sample.stack.first().cloned(),
            culprit_frame: self.attributor.find_culprit_frame(&sample.stack).cloned(),
            lock: sample.lock.clone(),
            lock_owner_frame,
            stalled_for_ms: millis(stalled_for),
            matches,
            cpu_delta_ms: cpu_delta.map(millis),
            thread,
            threads,
        }
    }

    /// Start periodic sampling. No-op if running or disarmed. While the
    /// profile is disabled nothing is scheduled, but a later enabling
    /// [`reload`](Self::reload) starts sampling.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.active.store(true, Ordering::Release);
        self.schedule()
    }

    fn schedule(self: &Arc<Self>) -> anyhow::Result<()> {
        let profile = self.profile();
        if !profile.enabled || !self.is_armed() {
            debug!(role = %profile.role, "stall detector inactive, not starting");
            return Ok(());
        }
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        let this = Arc::downgrade(self);
        *task = Some(PeriodicTask::spawn(
            format!("{}-stall", profile.role),
            profile.initial_delay,
            profile.interval,
            Arc::new(move || {
                if let Some(detector) = this.upgrade() {
                    detector.tick();
                }
                Ok(())
            }),
        )?);
        info!(
            role = %profile.role,
            threads = ?profile.thread_names,
            threshold_secs = profile.hang_threshold.as_secs(),
            "stall detector started"
        );
        Ok(())
    }

    /// Cancel sampling and reset state. Idempotent; a later `start` begins
    /// from scratch.
    pub fn stop(&self) {
        self.active.store(false, Ordering::Release);
        self.halt();
    }

    fn halt(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.cancel();
            info!(role = %lock(&self.profile).role, "stall detector stopped");
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
        *lock(&self.state) = StallState::default();
    }

    /// Permanently stop a phase watcher once its phase is over.
    pub fn disarm(&self) {
        if self.armed.swap(false, Ordering::AcqRel) {
            info!(role = %lock(&self.profile).role, "stall detector disarmed");
        }
        self.stop();
    }

    /// Apply a new profile. Once started, sampling follows the enabled
    /// flag: disabling halts it and resets state, enabling schedules it with
    /// the new cadence.
    ///
    /// # Errors
    ///
    /// Returns an error if sampling must restart outside a tokio runtime.
    pub fn reload(self: &Arc<Self>, profile: StallProfile) -> anyhow::Result<()> {
        let enabled = profile.enabled;
        *lock(&self.profile) = profile;

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

    /// Whether periodic sampling is scheduled.
    pub fn is_running(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(|t| !t.is_finished())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
