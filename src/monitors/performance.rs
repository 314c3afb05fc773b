//! Tick latency tracking.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use super::lock;
use crate::config::PerformanceConfig;
use crate::risk::{Severity, SymptomRecorder};

/// Symptom key.
pub const SYMPTOM: &str = "performance-slowtick";

#[derive(Debug, Default)]
struct Window {
    recent: VecDeque<Duration>,
    slow_streak: u32,
}

/// Push-based tick latency monitor. The host calls [`record_tick`] once per
/// simulation tick.
///
/// The first slow tick of a streak records a MEDIUM symptom; every
/// `escalate_every`-th consecutive slow tick records HIGH.
///
/// [`record_tick`]: TickLatencyMonitor::record_tick
pub struct TickLatencyMonitor {
    recorder: Arc<dyn SymptomRecorder>,
    config: Mutex<PerformanceConfig>,
    window: Mutex<Window>,
}

impl std::fmt::Debug for TickLatencyMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickLatencyMonitor")
            .field("config", &*lock(&self.config))
            .field("window", &*lock(&self.window))
            .finish_non_exhaustive()
    }
}

impl TickLatencyMonitor {
    /// Create a monitor.
    pub fn new(config: PerformanceConfig, recorder: Arc<dyn SymptomRecorder>) -> Self {
        Self {
            recorder,
            config: Mutex::new(config),
            window: Mutex::new(Window::default()),
        }
    }

    /// Record one tick's duration. Returns the severity reported, if any.
    pub fn record_tick(&self, duration: Duration) -> Option<Severity> {
        let config = lock(&self.config).clone();
        if !config.enabled {
            return None;
        }

        let mut window = lock(&self.window);
        window.recent.push_back(duration);
        while window.recent.len() > config.window {
            window.recent.pop_front();
        }

        let slow_after = Duration::from_millis(config.slow_tick_ms);
        if duration <= slow_after {
            if window.slow_streak > 0 {
                info!(
                    slow_ticks = window.slow_streak,
                    "tick latency back to normal"
                );
            }
            window.slow_streak = 0;
            return None;
        }

        window.slow_streak = window.slow_streak.saturating_add(1);
        let streak = window.slow_streak;
        let severity = if streak == 1 {
            Severity::Medium
        } else if streak.is_multiple_of(config.escalate_every.max(1)) {
            Severity::High
        } else {
            return None;
        };
        drop(window);

        self.recorder.record(
            SYMPTOM,
            severity,
            &format!(
                "Tick took {} ms ({streak} slow in a row, limit {} ms)",
                duration.as_millis(),
                config.slow_tick_ms
            ),
        );
        Some(severity)
    }

    /// Mean duration over the rolling window.
    pub fn average(&self) -> Option<Duration> {
        let window = lock(&self.window);
        let n = u32::try_from(window.recent.len()).ok().filter(|n| *n > 0)?;
        let total: Duration = window.recent.iter().sum();
        total.checked_div(n)
    }

    /// Consecutive slow ticks so far.
    pub fn slow_streak(&self) -> u32 {
        lock(&self.window).slow_streak
    }

    /// Apply new settings.
    pub fn reload(&self, config: &PerformanceConfig) {
        *lock(&self.config) = config.clone();
    }

    /// Forget the window and streak.
    pub fn reset(&self) {
        *lock(&self.window) = Window::default();
    }
}
