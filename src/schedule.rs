//! Periodic background tasks.
//!
//! Every monitor runs on its own [`PeriodicTask`]: a tokio task that ticks at
//! a fixed period and runs the synchronous check on the blocking pool, so
//! procfs reads and dump writing never stall async workers. A failing or
//! panicking cycle is logged and the next cycle still runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// A synchronous check run once per cycle.
pub type Tick = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Smallest period accepted; zero would make `tokio::time::interval` panic.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Handle to a running periodic task. Dropping it cancels the task.
pub struct PeriodicTask {
    name: String,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

impl PeriodicTask {
    /// Spawn `tick` on the current tokio runtime.
    ///
    /// The first cycle runs after `initial_delay`, then every `period`. If a
    /// cycle overruns, the next one is delayed rather than bunched up.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn spawn(
        name: impl Into<String>,
        initial_delay: Duration,
        period: Duration,
        tick: Tick,
    ) -> anyhow::Result<Self> {
        let runtime = Handle::try_current().context("periodic tasks need a tokio runtime")?;
        let name = name.into();
        let task_name = name.clone();
        let period = period.max(MIN_PERIOD);

        let handle = runtime.spawn(async move {
            tokio::time::sleep(initial_delay).await;
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let cycle = Arc::clone(&tick);
                match tokio::task::spawn_blocking(move || cycle()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(task = %task_name, error = %format!("{e:#}"), "periodic cycle failed");
                    }
                    Err(e) if e.is_panic() => {
                        error!(task = %task_name, "periodic cycle panicked");
                    }
                    Err(e) => {
                        debug!(task = %task_name, error = %e, "periodic cycle cancelled");
                    }
                }
            }
        });

        debug!(task = %name, ?initial_delay, ?period, "periodic task started");
        Ok(Self { name, handle })
    }

    /// Task name used in log events.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop future cycles without waiting. A cycle already running on the
    /// blocking pool finishes on its own.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Whether the task has stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
