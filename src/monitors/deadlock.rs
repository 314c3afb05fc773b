//! Lock cycles between threads.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use super::{lock, Monitor, Schedule};
use crate::attribution::Attributor;
use crate::config::{Config, DeadlockConfig};
use crate::risk::{Severity, SymptomRecorder};
use crate::sampling::ThreadSampler;
use crate::stack::ThreadSample;

/// Symptom key.
pub const SYMPTOM: &str = "deadlock";

/// Find cycles in the wait-for graph of a thread dump.
///
/// Each thread waits on at most one lock, so every node has at most one
/// outgoing edge (waiter to owner). Cycles are returned with their smallest
/// thread id first, in ascending order.
pub fn find_deadlocks(threads: &[ThreadSample]) -> Vec<Vec<u64>> {
    let waits_on: HashMap<u64, u64> = threads
        .iter()
        .filter_map(|t| {
            let owner = t.lock.as_ref()?.owner_id?;
            (owner != t.id).then_some((t.id, owner))
        })
        .collect();

    let mut cycles = BTreeSet::new();
    for &start in waits_on.keys() {
        let mut path: Vec<u64> = vec![start];
        let mut current = start;
        while let Some(&next) = waits_on.get(&current) {
            if let Some(pos) = path.iter().position(|&id| id == next) {
                let mut cycle = path.split_off(pos);
                if let Some(min_pos) = cycle
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, id)| **id)
                    .map(|(i, _)| i)
                {
                    cycle.rotate_left(min_pos);
                }
                cycles.insert(cycle);
                break;
            }
            path.push(next);
            current = next;
        }
    }
    cycles.into_iter().collect()
}

/// Reports each distinct lock cycle once, until it clears.
///
/// Needs a sampler that reports lock owners; otherwise every check is a
/// no-op.
pub struct DeadlockMonitor {
    sampler: Arc<dyn ThreadSampler>,
    attributor: Arc<Attributor>,
    recorder: Arc<dyn SymptomRecorder>,
    config: Mutex<DeadlockConfig>,
    reported: Mutex<BTreeSet<Vec<u64>>>,
    unsupported_logged: AtomicBool,
}

impl std::fmt::Debug for DeadlockMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlockMonitor")
            .field("config", &*lock(&self.config))
            .field("reported", &lock(&self.reported).len())
            .finish_non_exhaustive()
    }
}

impl DeadlockMonitor {
    /// Create a monitor.
    pub fn new(
        config: DeadlockConfig,
        sampler: Arc<dyn ThreadSampler>,
        attributor: Arc<Attributor>,
        recorder: Arc<dyn SymptomRecorder>,
    ) -> Self {
        Self {
            sampler,
            attributor,
            recorder,
            config: Mutex::new(config),
            reported: Mutex::new(BTreeSet::new()),
            unsupported_logged: AtomicBool::new(false),
        }
    }

    /// Inspect a dump and report new cycles. Returns the newly reported ones.
    pub fn observe(&self, threads: &[ThreadSample]) -> Vec<Vec<u64>> {
        let cycles: BTreeSet<Vec<u64>> = find_deadlocks(threads).into_iter().collect();
        let mut reported = lock(&self.reported);

        if cycles.is_empty() && !reported.is_empty() {
            info!("deadlock cleared");
        }
        let fresh: Vec<Vec<u64>> = cycles.difference(&reported).cloned().collect();
        *reported = cycles;
        drop(reported);

        let by_id: HashMap<u64, &ThreadSample> = threads.iter().map(|t| (t.id, t)).collect();
        for cycle in &fresh {
            let members: Vec<String> = cycle
                .iter()
                .filter_map(|id| by_id.get(id))
                .map(|t| {
                    let module = self.attributor.attribute_from_stack(&t.stack);
                    format!("'{}' ({module})", t.name)
                })
                .collect();
            self.recorder.record(
                SYMPTOM,
                Severity::Critical,
                &format!("Deadlock between threads {}", members.join(", ")),
            );
        }
        fresh
    }
}

impl Monitor for DeadlockMonitor {
    fn name(&self) -> &'static str {
        "deadlock"
    }

    fn schedule(&self) -> Option<Schedule> {
        let config = lock(&self.config);
        config
            .enabled
            .then(|| Schedule::every(Duration::from_secs(config.interval_secs)))
    }

    fn check(&self) -> anyhow::Result<()> {
        if !self.sampler.capabilities().lock_info {
            if !self.unsupported_logged.swap(true, Ordering::Relaxed) {
                debug!("sampler reports no lock owners, deadlock detection idle");
            }
            return Ok(());
        }
        match self.sampler.dump_all() {
            Ok(threads) => {
                self.observe(&threads);
            }
            Err(e) => debug!(error = %e, "thread dump unavailable"),
        }
        Ok(())
    }

    fn reload(&self, config: &Config) {
        *lock(&self.config) = config.deadlock.clone();
    }

    fn reset(&self) {
        lock(&self.reported).clear();
    }
}
