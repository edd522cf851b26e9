//! Auxiliary housekeeping run by the control loop.
//!
//! Processes are invoked on the control-loop task after each scheduling
//! pass, highest priority first, no more often than their interval. They
//! see the snapshot that pass produced and must return quickly.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::DispatchError;
use crate::metrics::SchedulerSnapshot;

/// A periodic housekeeping callback.
pub trait HousekeepingProcess: Send + Sync {
    /// Unique name for logging and unregistration.
    fn name(&self) -> &str;

    /// Higher runs first within a pass.
    fn priority(&self) -> i32 {
        0
    }

    /// Minimum time between two runs.
    fn interval(&self) -> Duration;

    fn run(&self, snapshot: &SchedulerSnapshot) -> Result<(), DispatchError>;
}

struct Entry {
    process: Arc<dyn HousekeepingProcess>,
    last_run: Instant,
}

/// Registered processes, kept sorted by descending priority.
#[derive(Default)]
pub(crate) struct ProcessRegistry {
    entries: Vec<Entry>,
}

impl ProcessRegistry {
    pub(crate) fn register(
        &mut self,
        process: Arc<dyn HousekeepingProcess>,
        now: Instant,
    ) -> Result<(), DispatchError> {
        let name = process.name().to_string();
        if self.entries.iter().any(|e| e.process.name() == name) {
            return Err(DispatchError::Process {
                name,
                reason: "already registered".into(),
            });
        }
        info!(
            process = %name,
            priority = process.priority(),
            interval = ?process.interval(),
            "housekeeping process registered"
        );
        let priority = process.priority();
        // Stable: equal priorities keep registration order.
        let pos = self
            .entries
            .iter()
            .position(|e| e.process.priority() < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, Entry { process, last_run: now });
        Ok(())
    }

    pub(crate) fn unregister(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.process.name() != name);
        before != self.entries.len()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.process.name().to_string())
            .collect()
    }

    /// Run every process whose interval has elapsed. Returns the number
    /// of processes that panicked.
    pub(crate) fn run_due(&mut self, now: Instant, snapshot: &SchedulerSnapshot) -> usize {
        let mut panicked = 0;
        for entry in &mut self.entries {
            if now.saturating_duration_since(entry.last_run) < entry.process.interval() {
                continue;
            }
            entry.last_run = now;
            let process = &entry.process;
            match catch_unwind(AssertUnwindSafe(|| process.run(snapshot))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(process = process.name(), error = %e, "housekeeping process failed"),
                Err(_) => {
                    panicked += 1;
                    error!(process = process.name(), "housekeeping process panicked");
                }
            }
        }
        panicked
    }
}

// ── Built-in processes ───────────────────────────────────────────────

/// Periodic statistics flush to the log.
#[derive(Debug, Clone)]
pub struct StatisticsLogger {
    interval: Duration,
}

impl StatisticsLogger {
    pub const NAME: &'static str = "statistics";

    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl HousekeepingProcess for StatisticsLogger {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        i32::MIN
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn run(&self, snapshot: &SchedulerSnapshot) -> Result<(), DispatchError> {
        let c = &snapshot.counters;
        info!(
            state = ?snapshot.state,
            capacity = snapshot.capacity,
            active = snapshot.active,
            queued = snapshot.queued,
            killed_total = snapshot.killed_total,
            submitted = c.submitted,
            completed = c.completed,
            failed = c.failed,
            timed_out = c.timed_out,
            cancelled = c.cancelled,
            orphaned = c.orphaned,
            "scheduler statistics"
        );
        for level in &snapshot.levels {
            info!(
                priority = level.priority,
                queued = level.queued,
                active = level.active,
                reserved = level.reserved,
                "level statistics"
            );
        }
        Ok(())
    }
}
