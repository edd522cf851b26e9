use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{watch, Notify};

use switchyard_core::SchedulerConfig;

use crate::autotune::Autotuner;
use crate::availability::AvailabilityManager;
use crate::cpu::CpuProbe;
use crate::metrics::{Counters, ExecutionStats, LevelSnapshot, SchedulerSnapshot};
use crate::observer::{LifecycleEvent, ObserverSet};
use crate::process::ProcessRegistry;
use crate::queue::PriorityQueue;
use crate::work::{WorkId, WorkItem};

use super::SchedulerState;

/// Lock a std mutex, recovering the data if a panicking holder poisoned it.
pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Timing and policy knobs fixed at build time.
#[derive(Debug, Clone)]
pub(super) struct Settings {
    pub(super) kill_grace: Duration,
    pub(super) idle_tick: Duration,
    pub(super) internal_bypass: bool,
    pub(super) default_max_processing: Option<Duration>,
}

impl From<&SchedulerConfig> for Settings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            kill_grace: config.kill_grace(),
            idle_tick: config.idle_tick(),
            internal_bypass: config.internal_bypass,
            default_max_processing: config.default_max_processing(),
        }
    }
}

/// State shared by the scheduler handle, the control loop and every
/// running work task.
///
/// Each piece has its own lock so completions never wait on a whole
/// control-loop pass.
pub(super) struct Shared {
    pub(super) settings: Settings,
    pub(super) state: Mutex<SchedulerState>,
    pub(super) availability: AvailabilityManager,
    pub(super) queue: Mutex<PriorityQueue>,
    /// Launched items that have not reached a terminal state.
    pub(super) active: DashMap<WorkId, WorkItem>,
    /// Items between the queue and `active`; the flag records a cancel
    /// requested in that window.
    pub(super) launching: DashMap<WorkId, bool>,
    /// Submissions, completions and stop requests wake the control loop.
    pub(super) wake: Notify,
    pub(super) counters: Counters,
    pub(super) stats: Mutex<ExecutionStats>,
    pub(super) observers: ObserverSet,
    pub(super) processes: Mutex<ProcessRegistry>,
    pub(super) autotune: Mutex<Autotuner>,
    pub(super) cpu: Mutex<Box<dyn CpuProbe>>,
    pub(super) snapshot_tx: watch::Sender<SchedulerSnapshot>,
}

impl Shared {
    pub(super) fn state(&self) -> SchedulerState {
        *lock(&self.state)
    }

    pub(super) fn set_state(&self, state: SchedulerState) {
        *lock(&self.state) = state;
    }

    pub(super) fn emit(&self, event: LifecycleEvent) {
        self.observers.emit(event);
    }

    /// Build a fresh snapshot. Each lock is held only while its part is copied.
    pub(super) fn collect_snapshot(&self) -> SchedulerSnapshot {
        let availability = self.availability.snapshot();
        let (queued, bypass_queued, queued_levels) = {
            let queue = lock(&self.queue);
            (queue.len(), queue.bypass_len(), queue.level_lengths())
        };

        let mut levels: BTreeMap<i32, LevelSnapshot> = BTreeMap::new();
        for level in &availability.levels {
            levels.insert(
                level.priority,
                LevelSnapshot {
                    priority: level.priority,
                    queued: 0,
                    active: level.active,
                    reserved: level.reserved,
                    overage: level.overage,
                },
            );
        }
        for (priority, len) in queued_levels {
            levels
                .entry(priority)
                .or_insert_with(|| LevelSnapshot {
                    priority,
                    ..LevelSnapshot::default()
                })
                .queued = len;
        }

        SchedulerSnapshot {
            taken_at: Utc::now(),
            state: self.state(),
            capacity: availability.capacity,
            active: availability.active,
            available: availability.available,
            queued,
            bypass_queued,
            killed_total: availability.killed,
            levels: levels.into_values().rev().collect(),
            counters: self.counters.snapshot(),
            callers: lock(&self.stats).snapshot(),
            autotune: lock(&self.autotune).snapshot(),
        }
    }

    /// Collect a snapshot and publish it to subscribers.
    pub(super) fn publish_snapshot(&self) -> SchedulerSnapshot {
        let snapshot = self.collect_snapshot();
        self.snapshot_tx.send_replace(snapshot.clone());
        snapshot
    }
}
