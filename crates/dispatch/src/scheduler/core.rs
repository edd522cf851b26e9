use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use switchyard_core::{
    AutotuneConfig, BulkheadConfig, SchedulerConfig, SwitchyardConfig, SwitchyardError,
};

use crate::autotune::Autotuner;
use crate::availability::{AvailabilityManager, AvailabilitySnapshot};
use crate::cpu::{CpuProbe, ProcessCpuProbe};
use crate::error::DispatchError;
use crate::metrics::{Counters, ExecutionStats, SchedulerSnapshot};
use crate::observer::{LifecycleEvent, LifecycleObserver, ObserverSet};
use crate::process::{HousekeepingProcess, ProcessRegistry, StatisticsLogger};
use crate::queue::PriorityQueue;
use crate::work::{CancelReason, WorkId, WorkItem, WorkKind, WorkOutcome, WorkRequest};

use super::control::control_loop;
use super::shared::{lock, Settings, Shared};

/// Scheduler lifecycle: `Stopped -> Running -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    Stopped,
    Running,
    Stopping,
}

/// Bounded, priority-partitioned executor for [`WorkRequest`]s.
///
/// Owns one control-loop task while running. Work bodies run on the tokio
/// worker pool, or on a dedicated thread when marked long-running.
pub struct Scheduler {
    shared: Arc<Shared>,
    control: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build a scheduler from config with the default CPU probe.
    pub fn new(config: &SwitchyardConfig) -> Result<Self, DispatchError> {
        SchedulerBuilder::new(config).build()
    }

    pub fn builder(config: &SwitchyardConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(config)
    }

    /// Spawn the control loop on the current tokio runtime.
    pub fn start(&self) -> Result<(), DispatchError> {
        let runtime = Handle::try_current()
            .map_err(|e| DispatchError::Internal(format!("no tokio runtime: {e}")))?;

        {
            let mut state = lock(&self.shared.state);
            if *state != SchedulerState::Stopped {
                return Err(DispatchError::AlreadyRunning);
            }
            *state = SchedulerState::Running;
        }

        let handle = runtime.spawn(control_loop(Arc::clone(&self.shared)));
        *lock(&self.control) = Some(handle);
        info!(
            capacity = self.shared.availability.capacity(),
            autotune = lock(&self.shared.autotune).is_enabled(),
            "scheduler started"
        );
        Ok(())
    }

    /// Stop the control loop: queued items are reported `Cancelled`,
    /// executing items are signalled but not awaited. No-op unless running.
    pub async fn stop(&self) {
        {
            let mut state = lock(&self.shared.state);
            if *state != SchedulerState::Running {
                return;
            }
            *state = SchedulerState::Stopping;
        }
        info!("scheduler stopping");
        self.shared.wake.notify_one();

        let handle = lock(&self.control).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "control loop task failed");
                self.shared.shutdown_drain();
            }
        }
    }

    /// Submit work. Internal work skips the priority queue when bypass is
    /// enabled. On error the request (and its callback) is dropped.
    pub fn submit(&self, request: WorkRequest) -> Result<WorkId, DispatchError> {
        let mut item = WorkItem::from_request(request, self.shared.settings.default_max_processing);
        let id = item.id();
        let priority = item.priority();
        let caller = item.caller().to_string();
        let bypass = self.shared.settings.internal_bypass && item.kind() == WorkKind::Internal;

        {
            let mut queue = lock(&self.shared.queue);
            if self.shared.state() != SchedulerState::Running {
                return Err(DispatchError::NotRunning);
            }
            item.mark_queued();
            if bypass {
                queue.enqueue_bypass(item);
            } else {
                queue.enqueue(item);
            }
        }

        self.shared.counters.submitted();
        debug!(work_id = %id, priority, %caller, bypass, "work queued");
        self.shared.emit(LifecycleEvent::Queued {
            id,
            priority,
            caller,
        });
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Cancel a queued or executing item.
    ///
    /// A queued item is removed and reported `Cancelled` immediately. An
    /// executing item gets its cancel signal raised and keeps its slot;
    /// the kill grace period applies as for a timeout.
    pub fn cancel(&self, id: WorkId) -> Result<(), DispatchError> {
        {
            let mut queue = lock(&self.shared.queue);
            let queued = queue.remove(id);
            if let Some(item) = queued {
                drop(queue);
                info!(work_id = %id, "queued work cancelled");
                self.shared.finish(item, WorkOutcome::Cancelled);
                self.shared.wake.notify_one();
                return Ok(());
            }
            // Dequeued but not yet active: the launcher applies the flag.
            if let Some(mut requested) = self.shared.launching.get_mut(&id) {
                *requested = true;
                info!(work_id = %id, "launching work flagged for cancellation");
                return Ok(());
            }
        }

        match self.shared.active.get_mut(&id) {
            Some(mut item) => {
                if item.request_cancel(CancelReason::Requested, Instant::now()) {
                    info!(work_id = %id, "executing work signalled to cancel");
                }
                Ok(())
            }
            None => Err(DispatchError::UnknownWork(id)),
        }
    }

    /// Reserve guaranteed slots for a priority level (`slots == 0` clears).
    pub fn reserve_bulkhead(&self, priority: i32, slots: usize, overage: usize) -> bool {
        let applied = self.shared.availability.reserve_bulkhead(priority, slots, overage);
        if applied {
            self.shared.wake.notify_one();
        }
        applied
    }

    /// Override total capacity. Floored at the active count; returns the
    /// value applied. Autotune, when enabled, keeps adjusting from there.
    pub fn set_capacity(&self, capacity: usize) -> usize {
        let before = self.shared.availability.capacity();
        let applied = self.shared.availability.set_capacity(capacity);
        if applied != before {
            info!(from = before, to = applied, "capacity set");
            self.shared.emit(LifecycleEvent::CapacityChanged {
                from: before,
                to: applied,
            });
            self.shared.wake.notify_one();
        }
        applied
    }

    pub fn register_process(&self, process: Arc<dyn HousekeepingProcess>) -> Result<(), DispatchError> {
        lock(&self.shared.processes).register(process, Instant::now())
    }

    pub fn unregister_process(&self, name: &str) -> bool {
        lock(&self.shared.processes).unregister(name)
    }

    pub fn process_names(&self) -> Vec<String> {
        lock(&self.shared.processes).names()
    }

    pub fn add_observer(&self, observer: Arc<dyn LifecycleObserver>) {
        self.shared.observers.add(observer);
    }

    /// Latest snapshot published by the control loop. Never blocks on
    /// scheduler locks.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.shared.snapshot_tx.borrow().clone()
    }

    /// Receiver that sees every snapshot the control loop publishes.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    /// Snapshot collected on demand rather than from the last pass.
    pub fn collect_snapshot(&self) -> SchedulerSnapshot {
        self.shared.collect_snapshot()
    }

    pub fn availability(&self) -> AvailabilitySnapshot {
        self.shared.availability.snapshot()
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.state()
    }

    pub fn capacity(&self) -> usize {
        self.shared.availability.capacity()
    }

    pub fn active_count(&self) -> usize {
        self.shared.availability.active()
    }

    pub fn queued_len(&self) -> usize {
        lock(&self.shared.queue).len()
    }
}

#[cfg(test)]
impl Scheduler {
    pub(super) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let mut state = lock(&self.shared.state);
        if *state == SchedulerState::Running {
            *state = SchedulerState::Stopping;
            self.shared.wake.notify_one();
        }
    }
}

// ── Builder ──────────────────────────────────────────────────────────

/// Fluent builder for [`Scheduler`].
///
/// # Example
/// ```ignore
/// let scheduler = Scheduler::builder(&config)
///     .capacity(4)
///     .cpu_probe(|| Some(42.0))
///     .observer(Arc::new(observer))
///     .build()?;
/// ```
pub struct SchedulerBuilder {
    scheduler: SchedulerConfig,
    autotune: AutotuneConfig,
    bulkheads: Vec<BulkheadConfig>,
    kill_grace: Option<Duration>,
    idle_tick: Option<Duration>,
    statistics_interval: Option<Duration>,
    cpu_probe: Option<Box<dyn CpuProbe>>,
    observers: Vec<Arc<dyn LifecycleObserver>>,
    processes: Vec<Arc<dyn HousekeepingProcess>>,
}

impl SchedulerBuilder {
    pub fn new(config: &SwitchyardConfig) -> Self {
        Self {
            scheduler: config.scheduler.clone(),
            autotune: config.autotune.clone(),
            bulkheads: config.bulkheads.clone(),
            kill_grace: None,
            idle_tick: None,
            statistics_interval: config.observability.statistics_interval(),
            cpu_probe: None,
            observers: Vec::new(),
            processes: Vec::new(),
        }
    }

    /// Override the initial total capacity.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.scheduler.initial_concurrency = capacity;
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = Some(grace);
        self
    }

    pub fn idle_tick(mut self, tick: Duration) -> Self {
        self.idle_tick = Some(tick);
        self
    }

    pub fn autotune(mut self, autotune: AutotuneConfig) -> Self {
        self.autotune = autotune;
        self
    }

    pub fn bulkhead(mut self, priority: i32, slots: usize, overage: usize) -> Self {
        self.bulkheads.push(BulkheadConfig {
            priority,
            slots,
            overage,
        });
        self
    }

    /// Disable the built-in statistics logger.
    pub fn without_statistics(mut self) -> Self {
        self.statistics_interval = None;
        self
    }

    pub fn cpu_probe(mut self, probe: impl CpuProbe + 'static) -> Self {
        self.cpu_probe = Some(Box::new(probe));
        self
    }

    pub fn observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn process(mut self, process: Arc<dyn HousekeepingProcess>) -> Self {
        self.processes.push(process);
        self
    }

    /// Validate the assembled settings and build the scheduler.
    ///
    /// Runs the same checks as [`SwitchyardConfig::validate`], so an
    /// inconsistent autotune range or bulkhead set is rejected here rather
    /// than failing inside the control loop.
    pub fn build(self) -> Result<Scheduler, DispatchError> {
        let config = SwitchyardConfig {
            scheduler: self.scheduler.clone(),
            autotune: self.autotune.clone(),
            bulkheads: self.bulkheads.clone(),
            ..SwitchyardConfig::default()
        };
        config.validate()?;
        if self.idle_tick == Some(Duration::ZERO) {
            return Err(SwitchyardError::Config("idle tick must be non-zero".into()).into());
        }

        let mut settings = Settings::from(&self.scheduler);
        if let Some(grace) = self.kill_grace {
            settings.kill_grace = grace;
        }
        if let Some(tick) = self.idle_tick {
            settings.idle_tick = tick;
        }

        let availability = AvailabilityManager::new(self.scheduler.initial_concurrency);
        for bulkhead in &self.bulkheads {
            availability.reserve_bulkhead(bulkhead.priority, bulkhead.slots, bulkhead.overage);
        }

        let now = Instant::now();
        let mut processes = ProcessRegistry::default();
        if let Some(interval) = self.statistics_interval {
            processes.register(Arc::new(StatisticsLogger::new(interval)), now)?;
        }
        for process in self.processes {
            processes.register(process, now)?;
        }

        let observers = ObserverSet::default();
        for observer in self.observers {
            observers.add(observer);
        }

        let cpu_probe = self
            .cpu_probe
            .unwrap_or_else(|| Box::new(ProcessCpuProbe::new()));
        let (snapshot_tx, _) = watch::channel(SchedulerSnapshot::empty(
            self.scheduler.initial_concurrency,
        ));

        let shared = Arc::new(Shared {
            settings,
            state: Mutex::new(SchedulerState::Stopped),
            availability,
            queue: Mutex::new(PriorityQueue::new()),
            active: Default::default(),
            launching: Default::default(),
            wake: Notify::new(),
            counters: Counters::default(),
            stats: Mutex::new(ExecutionStats::default()),
            observers,
            processes: Mutex::new(processes),
            autotune: Mutex::new(Autotuner::new(self.autotune)),
            cpu: Mutex::new(cpu_probe),
            snapshot_tx,
        });
        shared.publish_snapshot();

        Ok(Scheduler {
            shared,
            control: Mutex::new(None),
        })
    }
}
