use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::observer::LifecycleEvent;
use crate::work::{CancelReason, WorkId, WorkItem, WorkOutcome};

use super::execution::panic_message;
use super::shared::{lock, Shared};
use super::SchedulerState;

/// The control loop. Runs until the state leaves `Running`, then drains.
pub(super) async fn control_loop(shared: Arc<Shared>) {
    let mut idle = tokio::time::interval(shared.settings.idle_tick);
    idle.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        idle_tick = ?shared.settings.idle_tick,
        kill_grace = ?shared.settings.kill_grace,
        "control loop started"
    );

    while shared.state() == SchedulerState::Running {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| shared.pass(Instant::now()))) {
            let message = panic_message(&*panic);
            shared.counters.internal_error();
            error!(%message, "control loop pass failed");
            shared.emit(LifecycleEvent::InternalError { message });
        }

        if shared.state() != SchedulerState::Running {
            break;
        }
        tokio::select! {
            _ = shared.wake.notified() => {}
            _ = idle.tick() => {}
        }
    }

    shared.shutdown_drain();
}

impl Shared {
    /// One scheduling pass.
    fn pass(self: &Arc<Self>, now: Instant) {
        self.sweep_timeouts(now);
        self.launch_ready();
        self.autotune(now);
        let snapshot = self.publish_snapshot();
        let panicked = lock(&self.processes).run_due(now, &snapshot);
        for _ in 0..panicked {
            self.counters.internal_error();
        }
    }

    /// Cooperatively cancel items past their processing limit, and reclaim
    /// the slots of cancelled items past the kill grace period.
    fn sweep_timeouts(&self, now: Instant) {
        let grace = self.settings.kill_grace;
        let mut timed_out = Vec::new();
        let mut kill = Vec::new();

        for mut entry in self.active.iter_mut() {
            let item = entry.value_mut();
            if item.soft_timeout_expired(now) && item.request_cancel(CancelReason::Timeout, now) {
                timed_out.push((item.id(), item.caller().to_string(), item.max_processing_time()));
            } else if item.kill_due(now, grace) {
                kill.push(item.id());
            }
        }

        for (id, caller, limit) in timed_out {
            warn!(work_id = %id, %caller, limit = ?limit, "work exceeded processing time, cancelling");
            self.emit(LifecycleEvent::TimedOut { id, caller });
        }

        for id in kill {
            // Re-check under the shard lock: the item may have completed since.
            if let Some((_, item)) = self.active.remove_if(&id, |_, item| item.kill_due(now, grace)) {
                self.kill(item);
            }
        }
    }

    fn kill(&self, item: WorkItem) {
        let id = item.id();
        let caller = item.caller().to_string();
        self.availability.decrement(item.priority(), true);
        warn!(
            work_id = %id,
            %caller,
            reason = ?item.cancel_reason(),
            "work ignored cancellation past the grace period, slot reclaimed"
        );
        self.emit(LifecycleEvent::Killed { id, caller });
        self.finish(item, WorkOutcome::Killed);
    }

    /// Drain the bypass lane, then the priority levels, into free slots.
    ///
    /// Dequeued items are tracked in `launching` until they reach the active
    /// map, so a concurrent cancel always finds them.
    fn launch_ready(self: &Arc<Self>) {
        let (bypass, ready) = {
            let mut queue = lock(&self.queue);
            let mut budget = self.availability.admission_budget(|p| queue.has_queued(p));
            if budget.is_exhausted() {
                return;
            }
            let bypass = queue.drain_bypass(&mut budget);
            let ready = queue.dequeue(&mut budget);
            for item in bypass.iter().chain(&ready) {
                self.launching.insert(item.id(), false);
            }
            (bypass, ready)
        };

        let mut refused: Vec<(WorkItem, bool)> = Vec::new();
        let candidates = bypass
            .into_iter()
            .map(|item| (item, true))
            .chain(ready.into_iter().map(|item| (item, false)));
        for (item, is_bypass) in candidates {
            // Once one item is refused, keep the rest queued to preserve order.
            if !refused.is_empty() || !self.availability.increment(item.priority()) {
                refused.push((item, is_bypass));
                continue;
            }
            self.launch(item);
        }

        if refused.is_empty() {
            return;
        }
        let mut cancelled = Vec::new();
        {
            let mut queue = lock(&self.queue);
            for (item, is_bypass) in refused.into_iter().rev() {
                match self.launching.remove(&item.id()) {
                    Some((_, true)) => cancelled.push(item),
                    _ => queue.requeue_front(item, is_bypass),
                }
            }
        }
        for item in cancelled {
            info!(work_id = %item.id(), "queued work cancelled");
            self.finish(item, WorkOutcome::Cancelled);
        }
    }

    /// Re-tune total capacity when a sample interval has elapsed.
    fn autotune(&self, now: Instant) {
        let mut tuner = lock(&self.autotune);
        if !tuner.is_due(now) {
            return;
        }
        tuner.mark_sampled(now);

        let cpu = lock(&self.cpu).sample();
        let before = self.availability.capacity();
        let queued = lock(&self.queue).len();
        let target = tuner.decide(before, cpu, queued, self.availability.active());
        let after = if target == before {
            before
        } else {
            self.availability.set_capacity(target)
        };
        tuner.record(cpu, before, after);
        drop(tuner);

        if after != before {
            info!(cpu = ?cpu, from = before, to = after, queued, "autotune adjusted capacity");
            self.emit(LifecycleEvent::CapacityChanged {
                from: before,
                to: after,
            });
        }
    }

    /// Stop path: report queued items as cancelled, signal executing ones,
    /// and mark the scheduler stopped. Executing items are not awaited.
    pub(super) fn shutdown_drain(&self) {
        let drained = lock(&self.queue).drain_all();
        let drained_count = drained.len();
        for item in drained {
            self.finish(item, WorkOutcome::Cancelled);
        }

        let now = Instant::now();
        let signalled: Vec<WorkId> = self
            .active
            .iter_mut()
            .filter_map(|mut entry| {
                entry
                    .value_mut()
                    .request_cancel(CancelReason::Shutdown, now)
                    .then(|| *entry.key())
            })
            .collect();

        self.set_state(SchedulerState::Stopped);
        self.publish_snapshot();
        info!(
            drained = drained_count,
            signalled = signalled.len(),
            still_active = self.active.len(),
            "scheduler stopped"
        );
    }
}
