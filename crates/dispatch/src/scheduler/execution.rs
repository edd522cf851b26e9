use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::WorkError;
use crate::observer::LifecycleEvent;
use crate::work::{CancelReason, WorkFuture, WorkId, WorkItem, WorkOutcome};

use super::shared::{lock, Shared};

/// Best-effort text of a panic payload.
pub(super) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Drive a work future, turning a panic into [`WorkError::Panicked`].
async fn run_work(future: WorkFuture) -> Result<(), WorkError> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(WorkError::Panicked(panic_message(&*panic))),
    }
}

impl Shared {
    /// Start an item that already holds a slot for its priority.
    ///
    /// The item enters the active map before its task is spawned, so the
    /// completion continuation always finds it (unless it was killed).
    pub(super) fn launch(self: &Arc<Self>, mut item: WorkItem) {
        let id = item.id();
        let Some(delegate) = item.begin_execution(Instant::now()) else {
            self.launching.remove(&id);
            self.availability.decrement(item.priority(), false);
            self.finish(item, WorkOutcome::LaunchFailed("item was not in the queued state".into()));
            return;
        };

        let priority = item.priority();
        let caller = item.caller().to_string();
        let long_running = item.is_long_running();
        let cancel = item.cancel_signal().clone();

        let future = match catch_unwind(AssertUnwindSafe(|| delegate(cancel))) {
            Ok(future) => future,
            Err(panic) => {
                let reason = panic_message(&*panic);
                self.launching.remove(&id);
                warn!(work_id = %id, %caller, %reason, "work failed to launch");
                self.availability.decrement(priority, false);
                self.emit(LifecycleEvent::LaunchFailed { id, reason: reason.clone() });
                self.finish(item, WorkOutcome::LaunchFailed(reason));
                return;
            }
        };

        self.active.insert(id, item);
        // Leave `launching` only after entering `active`; a cancel that
        // arrived in between is applied now.
        if let Some((_, true)) = self.launching.remove(&id) {
            if let Some(mut item) = self.active.get_mut(&id) {
                item.request_cancel(CancelReason::Requested, Instant::now());
            }
            info!(work_id = %id, "executing work signalled to cancel");
        }
        self.counters.launched();
        debug!(work_id = %id, priority, %caller, long_running, "work launched");
        self.emit(LifecycleEvent::Launched {
            id,
            priority,
            caller,
        });

        let shared = Arc::clone(self);
        let task = async move {
            let result = run_work(future).await;
            shared.complete(id, result);
        };

        if !long_running {
            tokio::spawn(task);
            return;
        }

        // Long-running work gets its own thread and runtime so it cannot
        // tie up the shared worker pool.
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                self.abort_launch(id, format!("runtime for long-running work: {e}"));
                return;
            }
        };
        let spawned = std::thread::Builder::new()
            .name(format!("switchyard-work-{id}"))
            .spawn(move || runtime.block_on(task));
        if let Err(e) = spawned {
            self.abort_launch(id, format!("thread for long-running work: {e}"));
        }
    }

    /// Undo a launch whose task could not be started.
    fn abort_launch(&self, id: WorkId, reason: String) {
        let Some((_, item)) = self.active.remove(&id) else {
            return;
        };
        warn!(work_id = %id, %reason, "work failed to launch");
        self.availability.decrement(item.priority(), false);
        self.emit(LifecycleEvent::LaunchFailed {
            id,
            reason: reason.clone(),
        });
        self.finish(item, WorkOutcome::LaunchFailed(reason));
        self.wake.notify_one();
    }

    /// Completion continuation, run on the work task once the delegate
    /// returns (or panics).
    pub(super) fn complete(&self, id: WorkId, result: Result<(), WorkError>) {
        let Some((_, item)) = self.active.remove(&id) else {
            // Killed earlier: its slot has already been released.
            self.counters.orphaned();
            warn!(work_id = %id, ?result, "orphan completion discarded");
            self.emit(LifecycleEvent::Orphaned { id });
            return;
        };

        self.availability.decrement(item.priority(), false);

        let outcome = match result {
            Ok(()) => WorkOutcome::Completed,
            Err(e) => match item.cancel_reason() {
                Some(CancelReason::Timeout) => WorkOutcome::TimedOut,
                Some(CancelReason::Requested | CancelReason::Shutdown) => WorkOutcome::Cancelled,
                None if e == WorkError::Cancelled => WorkOutcome::Cancelled,
                None => WorkOutcome::Failed(e.to_string()),
            },
        };

        match &outcome {
            WorkOutcome::Completed => debug!(work_id = %id, caller = item.caller(), "work completed"),
            WorkOutcome::Failed(reason) => {
                warn!(work_id = %id, caller = item.caller(), %reason, "work failed")
            }
            other => warn!(work_id = %id, caller = item.caller(), outcome = ?other, "work ended after cancellation"),
        }

        self.finish(item, outcome);
        self.wake.notify_one();
    }

    /// Final accounting for an item that will not run again: counters,
    /// statistics, the originator callback, and the `Completed` event.
    pub(super) fn finish(&self, item: WorkItem, outcome: WorkOutcome) {
        let (report, callback) = item.into_report(outcome);
        self.counters.outcome(&report.outcome);
        lock(&self.stats).record(&report);

        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(&report))).is_err() {
                warn!(work_id = %report.id, "completion callback panicked");
            }
        }
        self.emit(LifecycleEvent::Completed(report));
    }
}
