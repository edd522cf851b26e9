//! Lifecycle event hooks.
//!
//! Observers see every state change the scheduler makes: queueing, launch,
//! timeout, kill, orphaned completions, final reports, and control-loop
//! internal errors. They run inline on the emitting task, so they must be
//! cheap; [`ChannelObserver`] forwards events to a channel for anything
//! heavier.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::work::{WorkId, WorkReport};

/// A scheduler lifecycle event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Queued {
        id: WorkId,
        priority: i32,
        caller: String,
    },
    Launched {
        id: WorkId,
        priority: i32,
        caller: String,
    },
    /// Soft timeout: the cancel signal was raised, the slot is still held.
    TimedOut { id: WorkId, caller: String },
    /// Grace period elapsed; the slot was reclaimed.
    Killed { id: WorkId, caller: String },
    /// A killed item finished after its slot was already reclaimed.
    Orphaned { id: WorkId },
    LaunchFailed { id: WorkId, reason: String },
    /// Final report of an item, whatever its outcome.
    Completed(WorkReport),
    CapacityChanged { from: usize, to: usize },
    InternalError { message: String },
}

/// Receives lifecycle events.
pub trait LifecycleObserver: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent);
}

impl<F> LifecycleObserver for F
where
    F: Fn(&LifecycleEvent) + Send + Sync,
{
    fn on_event(&self, event: &LifecycleEvent) {
        self(event)
    }
}

/// Forwards every event to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LifecycleObserver for ChannelObserver {
    fn on_event(&self, event: &LifecycleEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event.clone());
    }
}

/// Registered observers; a panicking observer is logged and skipped.
#[derive(Default)]
pub(crate) struct ObserverSet {
    observers: RwLock<Vec<Arc<dyn LifecycleObserver>>>,
}

impl ObserverSet {
    pub(crate) fn add(&self, observer: Arc<dyn LifecycleObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub(crate) fn emit(&self, event: LifecycleEvent) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for observer in observers.iter() {
            if catch_unwind(AssertUnwindSafe(|| observer.on_event(&event))).is_err() {
                warn!(?event, "lifecycle observer panicked");
            }
        }
    }
}
