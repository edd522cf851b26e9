//! Unit-of-work descriptor and its lifecycle.
//!
//! A [`WorkRequest`] is what callers hand to the scheduler; the scheduler
//! turns it into a [`WorkItem`] and owns it until it reaches a terminal
//! state, at which point a [`WorkReport`] goes to the completion callback.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use switchyard_core::RoutingKey;

use crate::cancel::CancelSignal;
use crate::error::WorkError;

/// Unique identifier of a submitted work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What kind of work an item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkKind {
    /// A handler invocation for an inbound message.
    Payload,
    /// Administrative or housekeeping work; may bypass the priority queue.
    Internal,
    Other,
}

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkState {
    Created,
    Queued,
    Executing,
    /// Cooperative cancel signaled; the slot is still held.
    Cancelled,
    Completed,
    /// Slot forcibly reclaimed after the kill grace period.
    Killed,
}

impl WorkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkState::Completed | WorkState::Killed)
    }
}

/// Why an executing item was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    Timeout,
    Requested,
    Shutdown,
}

/// Final result of a work item, delivered through the completion callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkOutcome {
    Completed,
    /// The delegate returned an error or panicked.
    Failed(String),
    /// Exceeded its processing time and was cooperatively cancelled.
    TimedOut,
    /// Cancelled on request or at shutdown.
    Cancelled,
    /// The slot was reclaimed after the kill grace period expired.
    Killed,
    /// The item could not be started.
    LaunchFailed(String),
}

impl WorkOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkOutcome::Completed)
    }
}

/// Future returned by an execution delegate.
pub type WorkFuture = BoxFuture<'static, Result<(), WorkError>>;

/// Boxed execution delegate: receives the item's cancel signal.
pub type WorkDelegate = Box<dyn FnOnce(CancelSignal) -> WorkFuture + Send + Sync>;

/// Originator callback invoked exactly once with the final report.
pub type CompletionCallback = Box<dyn FnOnce(&WorkReport) + Send + Sync>;

/// Summary of a finished work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkReport {
    pub id: WorkId,
    pub kind: WorkKind,
    pub priority: i32,
    pub caller: String,
    pub routing_key: Option<RoutingKey>,
    pub outcome: WorkOutcome,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl WorkReport {
    /// Wall time between start of execution and the terminal transition.
    pub fn execution_time(&self) -> Option<Duration> {
        self.started_at
            .and_then(|started| (self.finished_at - started).to_std().ok())
    }
}

// ── WorkRequest ──────────────────────────────────────────────────────

/// Fluent description of work to submit.
///
/// # Example
/// ```ignore
/// let request = WorkRequest::new(5, |cancel| async move {
///     tokio::select! {
///         _ = cancel.cancelled() => Err(WorkError::Cancelled),
///         _ = do_work() => Ok(()),
///     }
/// })
/// .caller("billing")
/// .max_processing_time(Duration::from_secs(2));
/// ```
pub struct WorkRequest {
    kind: WorkKind,
    priority: i32,
    long_running: bool,
    max_processing_time: Option<Duration>,
    caller: String,
    routing_key: Option<RoutingKey>,
    delegate: WorkDelegate,
    on_complete: Option<CompletionCallback>,
}

impl WorkRequest {
    pub fn new<F, Fut>(priority: i32, delegate: F) -> Self
    where
        F: FnOnce(CancelSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
    {
        Self {
            kind: WorkKind::Payload,
            priority,
            long_running: false,
            max_processing_time: None,
            caller: "anonymous".to_string(),
            routing_key: None,
            delegate: Box::new(move |cancel| delegate(cancel).boxed()),
            on_complete: None,
        }
    }

    pub fn kind(mut self, kind: WorkKind) -> Self {
        self.kind = kind;
        self
    }

    /// Run on a dedicated thread instead of the shared worker pool.
    pub fn long_running(mut self, long_running: bool) -> Self {
        self.long_running = long_running;
        self
    }

    pub fn max_processing_time(mut self, limit: Duration) -> Self {
        self.max_processing_time = Some(limit);
        self
    }

    /// Label used in logs and per-caller statistics.
    pub fn caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = caller.into();
        self
    }

    pub fn routing_key(mut self, key: RoutingKey) -> Self {
        self.routing_key = Some(key);
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&WorkReport) + Send + Sync + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }
}

// ── WorkItem ─────────────────────────────────────────────────────────

/// A submitted unit of work, owned by the scheduler.
pub struct WorkItem {
    id: WorkId,
    kind: WorkKind,
    priority: i32,
    is_long_running: bool,
    max_processing_time: Option<Duration>,
    caller: String,
    routing_key: Option<RoutingKey>,
    state: WorkState,
    created_at: DateTime<Utc>,
    execute_started_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    cancel_requested: Option<Instant>,
    cancel_reason: Option<CancelReason>,
    is_cancelled: bool,
    is_killed: bool,
    is_failure: bool,
    failure_error: Option<String>,
    cancel: CancelSignal,
    delegate: Option<WorkDelegate>,
    on_complete: Option<CompletionCallback>,
}

impl WorkItem {
    /// Build an item from a request; `default_limit` applies when the
    /// request sets no processing limit.
    pub fn from_request(request: WorkRequest, default_limit: Option<Duration>) -> Self {
        Self {
            id: WorkId::new(),
            kind: request.kind,
            priority: request.priority,
            is_long_running: request.long_running,
            max_processing_time: request.max_processing_time.or(default_limit),
            caller: request.caller,
            routing_key: request.routing_key,
            state: WorkState::Created,
            created_at: Utc::now(),
            execute_started_at: None,
            cancelled_at: None,
            started: None,
            cancel_requested: None,
            cancel_reason: None,
            is_cancelled: false,
            is_killed: false,
            is_failure: false,
            failure_error: None,
            cancel: CancelSignal::new(),
            delegate: Some(request.delegate),
            on_complete: request.on_complete,
        }
    }

    pub fn id(&self) -> WorkId {
        self.id
    }

    pub fn kind(&self) -> WorkKind {
        self.kind
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_long_running(&self) -> bool {
        self.is_long_running
    }

    pub fn max_processing_time(&self) -> Option<Duration> {
        self.max_processing_time
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn routing_key(&self) -> Option<&RoutingKey> {
        self.routing_key.as_ref()
    }

    pub fn state(&self) -> WorkState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn execute_started_at(&self) -> Option<DateTime<Utc>> {
        self.execute_started_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.cancel_reason
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled
    }

    pub fn is_killed(&self) -> bool {
        self.is_killed
    }

    pub fn is_failure(&self) -> bool {
        self.is_failure
    }

    pub fn failure_error(&self) -> Option<&str> {
        self.failure_error.as_deref()
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Created -> Queued. Returns false for any other starting state, so a
    /// terminal item can never re-enter the queue.
    pub(crate) fn mark_queued(&mut self) -> bool {
        if self.state != WorkState::Created {
            return false;
        }
        self.state = WorkState::Queued;
        true
    }

    /// Queued -> Executing. Hands out the delegate exactly once.
    pub(crate) fn begin_execution(&mut self, now: Instant) -> Option<WorkDelegate> {
        if self.state != WorkState::Queued {
            return None;
        }
        let delegate = self.delegate.take()?;
        self.state = WorkState::Executing;
        self.started = Some(now);
        self.execute_started_at = Some(Utc::now());
        Some(delegate)
    }

    /// Executing -> Cancelled: flip the cancel signal and start the kill
    /// grace clock. The slot is not released here.
    pub(crate) fn request_cancel(&mut self, reason: CancelReason, now: Instant) -> bool {
        if self.state != WorkState::Executing {
            return false;
        }
        self.state = WorkState::Cancelled;
        self.is_cancelled = true;
        self.cancel_reason = Some(reason);
        self.cancel_requested = Some(now);
        self.cancelled_at = Some(Utc::now());
        self.cancel.cancel();
        true
    }

    /// Executing for longer than the processing limit.
    pub fn soft_timeout_expired(&self, now: Instant) -> bool {
        if self.state != WorkState::Executing {
            return false;
        }
        match (self.started, self.max_processing_time) {
            (Some(started), Some(limit)) => now.saturating_duration_since(started) > limit,
            _ => false,
        }
    }

    /// Cancelled for longer than `grace` without completing.
    pub fn kill_due(&self, now: Instant, grace: Duration) -> bool {
        self.state == WorkState::Cancelled
            && self
                .cancel_requested
                .is_some_and(|at| now.saturating_duration_since(at) > grace)
    }

    /// Apply the terminal transition implied by `outcome`.
    pub(crate) fn settle(&mut self, outcome: &WorkOutcome) {
        match outcome {
            WorkOutcome::Completed | WorkOutcome::TimedOut => {}
            WorkOutcome::Failed(reason) => {
                self.is_failure = true;
                self.failure_error = Some(reason.clone());
            }
            WorkOutcome::Cancelled => self.mark_cancelled_flags(),
            WorkOutcome::Killed => {
                self.mark_cancelled_flags();
                self.is_killed = true;
            }
            WorkOutcome::LaunchFailed(reason) => {
                self.mark_cancelled_flags();
                self.is_failure = true;
                self.failure_error = Some(reason.clone());
            }
        }
        self.state = match outcome {
            WorkOutcome::Killed => WorkState::Killed,
            _ => WorkState::Completed,
        };
    }

    fn mark_cancelled_flags(&mut self) {
        if !self.is_cancelled {
            self.is_cancelled = true;
            self.cancelled_at = Some(Utc::now());
        }
    }

    /// Settle the item and split it into its report and pending callback.
    pub(crate) fn into_report(mut self, outcome: WorkOutcome) -> (WorkReport, Option<CompletionCallback>) {
        self.settle(&outcome);
        let report = WorkReport {
            id: self.id,
            kind: self.kind,
            priority: self.priority,
            caller: self.caller,
            routing_key: self.routing_key,
            outcome,
            created_at: self.created_at,
            started_at: self.execute_started_at,
            cancelled_at: self.cancelled_at,
            finished_at: Utc::now(),
        };
        (report, self.on_complete)
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("caller", &self.caller)
            .field("state", &self.state)
            .field("is_cancelled", &self.is_cancelled)
            .field("is_killed", &self.is_killed)
            .finish_non_exhaustive()
    }
}
