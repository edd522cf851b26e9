//! Execution counters, per-caller statistics and the scheduler snapshot.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::autotune::AutotuneSnapshot;
use crate::scheduler::SchedulerState;
use crate::work::{WorkOutcome, WorkReport};

// ── Ring buffer ──────────────────────────────────────────────────────

/// A fixed-size ring buffer backed by `VecDeque`.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push an item, evicting the oldest if at capacity.
    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn last(&self) -> Option<&T> {
        self.buf.back()
    }

    /// Iterate over items from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }
}

// ── Counters ─────────────────────────────────────────────────────────

/// Monotonic scheduler counters, updated lock-free from any task.
#[derive(Debug, Default)]
pub struct Counters {
    submitted: AtomicU64,
    launched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    killed: AtomicU64,
    orphaned: AtomicU64,
    launch_failures: AtomicU64,
    internal_errors: AtomicU64,
}

impl Counters {
    pub(crate) fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn launched(&self) {
        self.launched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn orphaned(&self) {
        self.orphaned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn internal_error(&self) {
        self.internal_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a final outcome.
    pub(crate) fn outcome(&self, outcome: &WorkOutcome) {
        let counter = match outcome {
            WorkOutcome::Completed => &self.completed,
            WorkOutcome::Failed(_) => &self.failed,
            WorkOutcome::TimedOut => &self.timed_out,
            WorkOutcome::Cancelled => &self.cancelled,
            WorkOutcome::Killed => &self.killed,
            WorkOutcome::LaunchFailed(_) => &self.launch_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            launched: self.launched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            killed: self.killed.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
            launch_failures: self.launch_failures.load(Ordering::Relaxed),
            internal_errors: self.internal_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub submitted: u64,
    pub launched: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub killed: u64,
    pub orphaned: u64,
    pub launch_failures: u64,
    pub internal_errors: u64,
}

impl CounterSnapshot {
    /// Items that reached a final outcome.
    pub fn finished(&self) -> u64 {
        self.completed
            + self.failed
            + self.timed_out
            + self.cancelled
            + self.killed
            + self.launch_failures
    }
}

// ── Per-caller execution stats ───────────────────────────────────────

/// Execution statistics for one caller label.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallerStats {
    /// Items that started executing and reached a final outcome.
    pub executions: u64,
    /// Of those, items whose outcome was not `Completed`.
    pub unsuccessful: u64,
    pub avg_duration_ms: f64,
    pub last_finished: Option<DateTime<Utc>>,
}

/// Per-caller statistics keyed by caller label.
#[derive(Debug, Default)]
pub struct ExecutionStats {
    callers: BTreeMap<String, CallerStats>,
}

impl ExecutionStats {
    /// Record a finished item. Items that never started are not counted.
    pub fn record(&mut self, report: &WorkReport) {
        let Some(duration) = report.execution_time() else {
            return;
        };
        self.record_execution(&report.caller, duration, report.outcome.is_success(), report.finished_at);
    }

    pub fn record_execution(
        &mut self,
        caller: &str,
        duration: Duration,
        success: bool,
        finished_at: DateTime<Utc>,
    ) {
        let stats = self.callers.entry(caller.to_string()).or_default();
        stats.executions += 1;
        if !success {
            stats.unsuccessful += 1;
        }
        stats.last_finished = Some(finished_at);

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let cur_ms = duration.as_secs_f64() * 1_000.0;
        stats.avg_duration_ms = if stats.executions == 1 {
            cur_ms
        } else {
            stats.avg_duration_ms + (cur_ms - stats.avg_duration_ms) / stats.executions as f64
        };
    }

    pub fn get(&self, caller: &str) -> Option<&CallerStats> {
        self.callers.get(caller)
    }

    pub fn snapshot(&self) -> BTreeMap<String, CallerStats> {
        self.callers.clone()
    }
}

// ── Scheduler snapshot ───────────────────────────────────────────────

/// Queue and slot usage for one priority level.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LevelSnapshot {
    pub priority: i32,
    pub queued: usize,
    pub active: usize,
    pub reserved: usize,
    pub overage: usize,
}

/// Point-in-time view of the whole scheduler, published after every
/// control-loop pass.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub taken_at: DateTime<Utc>,
    pub state: SchedulerState,
    pub capacity: usize,
    pub active: usize,
    pub available: usize,
    pub queued: usize,
    /// Internal items waiting in the bypass lane.
    pub bypass_queued: usize,
    /// Slots forcibly reclaimed since startup.
    pub killed_total: u64,
    /// Highest priority first.
    pub levels: Vec<LevelSnapshot>,
    pub counters: CounterSnapshot,
    pub callers: BTreeMap<String, CallerStats>,
    pub autotune: AutotuneSnapshot,
}

impl SchedulerSnapshot {
    /// Snapshot of a scheduler that has not run yet.
    pub fn empty(capacity: usize) -> Self {
        Self {
            taken_at: Utc::now(),
            state: SchedulerState::Stopped,
            capacity,
            active: 0,
            available: capacity,
            queued: 0,
            bypass_queued: 0,
            killed_total: 0,
            levels: Vec::new(),
            counters: CounterSnapshot::default(),
            callers: BTreeMap::new(),
            autotune: AutotuneSnapshot::default(),
        }
    }

    pub fn level(&self, priority: i32) -> Option<&LevelSnapshot> {
        self.levels.iter().find(|l| l.priority == priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest() {
        let mut ring = RingBuffer::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(ring.last(), Some(&4));
    }

    #[test]
    fn zero_capacity_ring_stays_empty() {
        let mut ring = RingBuffer::new(0);
        ring.push(1);
        assert!(ring.is_empty());
    }

    #[test]
    fn counters_bucket_outcomes() {
        let counters = Counters::default();
        counters.submitted();
        counters.outcome(&WorkOutcome::Completed);
        counters.outcome(&WorkOutcome::Failed("x".into()));
        counters.outcome(&WorkOutcome::Killed);
        counters.outcome(&WorkOutcome::TimedOut);
        counters.orphaned();

        let snap = counters.snapshot();
        assert_eq!(snap.submitted, 1);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.killed, 1);
        assert_eq!(snap.timed_out, 1);
        assert_eq!(snap.orphaned, 1);
        assert_eq!(snap.finished(), 4);
    }

    #[test]
    fn caller_stats_use_incremental_mean() {
        let mut stats = ExecutionStats::default();
        let now = Utc::now();
        stats.record_execution("billing", Duration::from_millis(100), true, now);
        stats.record_execution("billing", Duration::from_millis(200), false, now);

        let billing = stats.get("billing").unwrap();
        assert_eq!(billing.executions, 2);
        assert_eq!(billing.unsuccessful, 1);
        assert!(
            (billing.avg_duration_ms - 150.0).abs() < 1.0,
            "expected ~150ms, got {}",
            billing.avg_duration_ms
        );
        assert!(stats.get("other").is_none());
    }
}
