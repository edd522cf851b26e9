//! Concurrency slot accounting with per-priority bulkhead reservations.
//!
//! Total capacity is split into reserved partitions (one per bulkhead) and
//! a shared pool of `capacity - sum(reserved)`. Unreserved levels draw from
//! the shared pool; a reserved level spends its own slots first and may
//! then borrow up to `overage` slots from the shared pool.
//!
//! A reservation with nothing queued and nothing running lends its slots
//! to the shared pool. Lent slots come back as borrowers finish: once the
//! reserved level has work waiting, lending stops and the shared pool is
//! over-subscribed until enough borrowed slots are released.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default)]
struct LevelState {
    reserved: usize,
    overage: usize,
    active: usize,
}

impl LevelState {
    /// Slots this level holds beyond its reservation (drawn from the shared pool).
    fn borrowed(&self) -> usize {
        self.active.saturating_sub(self.reserved)
    }

    fn is_idle(&self) -> bool {
        self.reserved == 0 && self.active == 0
    }

    /// A reservation that is not in use and has no work waiting for it.
    fn is_lending(&self, waiting: bool) -> bool {
        self.reserved > 0 && self.active == 0 && !waiting
    }
}

/// Thread-safe availability manager.
///
/// `active()` never exceeds `capacity()`: [`increment`](Self::increment)
/// refuses a slot when the total is full, and capacity changes are floored
/// at the current active count.
#[derive(Debug)]
pub struct AvailabilityManager {
    capacity: AtomicUsize,
    active_total: AtomicUsize,
    killed: AtomicU64,
    levels: Mutex<BTreeMap<i32, LevelState>>,
}

impl AvailabilityManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: AtomicUsize::new(capacity),
            active_total: AtomicUsize::new(0),
            killed: AtomicU64::new(0),
            levels: Mutex::new(BTreeMap::new()),
        }
    }

    fn levels(&self) -> MutexGuard<'_, BTreeMap<i32, LevelState>> {
        self.levels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pin `slots` guaranteed slots to `priority`, plus up to `overage`
    /// slots borrowed from the shared pool. `slots == 0` clears the
    /// reservation.
    ///
    /// Reservations may add up to more than the current capacity (autotune
    /// can move capacity either way); admission never exceeds the free
    /// total regardless. Counts are unsigned, so there is no invalid input
    /// and this always returns true.
    pub fn reserve_bulkhead(&self, priority: i32, slots: usize, overage: usize) -> bool {
        let mut levels = self.levels();
        let capacity = self.capacity.load(Ordering::Acquire);
        let reserved_total: usize = levels
            .iter()
            .filter(|(level, _)| **level != priority)
            .map(|(_, state)| state.reserved)
            .sum::<usize>()
            .saturating_add(slots);
        if reserved_total > capacity {
            warn!(
                priority,
                slots,
                capacity,
                reserved_total,
                "reservations exceed current capacity"
            );
        }

        let state = levels.entry(priority).or_default();
        if slots == 0 {
            state.reserved = 0;
            state.overage = 0;
            if state.is_idle() {
                levels.remove(&priority);
            }
            info!(priority, "bulkhead cleared");
        } else {
            state.reserved = slots;
            state.overage = overage;
            info!(priority, slots, overage, "bulkhead reserved");
        }
        true
    }

    /// Claim one slot for `priority`. Returns false when capacity is full.
    pub fn increment(&self, priority: i32) -> bool {
        let mut levels = self.levels();
        let active = self.active_total.load(Ordering::Acquire);
        if active >= self.capacity.load(Ordering::Acquire) {
            return false;
        }
        levels.entry(priority).or_default().active += 1;
        self.active_total.store(active + 1, Ordering::Release);
        true
    }

    /// Release one slot held by `priority`. `killed` marks a forced reclaim.
    pub fn decrement(&self, priority: i32, killed: bool) {
        let mut levels = self.levels();
        let Some(state) = levels.get_mut(&priority) else {
            debug!(priority, "decrement for level with no active work");
            return;
        };
        if state.active == 0 {
            debug!(priority, "decrement for level with no active work");
            return;
        }
        state.active -= 1;
        if state.is_idle() {
            levels.remove(&priority);
        }
        self.active_total.fetch_sub(1, Ordering::AcqRel);
        if killed {
            self.killed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// `capacity - sum(active)`.
    pub fn available_slots(&self) -> usize {
        self.capacity()
            .saturating_sub(self.active_total.load(Ordering::Acquire))
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn active(&self) -> usize {
        self.active_total.load(Ordering::Acquire)
    }

    pub fn active_for(&self, priority: i32) -> usize {
        self.levels().get(&priority).map_or(0, |s| s.active)
    }

    pub fn killed(&self) -> u64 {
        self.killed.load(Ordering::Relaxed)
    }

    /// Change total capacity. Never goes below the active count; returns the
    /// value actually applied.
    pub fn set_capacity(&self, requested: usize) -> usize {
        let _levels = self.levels();
        let applied = requested.max(self.active_total.load(Ordering::Acquire));
        self.capacity.store(applied, Ordering::Release);
        applied
    }

    /// Per-level admission limits for one dequeue pass. `waiting` tells
    /// whether a priority level has queued work; reservations without
    /// waiting or running work are lent to the shared pool.
    pub fn admission_budget(&self, waiting: impl Fn(i32) -> bool) -> AdmissionBudget {
        let levels = self.levels();
        AdmissionBudget::from_levels(
            self.capacity.load(Ordering::Acquire),
            self.active_total.load(Ordering::Acquire),
            &levels,
            &waiting,
        )
    }

    pub fn snapshot(&self) -> AvailabilitySnapshot {
        let levels = self.levels();
        let capacity = self.capacity.load(Ordering::Acquire);
        let active = self.active_total.load(Ordering::Acquire);
        // Queue state is unknown here; report limits without lending.
        let budget = AdmissionBudget::from_levels(capacity, active, &levels, &|_| true);

        AvailabilitySnapshot {
            capacity,
            active,
            available: capacity.saturating_sub(active),
            killed: self.killed.load(Ordering::Relaxed),
            levels: levels
                .iter()
                .rev()
                .map(|(priority, state)| LevelAvailability {
                    priority: *priority,
                    reserved: state.reserved,
                    overage: state.overage,
                    active: state.active,
                    available: budget.limit_for(*priority),
                })
                .collect(),
        }
    }
}

// ── Admission budget ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct LevelBudget {
    reserved_free: usize,
    overage_free: usize,
}

/// Free slots available to each priority level during one dequeue pass.
///
/// Taken as a point-in-time copy so the queue can be drained without
/// holding the availability lock; each admitted item is charged with
/// [`consume`](Self::consume).
#[derive(Debug, Clone)]
pub struct AdmissionBudget {
    total_free: usize,
    shared_free: usize,
    reserved: BTreeMap<i32, LevelBudget>,
}

impl AdmissionBudget {
    fn from_levels(
        capacity: usize,
        active: usize,
        levels: &BTreeMap<i32, LevelState>,
        waiting: &dyn Fn(i32) -> bool,
    ) -> Self {
        let reserved_total: usize = levels.values().map(|s| s.reserved).sum();
        let shared_used: usize = levels.values().map(LevelState::borrowed).sum();
        let lent: usize = levels
            .iter()
            .filter(|(priority, s)| s.is_lending(waiting(**priority)))
            .map(|(_, s)| s.reserved)
            .sum();
        let shared_pool = capacity.saturating_sub(reserved_total) + lent;

        let reserved = levels
            .iter()
            .filter(|(priority, s)| s.reserved > 0 && !s.is_lending(waiting(**priority)))
            .map(|(priority, s)| {
                (
                    *priority,
                    LevelBudget {
                        reserved_free: s.reserved.saturating_sub(s.active),
                        overage_free: s.overage.saturating_sub(s.borrowed()),
                    },
                )
            })
            .collect();

        Self {
            total_free: capacity.saturating_sub(active),
            shared_free: shared_pool.saturating_sub(shared_used),
            reserved,
        }
    }

    /// A budget with `slots` free and no reservations.
    pub fn unrestricted(slots: usize) -> Self {
        Self {
            total_free: slots,
            shared_free: slots,
            reserved: BTreeMap::new(),
        }
    }

    /// Free slots regardless of level.
    pub fn total_free(&self) -> usize {
        self.total_free
    }

    pub fn is_exhausted(&self) -> bool {
        self.total_free == 0
    }

    /// How many more items `priority` may start in this pass.
    pub fn limit_for(&self, priority: i32) -> usize {
        let level_limit = match self.reserved.get(&priority) {
            Some(level) => level.reserved_free + level.overage_free.min(self.shared_free),
            None => self.shared_free,
        };
        level_limit.min(self.total_free)
    }

    /// Charge `n` admitted items to `priority`: reserved headroom first,
    /// then the shared pool.
    pub fn consume(&mut self, priority: i32, n: usize) {
        self.total_free = self.total_free.saturating_sub(n);
        let from_shared = match self.reserved.get_mut(&priority) {
            Some(level) => {
                let from_reserved = n.min(level.reserved_free);
                level.reserved_free -= from_reserved;
                let rest = n - from_reserved;
                level.overage_free = level.overage_free.saturating_sub(rest);
                rest
            }
            None => n,
        };
        self.shared_free = self.shared_free.saturating_sub(from_shared);
    }
}

// ── Snapshot ─────────────────────────────────────────────────────────

/// Point-in-time view of slot usage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AvailabilitySnapshot {
    pub capacity: usize,
    pub active: usize,
    pub available: usize,
    pub killed: u64,
    /// Levels with a reservation or active work, highest priority first.
    pub levels: Vec<LevelAvailability>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LevelAvailability {
    pub priority: i32,
    pub reserved: usize,
    pub overage: usize,
    pub active: usize,
    /// Slots this level could still claim right now.
    pub available: usize,
}
