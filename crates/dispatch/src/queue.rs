//! Per-priority FIFO queues and the dequeue-fill pass.

use std::collections::{BTreeMap, VecDeque};

use crate::availability::AdmissionBudget;
use crate::work::{WorkId, WorkItem};

/// One FIFO per priority level plus a bypass lane for internal work.
///
/// Not synchronized; the scheduler wraps it in a mutex that is held only
/// for enqueue and for the short dequeue pass.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    levels: BTreeMap<i32, VecDeque<WorkItem>>,
    bypass: VecDeque<WorkItem>,
    len: usize,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the item's priority level, creating the level on first use.
    pub fn enqueue(&mut self, item: WorkItem) {
        self.levels.entry(item.priority()).or_default().push_back(item);
        self.len += 1;
    }

    /// Append to the bypass lane, which only needs a free slot.
    pub fn enqueue_bypass(&mut self, item: WorkItem) {
        self.bypass.push_back(item);
        self.len += 1;
    }

    /// Put an item back at the head of its lane, ahead of anything queued
    /// after it.
    pub fn requeue_front(&mut self, item: WorkItem, bypass: bool) {
        if bypass {
            self.bypass.push_front(item);
        } else {
            self.levels.entry(item.priority()).or_default().push_front(item);
        }
        self.len += 1;
    }

    /// Pull as many bypass items as the budget has free slots.
    pub fn drain_bypass(&mut self, budget: &mut AdmissionBudget) -> Vec<WorkItem> {
        let take = self.bypass.len().min(budget.total_free());
        let items: Vec<WorkItem> = self.bypass.drain(..take).collect();
        for item in &items {
            budget.consume(item.priority(), 1);
        }
        self.len -= items.len();
        items
    }

    /// Visit levels from highest to lowest priority, taking from each as
    /// many items as its admission limit allows, until the budget or the
    /// queues run out. FIFO order within a level is preserved.
    pub fn dequeue(&mut self, budget: &mut AdmissionBudget) -> Vec<WorkItem> {
        let mut taken = Vec::new();

        for (priority, queue) in self.levels.iter_mut().rev() {
            if budget.is_exhausted() {
                break;
            }
            let take = queue.len().min(budget.limit_for(*priority));
            if take == 0 {
                continue;
            }
            budget.consume(*priority, take);
            taken.extend(queue.drain(..take));
        }

        self.levels.retain(|_, queue| !queue.is_empty());
        self.len -= taken.len();
        taken
    }

    /// Remove a queued item by id from whichever lane holds it.
    pub fn remove(&mut self, id: WorkId) -> Option<WorkItem> {
        let removed = match self.bypass.iter().position(|item| item.id() == id) {
            Some(pos) => self.bypass.remove(pos),
            None => self.levels.values_mut().find_map(|queue| {
                let pos = queue.iter().position(|item| item.id() == id)?;
                queue.remove(pos)
            }),
        };
        if removed.is_some() {
            self.len -= 1;
            self.levels.retain(|_, queue| !queue.is_empty());
        }
        removed
    }

    /// Empty every lane; bypass items first, then levels highest first.
    pub fn drain_all(&mut self) -> Vec<WorkItem> {
        let mut items: Vec<WorkItem> = self.bypass.drain(..).collect();
        let levels = std::mem::take(&mut self.levels);
        items.extend(levels.into_values().rev().flatten());
        self.len = 0;
        items
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when `priority` has queued (non-bypass) work.
    pub fn has_queued(&self, priority: i32) -> bool {
        self.levels.get(&priority).is_some_and(|queue| !queue.is_empty())
    }

    pub fn bypass_len(&self) -> usize {
        self.bypass.len()
    }

    /// `(priority, queued)` for every non-empty level, highest first.
    pub fn level_lengths(&self) -> Vec<(i32, usize)> {
        self.levels
            .iter()
            .rev()
            .map(|(priority, queue)| (*priority, queue.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::availability::AvailabilityManager;
    use crate::work::WorkRequest;

    fn item(priority: i32, caller: &str) -> WorkItem {
        let request = WorkRequest::new(priority, |_c| async { Ok(()) }).caller(caller);
        let mut item = WorkItem::from_request(request, None);
        item.mark_queued();
        item
    }

    fn callers(items: &[WorkItem]) -> Vec<&str> {
        items.iter().map(WorkItem::caller).collect()
    }

    #[test]
    fn fifo_within_a_level() {
        let mut queue = PriorityQueue::new();
        for name in ["a", "b", "c"] {
            queue.enqueue(item(1, name));
        }
        let taken = queue.dequeue(&mut AdmissionBudget::unrestricted(2));
        assert_eq!(callers(&taken), vec!["a", "b"]);
        assert_eq!(queue.len(), 1);

        let taken = queue.dequeue(&mut AdmissionBudget::unrestricted(2));
        assert_eq!(callers(&taken), vec!["c"]);
        assert!(queue.is_empty());
        assert!(queue.level_lengths().is_empty());
    }

    #[test]
    fn highest_priority_drains_first() {
        let mut queue = PriorityQueue::new();
        queue.enqueue(item(1, "low"));
        queue.enqueue(item(9, "high"));
        queue.enqueue(item(5, "mid"));
        queue.enqueue(item(-3, "negative"));

        let taken = queue.dequeue(&mut AdmissionBudget::unrestricted(3));
        assert_eq!(callers(&taken), vec!["high", "mid", "low"]);
        assert_eq!(queue.level_lengths(), vec![(-3, 1)]);
    }

    #[test]
    fn ten_items_into_four_slots() {
        let mut queue = PriorityQueue::new();
        for i in 0..10 {
            queue.enqueue(item(1, &format!("w{i}")));
        }
        let taken = queue.dequeue(&mut AdmissionBudget::unrestricted(4));
        assert_eq!(callers(&taken), vec!["w0", "w1", "w2", "w3"]);
        assert_eq!(queue.len(), 6);
    }

    #[test]
    fn reserved_level_is_not_starved_by_lower_flood() {
        let manager = AvailabilityManager::new(4);
        manager.reserve_bulkhead(1, 2, 0);
        let mut queue = PriorityQueue::new();
        for i in 0..20 {
            queue.enqueue(item(5, &format!("flood{i}")));
        }
        for i in 0..3 {
            queue.enqueue(item(1, &format!("reserved{i}")));
        }

        let mut budget = manager.admission_budget(|p| queue.has_queued(p));
        let taken = queue.dequeue(&mut budget);
        let reserved = taken.iter().filter(|i| i.priority() == 1).count();
        let flood = taken.iter().filter(|i| i.priority() == 5).count();
        assert_eq!(flood, 2, "unreserved level is capped at the shared pool");
        assert_eq!(reserved, 2, "reservation is honoured");
    }

    #[test]
    fn reserved_level_takes_reservation_plus_overage() {
        let manager = AvailabilityManager::new(4);
        manager.reserve_bulkhead(9, 2, 1);
        let mut queue = PriorityQueue::new();
        for i in 0..5 {
            queue.enqueue(item(9, &format!("hi{i}")));
        }
        let mut budget = manager.admission_budget(|p| queue.has_queued(p));
        let taken = queue.dequeue(&mut budget);
        assert_eq!(taken.len(), 3);
    }

    #[test]
    fn quiet_reservation_admits_lower_levels() {
        let manager = AvailabilityManager::new(2);
        manager.reserve_bulkhead(10, 2, 0);
        let mut queue = PriorityQueue::new();
        queue.enqueue(item(1, "low"));

        let mut budget = manager.admission_budget(|p| queue.has_queued(p));
        let taken = queue.dequeue(&mut budget);
        assert_eq!(taken.len(), 1);
        assert!(!queue.has_queued(1));
    }

    #[test]
    fn bypass_uses_only_total_budget() {
        let mut queue = PriorityQueue::new();
        queue.enqueue(item(1, "queued"));
        queue.enqueue_bypass(item(0, "internal1"));
        queue.enqueue_bypass(item(0, "internal2"));

        let mut budget = AdmissionBudget::unrestricted(2);
        let bypassed = queue.drain_bypass(&mut budget);
        assert_eq!(callers(&bypassed), vec!["internal1", "internal2"]);
        assert!(queue.dequeue(&mut budget).is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn requeue_front_keeps_order() {
        let mut queue = PriorityQueue::new();
        for name in ["a", "b", "c"] {
            queue.enqueue(item(1, name));
        }
        let taken = queue.dequeue(&mut AdmissionBudget::unrestricted(2));
        for item in taken.into_iter().rev() {
            queue.requeue_front(item, false);
        }
        let taken = queue.dequeue(&mut AdmissionBudget::unrestricted(3));
        assert_eq!(callers(&taken), vec!["a", "b", "c"]);
    }

    #[test]
    fn remove_by_id() {
        let mut queue = PriorityQueue::new();
        let keep = item(1, "keep");
        let drop = item(2, "drop");
        let drop_id = drop.id();
        queue.enqueue(keep);
        queue.enqueue(drop);

        let removed = queue.remove(drop_id).expect("queued item");
        assert_eq!(removed.caller(), "drop");
        assert!(queue.remove(drop_id).is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.level_lengths(), vec![(1, 1)]);
    }

    #[test]
    fn drain_all_empties_every_lane() {
        let mut queue = PriorityQueue::new();
        queue.enqueue(item(1, "low"));
        queue.enqueue(item(3, "high"));
        queue.enqueue_bypass(item(0, "internal"));

        let drained = queue.drain_all();
        assert_eq!(callers(&drained), vec!["internal", "high", "low"]);
        assert!(queue.is_empty());
    }
}
