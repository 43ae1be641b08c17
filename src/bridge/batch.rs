//! Priority-ordered outbox for requests waiting to be written.
//!
//! Requests sit here while a batch window is open or while the connection is
//! not yet established. Draining always yields `high` before `normal` before
//! `low`, and FIFO by enqueue sequence within one priority.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::RequestId;
use super::request::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    priority: Priority,
    sequence: u64,
    id: RequestId,
}

impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority first, then the lower
        // (older) sequence number.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub(crate) struct Outbox {
    slots: BinaryHeap<Slot>,
}

impl Outbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, id: RequestId, priority: Priority, sequence: u64) {
        self.slots.push(Slot {
            priority,
            sequence,
            id,
        });
    }

    /// Drop `id` if it is still waiting. Returns whether it was present.
    pub(crate) fn remove(&mut self, id: RequestId) -> bool {
        let before = self.slots.len();
        self.slots.retain(|slot| slot.id != id);
        self.slots.len() != before
    }

    /// Take up to `max` ids in flush order.
    pub(crate) fn pop_batch(&mut self, max: usize) -> Vec<RequestId> {
        let mut batch = Vec::with_capacity(max.min(self.slots.len()));
        while batch.len() < max {
            match self.slots.pop() {
                Some(slot) => batch.push(slot.id),
                None => break,
            }
        }
        batch
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }
}
