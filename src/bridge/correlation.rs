//! Correlation table for pending bridge requests.
//!
//! The table maps a [`RequestId`] to the live half of a request: the request
//! itself, the caller's continuation, and the handle of its timeout timer.
//! It is the single source of truth for "is this id still outstanding".
//!
//! The table is owned by the dispatcher task and never shared, so it needs no
//! locking. The only shared piece is the [`InFlightCounter`], which the
//! caller-facing handle increments before handing a request over and the table
//! decrements on every terminal operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, warn};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::time::delay_queue;

use super::RequestId;
use super::request::Request;
use crate::error::BridgeError;

/// Sending half of a caller's pending result.
pub(crate) type Continuation = oneshot::Sender<Result<Value, BridgeError>>;

/// Count of requests that are queued or in flight.
///
/// Shared between every `PluginBridge` clone and the dispatcher so that
/// backpressure can be applied without a round trip to the dispatcher task.
#[derive(Debug, Clone, Default)]
pub(crate) struct InFlightCounter(Arc<AtomicUsize>);

impl InFlightCounter {
    /// Reserve a slot if fewer than `capacity` are taken.
    pub(crate) fn try_acquire(&self, capacity: usize) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .is_ok()
    }

    /// Return a slot.
    pub(crate) fn release(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Where a pending entry currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    /// Waiting in the outbox to be written
    Queued,
    /// Written to the transport, awaiting a reply
    InFlight { sent_at: Instant },
}

/// Why an entry was expired by the dispatcher rather than by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExpireReason {
    Timeout,
    ConnectionLost(String),
}

/// The live bookkeeping record for a request awaiting settlement.
pub(crate) struct PendingEntry {
    pub(crate) request: Request,
    continuation: Continuation,
    pub(crate) timeout_key: Option<delay_queue::Key>,
    pub(crate) state: EntryState,
}

impl PendingEntry {
    pub(crate) fn new(request: Request, continuation: Continuation) -> Self {
        Self {
            request,
            continuation,
            timeout_key: None,
            state: EntryState::Queued,
        }
    }
}

/// What is left of an entry after it settled.
///
/// Handed back to the dispatcher so it can stop the timer, drop the id from
/// the outbox, and feed the health monitor.
#[derive(Debug)]
pub(crate) struct Settled {
    pub(crate) request: Request,
    pub(crate) timeout_key: Option<delay_queue::Key>,
    pub(crate) state: EntryState,
}

pub(crate) struct CorrelationTable {
    entries: HashMap<RequestId, PendingEntry>,
    in_flight: InFlightCounter,
}

impl CorrelationTable {
    pub(crate) fn new(in_flight: InFlightCounter) -> Self {
        Self {
            entries: HashMap::new(),
            in_flight,
        }
    }

    /// Register a pending entry.
    ///
    /// An id that is already present is never overwritten: the new entry's
    /// continuation is rejected with `DuplicateId`, its slot is released, and
    /// the existing entry keeps waiting.
    pub(crate) fn insert(&mut self, entry: PendingEntry) -> Result<(), BridgeError> {
        let id = entry.request.id;
        if self.entries.contains_key(&id) {
            warn!(
                target: "plugin_bridge::correlation",
                "Duplicate request id {}, discarding the new request",
                id
            );
            let error = BridgeError::DuplicateId { id };
            self.in_flight.release();
            let _ = entry.continuation.send(Err(error.clone()));
            return Err(error);
        }
        self.entries.insert(id, entry);
        Ok(())
    }

    pub(crate) fn get(&self, id: &RequestId) -> Option<&PendingEntry> {
        self.entries.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &RequestId) -> Option<&mut PendingEntry> {
        self.entries.get_mut(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of every entry that has been written and awaits a reply.
    pub(crate) fn in_flight_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<_> = self
            .entries
            .values()
            .filter(|entry| matches!(entry.state, EntryState::InFlight { .. }))
            .map(|entry| (entry.request.sequence, entry.request.id))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Settle an entry with the peer's result.
    pub(crate) fn resolve(&mut self, id: RequestId, value: Value) -> Option<Settled> {
        self.settle(id, Ok(value))
    }

    /// Settle an entry with an error.
    pub(crate) fn reject(&mut self, id: RequestId, error: BridgeError) -> Option<Settled> {
        self.settle(id, Err(error))
    }

    /// Settle an entry on the dispatcher's own initiative.
    pub(crate) fn expire(&mut self, id: RequestId, reason: ExpireReason) -> Option<Settled> {
        let error = match reason {
            ExpireReason::Timeout => {
                let after = self.entries.get(&id)?.request.timeout;
                BridgeError::Timeout { id, after }
            }
            ExpireReason::ConnectionLost(reason) => BridgeError::connection_lost(reason),
        };
        self.settle(id, Err(error))
    }

    /// Reject every entry with a clone of `error`.
    pub(crate) fn drain(&mut self, error: &BridgeError) -> Vec<Settled> {
        let ids: Vec<_> = self.entries.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.settle(id, Err(error.clone())))
            .collect()
    }

    fn settle(&mut self, id: RequestId, outcome: Result<Value, BridgeError>) -> Option<Settled> {
        let Some(entry) = self.entries.remove(&id) else {
            warn!(
                target: "plugin_bridge::correlation",
                "No pending request for id={}, dropping late or duplicate settlement",
                id
            );
            return None;
        };

        self.in_flight.release();

        if entry.continuation.send(outcome).is_err() {
            debug!(
                target: "plugin_bridge::correlation",
                "Caller for request {} went away before settlement",
                id
            );
        }

        Some(Settled {
            request: entry.request,
            timeout_key: entry.timeout_key,
            state: entry.state,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bridge::request::{Operation, Priority};
    use serde_json::json;

    fn request(sequence: u64) -> Request {
        Request::new(
            RequestId::generate(),
            Operation::new("get_document_info", json!({})),
            Priority::Normal,
            Duration::from_secs(1),
            0,
            sequence,
        )
    }

    /// Register `request` the way the handle and dispatcher do together.
    fn register(
        table: &mut CorrelationTable,
        counter: &InFlightCounter,
        request: Request,
    ) -> oneshot::Receiver<Result<Value, BridgeError>> {
        assert!(counter.try_acquire(usize::MAX));
        let (tx, rx) = oneshot::channel();
        table
            .insert(PendingEntry::new(request, tx))
            .expect("insert should succeed");
        rx
    }

    #[test]
    fn new_table_is_empty() {
        let table = CorrelationTable::new(InFlightCounter::default());
        assert!(table.is_empty());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn counter_respects_capacity() {
        let counter = InFlightCounter::default();
        assert!(counter.try_acquire(2));
        assert!(counter.try_acquire(2));
        assert!(!counter.try_acquire(2), "third slot should be refused");
        counter.release();
        assert!(counter.try_acquire(2));
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn counter_release_does_not_underflow() {
        let counter = InFlightCounter::default();
        counter.release();
        assert_eq!(counter.get(), 0);
    }

    #[tokio::test]
    async fn resolve_delivers_value_and_releases_slot() {
        let counter = InFlightCounter::default();
        let mut table = CorrelationTable::new(counter.clone());
        let req = request(0);
        let id = req.id;
        let rx = register(&mut table, &counter, req);
        assert_eq!(counter.get(), 1);

        let settled = table.resolve(id, json!({"name": "Page 1"}));
        assert!(settled.is_some());
        assert_eq!(counter.get(), 0);
        assert!(table.is_empty());

        let value = rx.await.expect("continuation should fire");
        assert_eq!(value, Ok(json!({"name": "Page 1"})));
    }

    #[test]
    fn duplicate_insert_keeps_existing_entry() {
        let counter = InFlightCounter::default();
        let mut table = CorrelationTable::new(counter.clone());
        let req = request(0);
        let duplicate = req.clone();
        let id = req.id;

        let mut first_rx = register(&mut table, &counter, req);

        assert!(counter.try_acquire(usize::MAX));
        let (tx, mut second_rx) = oneshot::channel();
        let result = table.insert(PendingEntry::new(duplicate, tx));

        assert_eq!(result, Err(BridgeError::DuplicateId { id }));
        assert_eq!(table.len(), 1, "existing entry must survive");
        assert_eq!(counter.get(), 1, "duplicate's slot must be released");
        assert_eq!(
            second_rx.try_recv().unwrap(),
            Err(BridgeError::DuplicateId { id })
        );
        assert!(
            first_rx.try_recv().is_err(),
            "original caller must still be waiting"
        );
    }

    #[test]
    fn second_settlement_is_noop() {
        let counter = InFlightCounter::default();
        let mut table = CorrelationTable::new(counter.clone());
        let req = request(0);
        let id = req.id;
        let mut rx = register(&mut table, &counter, req);

        assert!(table.resolve(id, json!(1)).is_some());
        assert!(table.resolve(id, json!(2)).is_none());
        assert!(table.reject(id, BridgeError::Cancelled).is_none());
        assert!(table.expire(id, ExpireReason::Timeout).is_none());

        assert_eq!(rx.try_recv().unwrap(), Ok(json!(1)));
        assert_eq!(counter.get(), 0, "counter must only drop once");
    }

    #[test]
    fn unknown_id_is_noop() {
        let mut table = CorrelationTable::new(InFlightCounter::default());
        assert!(table.resolve(RequestId::generate(), json!(null)).is_none());
        assert!(
            table
                .reject(RequestId::generate(), BridgeError::Cancelled)
                .is_none()
        );
    }

    #[test]
    fn expire_timeout_reports_request_timeout() {
        let counter = InFlightCounter::default();
        let mut table = CorrelationTable::new(counter.clone());
        let req = request(0);
        let id = req.id;
        let mut rx = register(&mut table, &counter, req);

        table.expire(id, ExpireReason::Timeout);

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(BridgeError::Timeout {
                id,
                after: Duration::from_secs(1)
            })
        );
    }

    #[test]
    fn expire_connection_lost_carries_reason() {
        let counter = InFlightCounter::default();
        let mut table = CorrelationTable::new(counter.clone());
        let req = request(0);
        let id = req.id;
        let mut rx = register(&mut table, &counter, req);

        table.expire(id, ExpireReason::ConnectionLost("socket closed".into()));

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(BridgeError::connection_lost("socket closed"))
        );
    }

    #[test]
    fn settlement_after_caller_dropped_still_cleans_up() {
        let counter = InFlightCounter::default();
        let mut table = CorrelationTable::new(counter.clone());
        let req = request(0);
        let id = req.id;
        let rx = register(&mut table, &counter, req);
        drop(rx);

        assert!(table.resolve(id, json!(null)).is_some());
        assert!(table.is_empty());
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn in_flight_ids_lists_sent_entries_in_enqueue_order() {
        let counter = InFlightCounter::default();
        let mut table = CorrelationTable::new(counter.clone());
        let first = request(0);
        let second = request(1);
        let queued = request(2);
        let (first_id, second_id, queued_id) = (first.id, second.id, queued.id);

        let _rx1 = register(&mut table, &counter, second);
        let _rx2 = register(&mut table, &counter, first);
        let _rx3 = register(&mut table, &counter, queued);

        let now = Instant::now();
        for id in [first_id, second_id] {
            table.get_mut(&id).unwrap().state = EntryState::InFlight { sent_at: now };
        }

        assert_eq!(table.in_flight_ids(), vec![first_id, second_id]);
        assert_eq!(table.get(&queued_id).unwrap().state, EntryState::Queued);
    }

    #[test]
    fn drain_rejects_everything() {
        let counter = InFlightCounter::default();
        let mut table = CorrelationTable::new(counter.clone());
        let mut receivers: Vec<_> = (0..3)
            .map(|seq| register(&mut table, &counter, request(seq)))
            .collect();

        let settled = table.drain(&BridgeError::connection_lost("peer unreachable"));

        assert_eq!(settled.len(), 3);
        assert!(table.is_empty());
        assert_eq!(counter.get(), 0);
        for rx in &mut receivers {
            assert_eq!(
                rx.try_recv().unwrap(),
                Err(BridgeError::connection_lost("peer unreachable"))
            );
        }
    }
}
