//! In-memory transport for dispatcher tests.
//!
//! `MockTransport` records every frame written to it and lets a test play
//! the peer: reply with arbitrary frames, echo requests back, refuse
//! connects, or drop the current connection.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::{Connection, EVENT_QUEUE_CAPACITY, Link, Transport, TransportEvent, not_connected};

#[derive(Default)]
struct MockState {
    /// Raw frames in write order
    sent: Vec<String>,
    connects: usize,
    fail_next_connects: usize,
    fail_all_connects: bool,
    echo: bool,
    /// Bumped on every connect and drop so stale connections stop writing
    generation: u64,
    events: Option<mpsc::Sender<TransportEvent>>,
}

#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A peer that answers every request with `{"id", success: true, data: <request>}`.
    pub(crate) fn echoing() -> Self {
        let transport = Self::new();
        transport.state.lock().unwrap().echo = true;
        transport
    }

    pub(crate) fn fail_next_connects(&self, count: usize) {
        self.state.lock().unwrap().fail_next_connects = count;
    }

    pub(crate) fn fail_all_connects(&self, fail: bool) {
        self.state.lock().unwrap().fail_all_connects = fail;
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    /// Every frame written so far, parsed.
    pub(crate) fn sent_frames(&self) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|frame| serde_json::from_str(frame).expect("bridge wrote invalid JSON"))
            .collect()
    }

    /// Every request written so far, with batches flattened.
    pub(crate) fn sent_requests(&self) -> Vec<Value> {
        self.sent_frames()
            .into_iter()
            .flat_map(|frame| match frame.get("requests") {
                Some(Value::Array(requests)) => requests.clone(),
                _ => vec![frame],
            })
            .collect()
    }

    /// Wait until at least `count` requests have been written.
    pub(crate) async fn wait_for_sent(&self, count: usize) {
        let wait = async {
            while self.sent_requests().len() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "expected {} sent requests, saw {:?}",
                    count,
                    self.sent_requests()
                )
            });
    }

    /// Deliver `message` as one inbound frame.
    pub(crate) fn reply(&self, message: Value) {
        self.reply_raw(&message.to_string());
    }

    pub(crate) fn reply_raw(&self, frame: &str) {
        let state = self.state.lock().unwrap();
        let events = state.events.as_ref().expect("no open connection");
        events
            .try_send(TransportEvent::Message(frame.to_string()))
            .expect("event queue full");
    }

    /// Close the current connection from the peer side.
    pub(crate) fn drop_connection(&self, reason: &str) {
        let mut state = self.state.lock().unwrap();
        state.generation += 1;
        if let Some(events) = state.events.take() {
            let _ = events.try_send(TransportEvent::Closed(reason.to_string()));
        }
    }
}

impl Transport for MockTransport {
    type Connection = MockConnection;

    async fn connect(&self, _address: &str) -> io::Result<Link<MockConnection>> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.fail_all_connects {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "mock refused"));
        }
        if state.fail_next_connects > 0 {
            state.fail_next_connects -= 1;
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "mock refused"));
        }

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        state.generation += 1;
        state.events = Some(tx);
        Ok(Link {
            connection: MockConnection {
                state: Arc::clone(&self.state),
                generation: state.generation,
            },
            events: rx,
        })
    }
}

pub(crate) struct MockConnection {
    state: Arc<Mutex<MockState>>,
    generation: u64,
}

impl Connection for MockConnection {
    async fn send(&mut self, frame: String) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.generation != self.generation || state.events.is_none() {
            return Err(not_connected());
        }

        let echo = state.echo.then(|| echo_reply(&frame));
        state.sent.push(frame);
        if let (Some(reply), Some(events)) = (echo, state.events.as_ref()) {
            let _ = events.try_send(TransportEvent::Message(reply.to_string()));
        }
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        if state.generation == self.generation {
            state.events = None;
        }
    }
}

/// Success reply for a plain request, or an array of them for a batch.
fn echo_reply(frame: &str) -> Value {
    let request: Value = serde_json::from_str(frame).expect("bridge wrote invalid JSON");
    let answer = |request: &Value| {
        json!({
            "id": request["id"],
            "success": true,
            "data": request,
        })
    };
    match request.get("requests") {
        Some(Value::Array(requests)) => Value::Array(requests.iter().map(answer).collect()),
        _ => answer(&request),
    }
}
