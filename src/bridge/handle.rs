//! Caller-facing handle to a running bridge.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use super::RequestId;
use super::correlation::InFlightCounter;
use super::dispatcher::{Command, Dispatcher};
use super::health::HealthReport;
use super::request::{Operation, RequestOptions};
use super::supervisor::ConnectionState;
use super::transport::Transport;
use crate::config::BridgeSettings;
use crate::error::{BridgeError, BridgeResult, ConfigError};

/// Cloneable handle to one bridge instance.
///
/// All clones share one dispatcher task, one connection and one queue
/// capacity. The dispatcher stops when [`PluginBridge::shutdown`] is called
/// or the last clone is dropped.
#[derive(Clone)]
pub struct PluginBridge {
    commands: mpsc::UnboundedSender<Command>,
    in_flight: InFlightCounter,
    capacity: usize,
    state: watch::Receiver<ConnectionState>,
    report: Arc<ArcSwap<HealthReport>>,
}

impl PluginBridge {
    /// Validate `settings` and start the dispatcher on the current runtime.
    ///
    /// The bridge starts `Disconnected`; call [`connect`](Self::connect)
    /// before sending.
    pub fn spawn<T: Transport>(transport: T, settings: BridgeSettings) -> Result<Self, ConfigError> {
        settings.validate()?;

        let in_flight = InFlightCounter::default();
        let capacity = settings.queue.capacity;
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let report = Arc::new(ArcSwap::from_pointee(HealthReport::default()));
        let (commands, rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher::new(
            Arc::new(transport),
            settings,
            in_flight.clone(),
            state_tx,
            Arc::clone(&report),
        );
        tokio::spawn(dispatcher.run(rx));

        Ok(Self {
            commands,
            in_flight,
            capacity,
            state,
            report,
        })
    }

    /// Connect to the peer.
    ///
    /// Resolves once the bridge is `Connected`, or fails with
    /// `ConnectionLost` when the reconnect ceiling is exhausted.
    pub async fn connect(&self) -> BridgeResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect { reply })?;
        rx.await.map_err(|_| stopped())?
    }

    /// Queue `operation` and return a future for its result.
    ///
    /// Fails immediately with `InvalidRequest` for unusable options or
    /// `QueueFull` when `queue.capacity` requests are already outstanding.
    pub fn enqueue(
        &self,
        operation: Operation,
        options: RequestOptions,
    ) -> BridgeResult<PendingResponse> {
        options.validate()?;
        if !self.in_flight.try_acquire(self.capacity) {
            return Err(BridgeError::QueueFull {
                capacity: self.capacity,
            });
        }

        let id = RequestId::generate();
        let (reply, rx) = oneshot::channel();
        let command = Command::Enqueue {
            id,
            operation,
            options,
            reply,
        };
        if self.commands.send(command).is_err() {
            self.in_flight.release();
            return Err(stopped());
        }
        Ok(PendingResponse {
            id,
            rx,
            commands: self.commands.clone(),
            settled: false,
        })
    }

    /// Queue `operation` and wait for its result.
    pub async fn request(&self, operation: Operation, options: RequestOptions) -> BridgeResult<Value> {
        self.enqueue(operation, options)?.await
    }

    /// Send `command` with default options and wait for its result.
    pub async fn send(&self, command: &str, params: Value) -> BridgeResult<Value> {
        self.request(Operation::new(command, params), RequestOptions::default())
            .await
    }

    /// Cancel a pending request. Returns whether it was still outstanding.
    pub async fn cancel(&self, id: RequestId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Cancel { id, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every connection state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// The most recently published health report.
    pub fn health(&self) -> Arc<HealthReport> {
        self.report.load_full()
    }

    /// Number of requests queued or in flight.
    pub fn outstanding(&self) -> usize {
        self.in_flight.get()
    }

    /// Fail everything outstanding, close the connection and stop the
    /// dispatcher. Later calls on any clone fail with `ConnectionLost`.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    fn command(&self, command: Command) -> BridgeResult<()> {
        self.commands.send(command).map_err(|_| stopped())
    }
}

fn stopped() -> BridgeError {
    BridgeError::connection_lost("bridge is shut down")
}

/// The eventual result of an enqueued request.
///
/// Dropping it before it resolves cancels the request, freeing its queue
/// slot; a request still in the outbox is then never written.
#[must_use = "a request's result is lost unless the response is awaited"]
pub struct PendingResponse {
    id: RequestId,
    rx: oneshot::Receiver<Result<Value, BridgeError>>,
    commands: mpsc::UnboundedSender<Command>,
    settled: bool,
}

impl PendingResponse {
    /// Id to pass to [`PluginBridge::cancel`].
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Future for PendingResponse {
    type Output = BridgeResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };
        self.settled = true;
        Poll::Ready(result.unwrap_or_else(|_| Err(stopped())))
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // Nobody awaits the answer; the dispatcher ignores ids already settled.
        let (reply, _) = oneshot::channel();
        let _ = self.commands.send(Command::Cancel { id: self.id, reply });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    use super::*;
    use crate::bridge::transport::test_helpers::MockTransport;

    #[tokio::test]
    async fn pending_response_stays_pending_until_its_reply() {
        let transport = MockTransport::new();
        let bridge = PluginBridge::spawn(transport.clone(), BridgeSettings::default()).unwrap();
        bridge.connect().await.unwrap();

        let mut response = task::spawn(
            bridge
                .enqueue(Operation::new("ping", json!({})), RequestOptions::default())
                .unwrap(),
        );
        let id = response.id();
        transport.wait_for_sent(1).await;
        assert_pending!(response.poll());

        transport.reply(json!({"id": id.to_string(), "success": true, "data": 1}));
        while !response.is_woken() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_ready_eq!(response.poll(), Ok(json!(1)));
    }

    #[tokio::test]
    async fn clones_share_queue_capacity() {
        let mut settings = BridgeSettings::default();
        settings.queue.capacity = 1;
        let transport = MockTransport::new();
        let bridge = PluginBridge::spawn(transport, settings).unwrap();
        bridge.connect().await.unwrap();
        let other = bridge.clone();

        let _held = bridge
            .enqueue(Operation::new("a", json!({})), RequestOptions::default())
            .unwrap();
        assert!(matches!(
            other.enqueue(Operation::new("b", json!({})), RequestOptions::default()),
            Err(BridgeError::QueueFull { capacity: 1 })
        ));
        assert_eq!(other.outstanding(), 1);
    }

    #[tokio::test]
    async fn dropping_unsent_response_frees_its_slot() {
        let mut settings = BridgeSettings::default();
        settings.queue.capacity = 1;
        settings.batching.enabled = true;
        settings.batching.window_ms = 200;
        let transport = MockTransport::echoing();
        let bridge = PluginBridge::spawn(transport.clone(), settings).unwrap();
        bridge.connect().await.unwrap();

        let abandoned = bridge
            .enqueue(Operation::new("export_node_as_image", json!({})), RequestOptions::default())
            .unwrap();
        assert_eq!(bridge.outstanding(), 1);
        drop(abandoned);

        while bridge.outstanding() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let value = bridge.send("ping", json!({})).await.unwrap();
        assert_eq!(value["command"], "ping");
        let commands: Vec<_> = transport
            .sent_requests()
            .iter()
            .map(|request| request["command"].clone())
            .collect();
        assert_eq!(commands, vec![json!("ping")]);
    }

    #[tokio::test]
    async fn dropping_resolved_response_cancels_nothing() {
        let transport = MockTransport::echoing();
        let bridge = PluginBridge::spawn(transport, BridgeSettings::default()).unwrap();
        bridge.connect().await.unwrap();

        let mut response = bridge
            .enqueue(Operation::new("ping", json!({})), RequestOptions::default())
            .unwrap();
        assert!((&mut response).await.is_ok());
        assert!(response.settled);
        drop(response);
        assert_eq!(bridge.outstanding(), 0);
    }

    #[tokio::test]
    async fn cancel_after_shutdown_reports_nothing_cancelled() {
        let bridge = PluginBridge::spawn(MockTransport::new(), BridgeSettings::default()).unwrap();
        bridge.shutdown().await;
        assert!(!bridge.cancel(RequestId::generate()).await);
    }
}
