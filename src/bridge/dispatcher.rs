//! The dispatcher actor.
//!
//! One task owns every piece of mutable bridge state: the correlation table,
//! the outbox, the per-request timers, the supervisor, the health monitor and
//! the open connection. Callers talk to it only through [`Command`]s, so no
//! state is ever shared behind a lock.
//!
//! # Event sources
//!
//! The run loop waits on, in one `select!`:
//! - caller commands
//! - transport events from the current connection
//! - the outcome of a connect attempt running in its own task
//! - expired request timeouts (`DelayQueue`)
//! - the batch window and the reconnect backoff timer
//! - the health-check tick
//!
//! After handling any of them it publishes the connection state and a fresh
//! [`HealthReport`].

use std::future::{pending, poll_fn};
use std::io;
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tokio_util::time::DelayQueue;

use super::RequestId;
use super::batch::Outbox;
use super::correlation::{
    Continuation, CorrelationTable, EntryState, ExpireReason, InFlightCounter, PendingEntry,
    Settled,
};
use super::health::{HealthMonitor, HealthReport, HealthStatus};
use super::protocol::{Inbound, Reply, build_batch, build_request, parse_frame};
use super::request::{Operation, Request, RequestOptions};
use super::supervisor::{ConnectionState, Supervisor, SupervisorAction};
use super::transport::{Connection, Link, Transport, TransportEvent};
use crate::config::BridgeSettings;
use crate::error::BridgeError;

/// Messages from `PluginBridge` handles to the dispatcher.
pub(crate) enum Command {
    Enqueue {
        id: RequestId,
        operation: Operation,
        options: RequestOptions,
        reply: Continuation,
    },
    Cancel {
        id: RequestId,
        reply: oneshot::Sender<bool>,
    },
    Connect {
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

type ConnectTask<C> = JoinHandle<io::Result<Link<C>>>;

/// What woke the run loop.
enum Wake<C> {
    Command(Option<Command>),
    Event(TransportEvent),
    Connected(io::Result<Link<C>>),
    Expired(RequestId),
    BatchWindow,
    RetryTimer,
    HealthTick,
}

pub(crate) struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    settings: BridgeSettings,
    table: CorrelationTable,
    in_flight: InFlightCounter,
    outbox: Outbox,
    timeouts: DelayQueue<RequestId>,
    supervisor: Supervisor,
    health: HealthMonitor,
    connection: Option<T::Connection>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    pending_connect: Option<ConnectTask<T::Connection>>,
    batch_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    /// Set when the outbox should be written without waiting for the window
    flush_now: bool,
    connect_waiters: Vec<oneshot::Sender<Result<(), BridgeError>>>,
    next_sequence: u64,
    state_tx: watch::Sender<ConnectionState>,
    report: Arc<ArcSwap<HealthReport>>,
    last_status: HealthStatus,
}

impl<T: Transport> Dispatcher<T> {
    pub(crate) fn new(
        transport: Arc<T>,
        settings: BridgeSettings,
        in_flight: InFlightCounter,
        state_tx: watch::Sender<ConnectionState>,
        report: Arc<ArcSwap<HealthReport>>,
    ) -> Self {
        let supervisor = Supervisor::new(settings.policy());
        let health = HealthMonitor::new(settings.health.window, settings.health.error_rate_threshold);
        Self {
            transport,
            table: CorrelationTable::new(in_flight.clone()),
            in_flight,
            outbox: Outbox::new(),
            timeouts: DelayQueue::new(),
            supervisor,
            health,
            connection: None,
            events: None,
            pending_connect: None,
            batch_deadline: None,
            reconnect_at: None,
            flush_now: false,
            connect_waiters: Vec::new(),
            next_sequence: 0,
            state_tx,
            report,
            last_status: HealthStatus::Unhealthy,
            settings,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut health_tick = tokio::time::interval(self.settings.health_check_interval());
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.publish();

        loop {
            let has_timeouts = !self.timeouts.is_empty();
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                event = next_event(&mut self.events) => Wake::Event(event),
                outcome = join_connect(&mut self.pending_connect) => Wake::Connected(outcome),
                Some(expired) = poll_fn(|cx| self.timeouts.poll_expired(cx)), if has_timeouts => {
                    Wake::Expired(expired.into_inner())
                }
                _ = wait_until(self.batch_deadline) => Wake::BatchWindow,
                _ = wait_until(self.reconnect_at) => Wake::RetryTimer,
                _ = health_tick.tick() => Wake::HealthTick,
            };

            match wake {
                Wake::Command(Some(Command::Shutdown { reply })) => {
                    self.shutdown(&mut commands).await;
                    let _ = reply.send(());
                    return;
                }
                Wake::Command(Some(command)) => self.handle_command(command),
                Wake::Command(None) => {
                    debug!(
                        target: "plugin_bridge::dispatcher",
                        "All bridge handles dropped, shutting down"
                    );
                    self.shutdown(&mut commands).await;
                    return;
                }
                Wake::Event(event) => self.handle_event(event),
                Wake::Connected(outcome) => self.handle_connect_outcome(outcome),
                Wake::Expired(id) => self.handle_timeout(id),
                Wake::BatchWindow => {
                    self.batch_deadline = None;
                    self.flush_now = true;
                }
                Wake::RetryTimer => {
                    self.reconnect_at = None;
                    let action = self.supervisor.on_retry_timer();
                    self.apply(action);
                }
                Wake::HealthTick => {}
            }

            if self.flush_now {
                self.flush_now = false;
                self.flush_outbox().await;
            }
            self.publish();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue {
                id,
                operation,
                options,
                reply,
            } => self.enqueue(id, operation, options, reply),
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            Command::Connect { reply } => {
                if self.supervisor.state().is_connected() {
                    let _ = reply.send(Ok(()));
                    return;
                }
                self.connect_waiters.push(reply);
                let action = self.supervisor.connect();
                self.apply(action);
            }
            // Handled by the run loop.
            Command::Shutdown { .. } => {}
        }
    }

    fn enqueue(
        &mut self,
        id: RequestId,
        operation: Operation,
        options: RequestOptions,
        reply: Continuation,
    ) {
        if self.supervisor.state() == ConnectionState::Disconnected {
            self.in_flight.release();
            let _ = reply.send(Err(BridgeError::connection_lost("bridge is not connected")));
            return;
        }

        let timeout = options
            .timeout
            .unwrap_or_else(|| self.settings.timeout_for(&operation.command));
        let max_retries = options
            .max_retries
            .unwrap_or(self.settings.retries.default_max_retries);
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let request = Request::new(id, operation, options.priority, timeout, max_retries, sequence);
        let (priority, deadline) = (request.priority, request.deadline);
        debug!(
            target: "plugin_bridge::dispatcher",
            "Enqueued {} `{}` (priority {:?}, timeout {:?}, retries {})",
            id,
            request.operation.command,
            priority,
            timeout,
            max_retries
        );

        if self.table.insert(PendingEntry::new(request, reply)).is_err() {
            return;
        }
        let key = self.timeouts.insert_at(id, deadline);
        if let Some(entry) = self.table.get_mut(&id) {
            entry.timeout_key = Some(key);
        }
        self.outbox.push(id, priority, sequence);

        if !self.supervisor.state().is_connected() {
            // Flushed once the connection is established.
            return;
        }
        if !self.settings.batching.enabled || self.outbox.len() >= self.settings.batching.max_size {
            self.flush_now = true;
        } else if self.batch_deadline.is_none() {
            self.batch_deadline = Some(Instant::now() + self.settings.batch_window());
        }
    }

    fn cancel(&mut self, id: RequestId) -> bool {
        if self.table.get(&id).is_none() {
            return false;
        }
        match self.table.reject(id, BridgeError::Cancelled) {
            Some(settled) => {
                debug!(target: "plugin_bridge::dispatcher", "Cancelled {}", id);
                self.forget(&settled);
                true
            }
            None => false,
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(frame) => {
                for message in parse_frame(&frame) {
                    match message {
                        Ok(Inbound::Reply(reply)) => self.handle_reply(reply),
                        Ok(Inbound::Notification(value)) => {
                            debug!(
                                target: "plugin_bridge::dispatcher",
                                "Notification from peer: {}",
                                value
                            );
                        }
                        Err(e) => {
                            warn!(
                                target: "plugin_bridge::dispatcher",
                                "Dropping inbound message: {}",
                                e
                            );
                            self.health.record_protocol_error(e.to_string());
                        }
                    }
                }
            }
            TransportEvent::Closed(reason) => self.connection_lost(reason),
        }
    }

    fn handle_reply(&mut self, reply: Reply) {
        let Reply { id, outcome } = reply;
        match outcome {
            Ok(value) => {
                if let Some(settled) = self.table.resolve(id, value) {
                    let started = match settled.state {
                        EntryState::InFlight { sent_at } => sent_at,
                        EntryState::Queued => settled.request.enqueued_at,
                    };
                    self.health.record_success(started.elapsed());
                    self.forget(&settled);
                }
            }
            Err(message) => {
                let error = BridgeError::peer(message);
                let description = error.to_string();
                if let Some(settled) = self.table.reject(id, error) {
                    self.health.record_error(description);
                    self.forget(&settled);
                }
            }
        }
    }

    fn handle_timeout(&mut self, id: RequestId) {
        // The key is spent once yielded by the queue.
        if let Some(entry) = self.table.get_mut(&id) {
            entry.timeout_key = None;
        }
        if let Some(settled) = self.table.expire(id, ExpireReason::Timeout) {
            debug!(
                target: "plugin_bridge::dispatcher",
                "Request {} timed out after {:?}",
                id,
                settled.request.timeout
            );
            self.health
                .record_error(format!("request {} timed out", settled.request.operation.command));
            self.forget(&settled);
        }
    }

    fn handle_connect_outcome(&mut self, outcome: io::Result<Link<T::Connection>>) {
        match outcome {
            Ok(link) => {
                let action = self.supervisor.on_connect_succeeded();
                if matches!(action, SupervisorAction::Established { .. }) {
                    self.connection = Some(link.connection);
                    self.events = Some(link.events);
                }
                self.apply(action);
            }
            Err(e) => {
                let action = self.supervisor.on_connect_failed(&e.to_string());
                self.apply(action);
            }
        }
    }

    /// The socket went away: requeue what may be retried, fail the rest.
    fn connection_lost(&mut self, reason: String) {
        self.connection = None;
        self.events = None;
        let action = self.supervisor.on_closed(&reason);

        for id in self.table.in_flight_ids() {
            let Some(entry) = self.table.get_mut(&id) else {
                continue;
            };
            if entry.request.retries_remaining > 0 {
                entry.request.retries_remaining -= 1;
                entry.state = EntryState::Queued;
                let (priority, sequence) = (entry.request.priority, entry.request.sequence);
                debug!(
                    target: "plugin_bridge::dispatcher",
                    "Requeueing {} for resend ({} retries left)",
                    id,
                    entry.request.retries_remaining
                );
                self.outbox.push(id, priority, sequence);
            } else if let Some(settled) =
                self.table
                    .expire(id, ExpireReason::ConnectionLost(reason.clone()))
            {
                self.health.record_error(format!("connection lost: {}", reason));
                self.forget(&settled);
            }
        }

        self.apply(action);
    }

    fn apply(&mut self, action: SupervisorAction) {
        match action {
            SupervisorAction::Idle => {}
            SupervisorAction::Connect => self.start_connect(),
            SupervisorAction::ScheduleReconnect { attempt, delay } => {
                info!(
                    target: "plugin_bridge::dispatcher",
                    "Reconnect attempt {} in {:?}",
                    attempt,
                    delay
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            SupervisorAction::Established { resumed } => {
                info!(
                    target: "plugin_bridge::dispatcher",
                    "Connected to {}{}",
                    self.settings.address,
                    if resumed { " (resumed)" } else { "" }
                );
                self.flush_now = true;
                // Waiters must observe the new state once connect() returns.
                self.publish();
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            SupervisorAction::PeerUnreachable { attempts } => {
                error!(
                    target: "plugin_bridge::dispatcher",
                    "Peer at {} unreachable after {} attempt(s)",
                    self.settings.address,
                    attempts
                );
                let error = BridgeError::connection_lost(format!(
                    "peer unreachable after {} attempt(s)",
                    attempts
                ));
                self.publish();
                self.fail_everything(&error);
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(error.clone()));
                }
            }
        }
    }

    fn start_connect(&mut self) {
        let transport = Arc::clone(&self.transport);
        let address = self.settings.address.clone();
        let limit = self.settings.connect_timeout();
        debug!(target: "plugin_bridge::dispatcher", "Connecting to {}", address);
        self.pending_connect = Some(tokio::spawn(async move {
            match tokio::time::timeout(limit, transport.connect(&address)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", address, limit),
                )),
            }
        }));
    }

    /// Write everything in the outbox, in chunks of at most `max_size`.
    async fn flush_outbox(&mut self) {
        self.batch_deadline = None;
        if !self.supervisor.state().is_connected() {
            return;
        }
        let chunk = if self.settings.batching.enabled {
            self.settings.batching.max_size
        } else {
            1
        };

        while !self.outbox.is_empty() {
            let mut ids = Vec::new();
            let mut frames = Vec::new();
            for id in self.outbox.pop_batch(chunk) {
                // Settled ids may linger only until they are popped.
                match self.table.get(&id) {
                    Some(entry) if entry.state == EntryState::Queued => {
                        frames.push(build_request(id, &entry.request.operation));
                        ids.push(id);
                    }
                    _ => {}
                }
            }
            let payload = match frames.len() {
                0 => continue,
                1 => frames.swap_remove(0),
                _ => build_batch(frames),
            };

            let Some(connection) = self.connection.as_mut() else {
                self.requeue(&ids);
                return;
            };
            match connection.send(payload.to_string()).await {
                Ok(()) => {
                    debug!(
                        target: "plugin_bridge::dispatcher",
                        "Sent {} request(s)",
                        ids.len()
                    );
                    let sent_at = Instant::now();
                    for id in &ids {
                        if let Some(entry) = self.table.get_mut(id) {
                            entry.state = EntryState::InFlight { sent_at };
                        }
                    }
                }
                Err(e) => {
                    warn!(target: "plugin_bridge::dispatcher", "Send failed: {}", e);
                    // Never written, so no retry is charged.
                    self.requeue(&ids);
                    self.connection_lost(format!("send failed: {}", e));
                    return;
                }
            }
        }
    }

    fn requeue(&mut self, ids: &[RequestId]) {
        for id in ids {
            if let Some(entry) = self.table.get(id) {
                self.outbox
                    .push(*id, entry.request.priority, entry.request.sequence);
            }
        }
    }

    /// Drop timer and outbox bookkeeping for a settled request.
    fn forget(&mut self, settled: &Settled) {
        if let Some(key) = &settled.timeout_key {
            self.timeouts.remove(key);
        }
        if settled.state == EntryState::Queued {
            self.outbox.remove(settled.request.id);
        }
    }

    fn fail_everything(&mut self, error: &BridgeError) {
        let settled = self.table.drain(error);
        if !settled.is_empty() {
            self.health.record_error(error.to_string());
        }
        self.outbox.clear();
        self.timeouts.clear();
        self.batch_deadline = None;
        self.reconnect_at = None;
        self.flush_now = false;
    }

    async fn shutdown(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) {
        info!(target: "plugin_bridge::dispatcher", "Shutting down bridge");
        let error = BridgeError::connection_lost("bridge shut down");

        commands.close();
        if let Some(task) = self.pending_connect.take() {
            task.abort();
        }
        self.supervisor.shutdown();
        self.fail_everything(&error);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }

        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Enqueue { reply, .. } => {
                    self.in_flight.release();
                    let _ = reply.send(Err(error.clone()));
                }
                Command::Cancel { reply, .. } => {
                    let _ = reply.send(false);
                }
                Command::Connect { reply } => {
                    let _ = reply.send(Err(error.clone()));
                }
                Command::Shutdown { reply } => {
                    let _ = reply.send(());
                }
            }
        }

        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
        self.events = None;
        self.publish();
    }

    fn publish(&mut self) {
        let state = self.supervisor.state();
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });

        let report = self.health.report(state);
        if report.status != self.last_status {
            info!(
                target: "plugin_bridge::dispatcher",
                "Bridge health {} -> {}",
                self.last_status,
                report.status
            );
            self.last_status = report.status;
        }
        self.report.store(Arc::new(report));
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<TransportEvent>>) -> TransportEvent {
    match events {
        Some(rx) => rx.recv().await.unwrap_or_else(|| {
            TransportEvent::Closed("transport event channel closed".to_string())
        }),
        None => pending().await,
    }
}

async fn join_connect<C>(task: &mut Option<ConnectTask<C>>) -> io::Result<Link<C>> {
    let Some(handle) = task.as_mut() else {
        return pending().await;
    };
    let result = handle.await;
    *task = None;
    result.unwrap_or_else(|e| Err(io::Error::other(e)))
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
