//! Connection supervisor state machine.
//!
//! The supervisor owns no I/O. Each input (a connect request, a connect
//! outcome, a closed socket, a fired retry timer) moves it through
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected
//!                               |                  |
//!                             failure            closed
//!                               v                  v
//!                        Reconnecting(n) <---------+
//!                               |
//!                             timer --> Connecting
//! ```
//!
//! and returns a [`SupervisorAction`] for the dispatcher to carry out. Once
//! `max_attempts` reconnect attempts in a row have failed the supervisor parks
//! in `Disconnected` and reports the peer as unreachable.

use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Connection lifecycle state, as published to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ConnectionState {
    /// No connection and no attempt scheduled
    Disconnected,
    /// A connect attempt is running
    Connecting,
    /// The socket is up; requests are written immediately
    Connected,
    /// Waiting out the backoff before reconnect attempt `attempt` (1-based)
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
        }
    }
}

/// Shape of the delay between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Same delay before every attempt
    #[default]
    Fixed,
    /// `delay * 2^(attempt - 1)`, capped at `max_delay`
    Exponential,
}

/// Reconnect ceiling and backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: BackoffKind,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay to wait before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let shift = attempt.saturating_sub(1).min(31);
                self.delay
                    .checked_mul(1u32 << shift)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }
}

/// What the dispatcher must do after a supervisor transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SupervisorAction {
    /// Nothing to do
    Idle,
    /// Start a connect attempt now
    Connect,
    /// Arm the reconnect timer
    ScheduleReconnect { attempt: u32, delay: Duration },
    /// The socket is up. `resumed` is true when this follows a drop or a
    /// failed attempt, so in-flight work needs resending.
    Established { resumed: bool },
    /// The retry ceiling was hit; fail everything outstanding
    PeerUnreachable { attempts: u32 },
}

#[derive(Debug)]
pub(crate) struct Supervisor {
    state: ConnectionState,
    policy: ReconnectPolicy,
    /// Number of the reconnect attempt scheduled or running, 0 when none
    attempt: u32,
    /// Connect attempts that failed since the last success
    failures: u32,
    /// Whether the bridge has been connected before
    was_connected: bool,
}

impl Supervisor {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            attempt: 0,
            failures: 0,
            was_connected: false,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    /// A caller asked for a connection.
    pub(crate) fn connect(&mut self) -> SupervisorAction {
        match self.state {
            ConnectionState::Disconnected => {
                self.attempt = 0;
                self.failures = 0;
                self.transition(ConnectionState::Connecting);
                SupervisorAction::Connect
            }
            // Already connected, or an attempt or backoff is in progress.
            _ => SupervisorAction::Idle,
        }
    }

    pub(crate) fn on_connect_succeeded(&mut self) -> SupervisorAction {
        if self.state != ConnectionState::Connecting {
            debug!(
                target: "plugin_bridge::supervisor",
                "Ignoring connect success in state {:?}",
                self.state
            );
            return SupervisorAction::Idle;
        }
        let resumed = self.was_connected || self.failures > 0;
        if self.failures > 0 {
            info!(
                target: "plugin_bridge::supervisor",
                "Connected after {} failed attempt(s)",
                self.failures
            );
        }
        self.attempt = 0;
        self.failures = 0;
        self.was_connected = true;
        self.transition(ConnectionState::Connected);
        SupervisorAction::Established { resumed }
    }

    pub(crate) fn on_connect_failed(&mut self, reason: &str) -> SupervisorAction {
        if self.state != ConnectionState::Connecting {
            return SupervisorAction::Idle;
        }
        self.failures += 1;
        warn!(
            target: "plugin_bridge::supervisor",
            "Connect attempt failed ({} in a row): {}",
            self.failures,
            reason
        );
        self.schedule_or_give_up()
    }

    /// The established socket went away.
    pub(crate) fn on_closed(&mut self, reason: &str) -> SupervisorAction {
        if self.state != ConnectionState::Connected {
            return SupervisorAction::Idle;
        }
        warn!(
            target: "plugin_bridge::supervisor",
            "Connection closed: {}",
            reason
        );
        self.attempt = 0;
        self.schedule_or_give_up()
    }

    pub(crate) fn on_retry_timer(&mut self) -> SupervisorAction {
        match self.state {
            ConnectionState::Reconnecting { .. } => {
                self.transition(ConnectionState::Connecting);
                SupervisorAction::Connect
            }
            _ => SupervisorAction::Idle,
        }
    }

    /// Park without reporting the peer as unreachable.
    pub(crate) fn shutdown(&mut self) {
        self.attempt = 0;
        self.failures = 0;
        self.transition(ConnectionState::Disconnected);
    }

    fn schedule_or_give_up(&mut self) -> SupervisorAction {
        self.attempt += 1;
        if self.attempt > self.policy.max_attempts {
            let attempts = self.failures;
            warn!(
                target: "plugin_bridge::supervisor",
                "Peer unreachable after {} reconnect attempt(s), giving up",
                self.attempt - 1
            );
            self.attempt = 0;
            self.failures = 0;
            self.transition(ConnectionState::Disconnected);
            return SupervisorAction::PeerUnreachable { attempts };
        }
        let attempt = self.attempt;
        let delay = self.policy.delay_for(attempt);
        self.transition(ConnectionState::Reconnecting { attempt });
        SupervisorAction::ScheduleReconnect { attempt, delay }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(
                target: "plugin_bridge::supervisor",
                "{:?} -> {:?}",
                self.state,
                next
            );
            self.state = next;
        }
    }
}
