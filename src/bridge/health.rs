//! Passive health accounting for the bridge.
//!
//! The monitor only observes: the dispatcher reports each settlement and
//! each unparseable inbound message, and periodically asks for a
//! classification against the current connection state. Nothing here ever
//! changes how requests are routed.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use super::supervisor::ConnectionState;

/// Coarse health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(name)
    }
}

/// A timestamped outcome worth remembering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub at: SystemTime,
    pub message: String,
}

impl HealthEvent {
    fn now(message: impl Into<String>) -> Self {
        Self {
            at: SystemTime::now(),
            message: message.into(),
        }
    }
}

/// Point-in-time copy of the monitor's counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthSnapshot {
    pub success_count: u64,
    pub error_count: u64,
    pub protocol_error_count: u64,
    /// Most recent latencies, oldest first
    pub recent_latencies: Vec<Duration>,
    /// Share of failures among the most recent outcomes
    pub error_rate: f64,
    pub last_error: Option<HealthEvent>,
    pub last_success: Option<HealthEvent>,
}

impl HealthSnapshot {
    pub fn average_latency(&self) -> Option<Duration> {
        let count = u32::try_from(self.recent_latencies.len()).ok()?;
        if count == 0 {
            return None;
        }
        Some(self.recent_latencies.iter().sum::<Duration>() / count)
    }
}

/// What the bridge publishes for callers to read without a round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub state: ConnectionState,
    pub status: HealthStatus,
    pub snapshot: HealthSnapshot,
}

impl Default for HealthReport {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            status: HealthStatus::Unhealthy,
            snapshot: HealthSnapshot::default(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct HealthMonitor {
    window: usize,
    error_rate_threshold: f64,
    latencies: VecDeque<Duration>,
    /// `true` for a success, `false` for a failure
    outcomes: VecDeque<bool>,
    success_count: u64,
    error_count: u64,
    protocol_error_count: u64,
    last_error: Option<HealthEvent>,
    last_success: Option<HealthEvent>,
}

impl HealthMonitor {
    pub(crate) fn new(window: usize, error_rate_threshold: f64) -> Self {
        let window = window.max(1);
        Self {
            window,
            error_rate_threshold,
            latencies: VecDeque::with_capacity(window),
            outcomes: VecDeque::with_capacity(window),
            success_count: 0,
            error_count: 0,
            protocol_error_count: 0,
            last_error: None,
            last_success: None,
        }
    }

    pub(crate) fn record_success(&mut self, latency: Duration) {
        self.success_count += 1;
        push_bounded(&mut self.latencies, latency, self.window);
        push_bounded(&mut self.outcomes, true, self.window);
        self.last_success = Some(HealthEvent::now(format!(
            "completed in {}ms",
            latency.as_millis()
        )));
    }

    pub(crate) fn record_error(&mut self, message: impl Into<String>) {
        self.error_count += 1;
        push_bounded(&mut self.outcomes, false, self.window);
        self.last_error = Some(HealthEvent::now(message));
    }

    /// Count an inbound message that could not be understood.
    ///
    /// Not tied to any request, so it does not enter the outcome window.
    pub(crate) fn record_protocol_error(&mut self, message: impl Into<String>) {
        self.protocol_error_count += 1;
        self.last_error = Some(HealthEvent::now(message));
    }

    pub(crate) fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    pub(crate) fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            success_count: self.success_count,
            error_count: self.error_count,
            protocol_error_count: self.protocol_error_count,
            recent_latencies: self.latencies.iter().copied().collect(),
            error_rate: self.error_rate(),
            last_error: self.last_error.clone(),
            last_success: self.last_success.clone(),
        }
    }

    pub(crate) fn classify(&self, state: ConnectionState) -> HealthStatus {
        match state {
            ConnectionState::Disconnected => HealthStatus::Unhealthy,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                HealthStatus::Degraded
            }
            ConnectionState::Connected if self.error_rate() >= self.error_rate_threshold => {
                HealthStatus::Degraded
            }
            ConnectionState::Connected => HealthStatus::Healthy,
        }
    }

    pub(crate) fn report(&self, state: ConnectionState) -> HealthReport {
        HealthReport {
            state,
            status: self.classify(state),
            snapshot: self.snapshot(),
        }
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
    if queue.len() == cap {
        queue.pop_front();
    }
    queue.push_back(item);
}
