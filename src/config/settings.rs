//! Bridge settings as read from `plugin-bridge.toml`.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working configuration. Unknown keys are rejected to catch
//! typos early.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::request::MAX_TIMEOUT;
use crate::bridge::{BackoffKind, ReconnectPolicy};
use crate::error::ConfigError;

pub const DEFAULT_ADDRESS: &str = "ws://127.0.0.1:3055";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeSettings {
    /// WebSocket URL, or a command line for the stdio transport
    pub address: String,
    pub timeouts: TimeoutSettings,
    pub batching: BatchSettings,
    pub queue: QueueSettings,
    pub retries: RetrySettings,
    pub reconnect: ReconnectSettings,
    pub health: HealthSettings,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            timeouts: TimeoutSettings::default(),
            batching: BatchSettings::default(),
            queue: QueueSettings::default(),
            retries: RetrySettings::default(),
            reconnect: ReconnectSettings::default(),
            health: HealthSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutSettings {
    pub default_ms: u64,
    /// Per-command overrides, keyed by command name
    pub operations: BTreeMap<String, u64>,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            default_ms: 30_000,
            operations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchSettings {
    pub enabled: bool,
    pub window_ms: u64,
    pub max_size: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            window_ms: 20,
            max_size: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSettings {
    /// Upper bound on queued plus in-flight requests
    pub capacity: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    /// Resends allowed after a reconnect when the caller does not say
    pub default_max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectSettings {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff: BackoffKind,
    pub max_delay_ms: u64,
    /// Upper bound on one connect attempt, handshake included
    pub connect_timeout_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 2_000,
            backoff: BackoffKind::Fixed,
            max_delay_ms: 30_000,
            connect_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthSettings {
    pub check_interval_ms: u64,
    /// Number of recent outcomes and latencies kept
    pub window: usize,
    /// Error rate at or above which a connected bridge counts as degraded
    pub error_rate_threshold: f64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            window: 100,
            error_rate_threshold: 0.25,
        }
    }
}

impl BridgeSettings {
    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::invalid("address", "must not be empty"));
        }
        check_millis("timeouts.default_ms", self.timeouts.default_ms)?;
        for (command, ms) in &self.timeouts.operations {
            check_millis("timeouts.operations", *ms).map_err(|_| {
                ConfigError::invalid(
                    "timeouts.operations",
                    format!(
                        "timeout for `{}` must be positive and at most {}ms",
                        command, MAX_MILLIS
                    ),
                )
            })?;
        }
        check_millis("batching.window_ms", self.batching.window_ms)?;
        if self.batching.max_size == 0 {
            return Err(ConfigError::invalid("batching.max_size", "must be at least 1"));
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::invalid("queue.capacity", "must be at least 1"));
        }
        check_millis("reconnect.delay_ms", self.reconnect.delay_ms)?;
        check_millis("reconnect.max_delay_ms", self.reconnect.max_delay_ms)?;
        if self.reconnect.max_delay_ms < self.reconnect.delay_ms {
            return Err(ConfigError::invalid(
                "reconnect.max_delay_ms",
                "must not be smaller than reconnect.delay_ms",
            ));
        }
        check_millis("reconnect.connect_timeout_ms", self.reconnect.connect_timeout_ms)?;
        check_millis("health.check_interval_ms", self.health.check_interval_ms)?;
        if self.health.window == 0 {
            return Err(ConfigError::invalid("health.window", "must be at least 1"));
        }
        let threshold = self.health.error_rate_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::invalid(
                "health.error_rate_threshold",
                format!("must be in (0, 1], got {}", threshold),
            ));
        }
        Ok(())
    }

    /// Timeout for `command`: its override if one is configured, else the default.
    pub fn timeout_for(&self, command: &str) -> Duration {
        let ms = self
            .timeouts
            .operations
            .get(command)
            .copied()
            .unwrap_or(self.timeouts.default_ms);
        Duration::from_millis(ms)
    }

    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect.max_attempts,
            delay: Duration::from_millis(self.reconnect.delay_ms),
            backoff: self.reconnect.backoff,
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
        }
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batching.window_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect.connect_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health.check_interval_ms)
    }
}

/// Longest duration any setting may hold. Deadlines and timers further out
/// than this cannot be scheduled.
const MAX_MILLIS: u64 = MAX_TIMEOUT.as_millis() as u64;

fn check_millis(field: &'static str, ms: u64) -> Result<(), ConfigError> {
    if ms == 0 {
        return Err(ConfigError::invalid(field, "must be positive"));
    }
    if ms > MAX_MILLIS {
        return Err(ConfigError::invalid(
            field,
            format!("must be at most {}ms, got {}", MAX_MILLIS, ms),
        ));
    }
    Ok(())
}
