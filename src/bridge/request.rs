//! Request types shared by the caller-facing handle and the dispatcher.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use super::RequestId;
use crate::error::BridgeError;

/// Scheduling priority of a request inside a batch.
///
/// Ordered so that `High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// An opaque operation for the peer: a command name plus its arguments.
///
/// The bridge never looks inside `params`; `command` is only used to pick a
/// per-operation timeout override.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub command: String,
    pub params: Value,
}

impl Operation {
    pub fn new(command: impl Into<String>, params: Value) -> Self {
        Self {
            command: command.into(),
            params,
        }
    }
}

/// Per-request policy supplied by the caller.
///
/// Unset fields fall back to the bridge settings: `timeout` to the
/// per-operation override or the default timeout, `max_retries` to
/// `retries.default_max_retries`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub priority: Priority,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl RequestOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Reject options that can never be honoured.
    pub(crate) fn validate(&self) -> Result<(), BridgeError> {
        match self.timeout {
            Some(Duration::ZERO) => Err(BridgeError::invalid_request("timeout must be positive")),
            Some(timeout) if timeout > MAX_TIMEOUT => Err(BridgeError::invalid_request(format!(
                "timeout {:?} exceeds the maximum of {:?}",
                timeout, MAX_TIMEOUT
            ))),
            _ => Ok(()),
        }
    }
}

/// Longest timeout a request may carry. The timer wheel cannot schedule
/// deadlines much further out.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A request owned by the dispatcher from enqueue until settlement.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub(crate) id: RequestId,
    pub(crate) operation: Operation,
    pub(crate) priority: Priority,
    /// Enqueue order, used as the FIFO tie-break inside one priority
    pub(crate) sequence: u64,
    pub(crate) enqueued_at: Instant,
    pub(crate) timeout: Duration,
    /// The timeout clock starts at enqueue, so time spent waiting in a batch
    /// or for a reconnect counts against it.
    pub(crate) deadline: Instant,
    pub(crate) retries_remaining: u32,
}

impl Request {
    pub(crate) fn new(
        id: RequestId,
        operation: Operation,
        priority: Priority,
        timeout: Duration,
        max_retries: u32,
        sequence: u64,
    ) -> Self {
        let enqueued_at = Instant::now();
        Self {
            id,
            operation,
            priority,
            sequence,
            enqueued_at,
            timeout,
            deadline: enqueued_at + timeout.min(MAX_TIMEOUT),
            retries_remaining: max_retries,
        }
    }
}
