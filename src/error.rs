//! Error handling types for plugin-bridge
//!
//! `BridgeError` is what callers of the bridge see when a request does not
//! resolve. `ConfigError` covers loading and validating settings.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::bridge::RequestId;

/// Failure of a single bridged request.
///
/// `Timeout`, `ConnectionLost`, `Cancelled`, `QueueFull`, `Peer` and
/// `InvalidRequest` are delivered to the one caller they concern.
/// `Protocol` and `DuplicateId` describe anomalies that cannot be tied to a
/// waiting caller; the dispatcher logs them and counts them in the health
/// snapshot instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// No reply arrived before the request's deadline
    #[error("request {id} timed out after {after:?}")]
    Timeout { id: RequestId, after: Duration },

    /// The socket dropped and the request had no retries left, or the peer
    /// became unreachable
    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// The caller cancelled the request
    #[error("request cancelled")]
    Cancelled,

    /// Too many requests are queued or in flight
    #[error("request queue full ({capacity} requests outstanding)")]
    QueueFull { capacity: usize },

    /// The peer answered with `success: false`
    #[error("peer error: {message}")]
    Peer { message: String },

    /// The request options were rejected before anything was queued
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// An inbound message could not be understood
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// A request id was registered twice
    #[error("duplicate request id: {id}")]
    DuplicateId { id: RequestId },
}

impl BridgeError {
    /// Create a connection lost error
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        BridgeError::ConnectionLost {
            reason: reason.into(),
        }
    }

    /// Create a peer error
    pub fn peer(message: impl Into<String>) -> Self {
        BridgeError::Peer {
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        BridgeError::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        BridgeError::Protocol {
            message: message.into(),
        }
    }

    /// Whether retrying the same call later at the application level can
    /// reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::Timeout { .. }
                | BridgeError::ConnectionLost { .. }
                | BridgeError::QueueFull { .. }
        )
    }
}

/// Result type for bridged requests
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Failure to load or validate bridge settings
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The settings file could not be read
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The settings file is not valid TOML for `BridgeSettings`
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A setting is out of range
    #[error("invalid setting `{field}`: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl ConfigError {
    /// Create an out-of-range setting error
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}
