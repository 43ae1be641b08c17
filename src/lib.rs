//! plugin-bridge: multiplexed request/response bridge to a single plugin peer.
//!
//! A [`PluginBridge`] keeps one persistent connection (WebSocket or a child
//! process speaking over stdio) and lets any number of callers send commands
//! through it concurrently. Replies are matched by id, every request is
//! bounded by a timeout, and in-flight requests can survive a reconnect.

pub mod bridge;
pub mod config;
pub mod error;
pub mod repl;

pub use bridge::{
    ConnectionState, HealthReport, HealthStatus, Operation, PendingResponse, PluginBridge,
    Priority, RequestId, RequestOptions, StdioTransport, WebSocketTransport,
};
pub use config::BridgeSettings;
pub use error::{BridgeError, BridgeResult, ConfigError};
