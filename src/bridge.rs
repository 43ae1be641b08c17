//! Request/response bridge to a single remote peer.
//!
//! Many independent calls are multiplexed over one persistent message
//! socket, matched to their replies by id, bounded by timeouts, retried
//! across reconnects on request, and optionally batched by priority.
//!
//! ## Module Structure
//!
//! - `protocol` - Request ids, wire builders and inbound frame parsing
//! - `request` - Operations, priorities and per-request options
//! - `correlation` - Pending-request table and the shared in-flight counter
//! - `batch` - Priority-ordered outbox
//! - `supervisor` - Connection state machine with backoff
//! - `health` - Passive health accounting
//! - `transport` - Transport seam plus WebSocket and stdio adapters
//! - `dispatcher` - The actor task owning all of the above
//! - `handle` - `PluginBridge`, the cloneable caller API

mod batch;
mod correlation;
mod dispatcher;
mod handle;
pub mod health;
mod protocol;
pub mod request;
pub mod supervisor;
pub mod transport;

pub use handle::{PendingResponse, PluginBridge};
pub use health::{HealthEvent, HealthReport, HealthSnapshot, HealthStatus};
pub use protocol::RequestId;
pub use request::{Operation, Priority, RequestOptions};
pub use supervisor::{BackoffKind, ConnectionState, ReconnectPolicy};
pub use transport::{
    Connection, Link, StdioTransport, Transport, TransportEvent, WebSocketTransport,
};
