//! Transport seam between the dispatcher and the single peer socket.
//!
//! A transport knows how to open one connection and nothing else: no
//! correlation, no retries, no queueing. Opening yields a [`Link`], the
//! writable [`Connection`] half plus a receiver of [`TransportEvent`]s fed by
//! a reader task the adapter owns.
//!
//! ## Module Structure
//!
//! - `websocket` - Text frames over a WebSocket (tokio-tungstenite)
//! - `stdio` - Child process with `Content-Length` framing on stdin/stdout

pub mod stdio;
#[cfg(test)]
pub(crate) mod test_helpers;
pub mod websocket;

use std::future::Future;
use std::io;

use tokio::sync::mpsc;

pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;

/// Capacity of the per-connection event channel.
///
/// The dispatcher drains events as fast as it parses them, so this only
/// bounds bursts from the reader task.
pub(crate) const EVENT_QUEUE_CAPACITY: usize = 256;

/// Something the reader side observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete inbound frame
    Message(String),
    /// The connection is gone; no further events follow
    Closed(String),
}

/// An open connection and its event stream.
pub struct Link<C> {
    pub connection: C,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens connections to the peer.
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(
        &self,
        address: &str,
    ) -> impl Future<Output = io::Result<Link<Self::Connection>>> + Send;
}

/// Write half of an open connection.
///
/// Dropping a connection must stop its reader task.
pub trait Connection: Send + 'static {
    /// Write one complete frame. Fails with `NotConnected` once closed.
    fn send(&mut self, frame: String) -> impl Future<Output = io::Result<()>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

pub(crate) fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed")
}
