//! WebSocket transport.
//!
//! Each inbound text frame is one message. Binary frames are accepted when
//! they hold UTF-8. Pings are answered by tungstenite itself.

use std::io;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Connection, EVENT_QUEUE_CAPACITY, Link, Transport, TransportEvent, not_connected};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WebSocketTransport {
    type Connection = WebSocketConnection;

    async fn connect(&self, address: &str) -> io::Result<Link<WebSocketConnection>> {
        let url = url::Url::parse(address)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{}: {}", address, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported scheme `{}` in {}", url.scheme(), address),
            ));
        }

        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(io::Error::other)?;
        debug!(
            target: "plugin_bridge::transport::websocket",
            "Connected to {}",
            address
        );

        let (sink, stream) = stream.split();
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let reader = tokio::spawn(read_loop(stream, tx));

        Ok(Link {
            connection: WebSocketConnection {
                sink,
                reader,
                closed: false,
            },
            events: rx,
        })
    }
}

pub struct WebSocketConnection {
    sink: SplitSink<WsStream, Message>,
    reader: JoinHandle<()>,
    closed: bool,
}

impl Connection for WebSocketConnection {
    async fn send(&mut self, frame: String) -> io::Result<()> {
        if self.closed {
            return Err(not_connected());
        }
        if let Err(e) = self.sink.send(Message::text(frame)).await {
            self.closed = true;
            return Err(io::Error::other(e));
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.sink.close().await {
            debug!(
                target: "plugin_bridge::transport::websocket",
                "Close handshake failed: {}",
                e
            );
        }
        self.reader.abort();
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, tx: mpsc::Sender<TransportEvent>) {
    let reason = loop {
        let event = match stream.next().await {
            Some(Ok(Message::Text(text))) => TransportEvent::Message(text.as_str().to_owned()),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => TransportEvent::Message(text),
                Err(_) => {
                    warn!(
                        target: "plugin_bridge::transport::websocket",
                        "Dropping non-UTF-8 binary frame ({} bytes)",
                        bytes.len()
                    );
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) if !frame.reason.is_empty() => {
                        format!("peer closed the socket: {}", frame.reason.as_str())
                    }
                    _ => "peer closed the socket".to_string(),
                };
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break format!("websocket error: {}", e),
            None => break "websocket stream ended".to_string(),
        };
        if tx.send(event).await.is_err() {
            // Dispatcher dropped the link.
            return;
        }
    };

    debug!(
        target: "plugin_bridge::transport::websocket",
        "Reader finished: {}",
        reason
    );
    let _ = tx.send(TransportEvent::Closed(reason)).await;
}
