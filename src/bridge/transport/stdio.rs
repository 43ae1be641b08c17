//! Child-process transport with `Content-Length` framing.
//!
//! The address is a command line. The peer process is spawned with piped
//! stdin/stdout and every message in either direction is framed as
//!
//! ```text
//! Content-Length: N\r\n
//! \r\n
//! {json}
//! ```
//!
//! Other header lines are ignored. EOF on stdout closes the link.

use std::io;
use std::process::Stdio;

use log::{debug, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Connection, EVENT_QUEUE_CAPACITY, Link, Transport, TransportEvent, not_connected};

const CONTENT_LENGTH: &str = "content-length";

/// Largest body a peer may announce.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct StdioTransport;

impl StdioTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for StdioTransport {
    type Connection = StdioConnection;

    async fn connect(&self, address: &str) -> io::Result<Link<StdioConnection>> {
        let mut parts = address.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty peer command line")
        })?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| io::Error::new(e.kind(), format!("failed to spawn {}: {}", program, e)))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, format!("no stdin for {}", program))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, format!("no stdout for {}", program))
        })?;

        debug!(
            target: "plugin_bridge::transport::stdio",
            "Spawned peer process {} (pid {:?})",
            program,
            child.id()
        );

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let reader = tokio::spawn(read_loop(stdout, tx));

        Ok(Link {
            connection: StdioConnection {
                stdin: Some(stdin),
                child,
                reader,
            },
            events: rx,
        })
    }
}

pub struct StdioConnection {
    /// Taken on close so the child sees EOF
    stdin: Option<ChildStdin>,
    child: Child,
    reader: JoinHandle<()>,
}

impl Connection for StdioConnection {
    async fn send(&mut self, frame: String) -> io::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(not_connected)?;
        if let Err(e) = write_frame(stdin, &frame).await {
            self.stdin = None;
            return Err(e);
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.stdin = None;
        if let Err(e) = self.child.start_kill() {
            debug!(
                target: "plugin_bridge::transport::stdio",
                "Peer process already gone: {}",
                e
            );
        }
        self.reader.abort();
    }
}

impl Drop for StdioConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(stdout: ChildStdout, tx: mpsc::Sender<TransportEvent>) {
    let mut reader = BufReader::new(stdout);
    let reason = loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if tx.send(TransportEvent::Message(frame)).await.is_err() {
                    return;
                }
            }
            Ok(None) => break "peer process closed stdout".to_string(),
            Err(e) => {
                warn!(
                    target: "plugin_bridge::transport::stdio",
                    "Failed to read frame from peer: {}",
                    e
                );
                break format!("read error: {}", e);
            }
        }
    };
    let _ = tx.send(TransportEvent::Closed(reason)).await;
}

/// Write one framed message and flush.
pub(crate) async fn write_frame<W>(writer: &mut W, frame: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("Content-Length: {}\r\n\r\n", frame.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await
}

/// Read one framed message.
///
/// Returns `Ok(None)` on a clean EOF before any header byte.
pub(crate) async fn read_frame<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            if saw_header {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a header block",
                ));
            }
            return Ok(None);
        }
        saw_header = true;

        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            let value = value.trim();
            let length = value.parse::<usize>().map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid Content-Length `{}`: {}", value, e),
                )
            })?;
            if length > MAX_FRAME_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "Content-Length {} exceeds the {} byte limit",
                        length, MAX_FRAME_BYTES
                    ),
                ));
            }
            content_length = Some(length);
        }
    }

    let length = content_length.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "missing Content-Length header")
    })?;

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    String::from_utf8(body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
