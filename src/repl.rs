//! Line-oriented interactive session on top of a [`PluginBridge`].
//!
//! Each input line is one of:
//!
//! ```text
//! help                      usage summary
//! status                    connection state and health
//! exit                      end the session
//! <command>                 call with empty params
//! <command>, {json object}  call with params
//! ```

use log::debug;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::bridge::{HealthReport, PluginBridge};

pub const PROMPT: &str = "> ";

const USAGE: &str = "\
Commands:
  help                      show this message
  status                    show connection state and health
  exit                      quit
  <command>                 send <command> with empty params
  <command>, {json object}  send <command> with the given params
";

/// One parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Empty,
    Exit,
    Help,
    Status,
    Call { command: String, params: Value },
}

#[derive(Debug, Error, PartialEq)]
pub enum ReplError {
    #[error("missing command name before ','")]
    MissingCommand,

    #[error("invalid command name '{0}': names cannot contain whitespace")]
    InvalidCommand(String),

    #[error("could not parse arguments as JSON: {0}")]
    InvalidJson(String),

    #[error("arguments must be a JSON object, got {0}")]
    NotAnObject(String),
}

/// Parse one line of input.
pub fn parse_line(line: &str) -> Result<ReplCommand, ReplError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(ReplCommand::Empty);
    }

    match line.to_ascii_lowercase().as_str() {
        "exit" | "quit" => return Ok(ReplCommand::Exit),
        "help" => return Ok(ReplCommand::Help),
        "status" => return Ok(ReplCommand::Status),
        _ => {}
    }

    let (command, arguments) = match line.split_once(',') {
        Some((command, arguments)) => (command.trim(), Some(arguments.trim())),
        None => (line, None),
    };
    if command.is_empty() {
        return Err(ReplError::MissingCommand);
    }
    if command.contains(char::is_whitespace) {
        return Err(ReplError::InvalidCommand(command.to_string()));
    }

    let params = match arguments {
        None | Some("") => Value::Object(Map::new()),
        Some(arguments) => {
            let value: Value = serde_json::from_str(arguments)
                .map_err(|e| ReplError::InvalidJson(e.to_string()))?;
            if !value.is_object() {
                return Err(ReplError::NotAnObject(value.to_string()));
            }
            value
        }
    };

    Ok(ReplCommand::Call {
        command: command.to_string(),
        params,
    })
}

/// Multi-line human-readable summary of a health report.
pub fn format_status(report: &HealthReport) -> String {
    let snapshot = &report.snapshot;
    let mut out = format!(
        "state: {}\nhealth: {}\nsuccesses: {}\nerrors: {}\nprotocol errors: {}\nerror rate: {:.1}%\n",
        report.state,
        report.status,
        snapshot.success_count,
        snapshot.error_count,
        snapshot.protocol_error_count,
        snapshot.error_rate * 100.0,
    );
    if let Some(latency) = snapshot.average_latency() {
        out.push_str(&format!("average latency: {:?}\n", latency));
    }
    if let Some(event) = &snapshot.last_error {
        out.push_str(&format!("last error: {}\n", event.message));
    }
    out
}

/// Read commands from `input` until `exit` or end of input.
///
/// Call results are written to `output` as pretty JSON. Errors, both parse
/// errors and failed calls, are written to `output` too and do not end the
/// session.
pub async fn run_session<R, W>(bridge: &PluginBridge, input: R, mut output: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    output.write_all(USAGE.as_bytes()).await?;
    let mut lines = input.lines();

    loop {
        output.write_all(PROMPT.as_bytes()).await?;
        output.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };

        let reply = match parse_line(&line) {
            Ok(ReplCommand::Empty) => continue,
            Ok(ReplCommand::Exit) => break,
            Ok(ReplCommand::Help) => USAGE.to_string(),
            Ok(ReplCommand::Status) => {
                let mut report = HealthReport::clone(&bridge.health());
                report.state = bridge.state();
                format_status(&report)
            }
            Ok(ReplCommand::Call { command, params }) => {
                debug!(target: "plugin_bridge::repl", "Calling {} with {}", command, params);
                match bridge.send(&command, params).await {
                    Ok(value) => format!("{}\n", pretty(&value)),
                    Err(e) => format!("error: {}\n", e),
                }
            }
            Err(e) => format!("error: {}\n", e),
        };
        output.write_all(reply.as_bytes()).await?;
    }

    output.flush().await
}

pub fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
