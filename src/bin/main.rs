use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use plugin_bridge::bridge::Transport;
use plugin_bridge::config::{BridgeSettings, resolve_settings};
use plugin_bridge::repl;
use plugin_bridge::{PluginBridge, StdioTransport, WebSocketTransport};
use serde_json::Value;
use tokio::io::{BufReader, stdin, stdout};

/// Send commands to a plugin peer over one multiplexed connection
#[derive(Parser)]
#[command(name = "plugin-bridge")]
#[command(version)]
#[command(about = "Send commands to a plugin peer over one multiplexed connection")]
struct Cli {
    /// Settings file (default: ./plugin-bridge.toml, then the user config)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Peer address: a ws:// URL, or a command line for --transport stdio
    #[arg(long, global = true)]
    address: Option<String>,

    /// How to reach the peer
    #[arg(long, value_enum, default_value_t = TransportKind::Ws, global = true)]
    transport: TransportKind,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum TransportKind {
    /// WebSocket client
    Ws,
    /// Child process speaking Content-Length framed JSON on stdin/stdout
    Stdio,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive session (the default)
    Repl,
    /// Send one command and print its result
    Call {
        /// Command name (e.g., get_document_info)
        command: String,

        /// Parameters as a JSON object
        #[arg(default_value = "{}")]
        params: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();

    let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut settings = match resolve_settings(cli.config.as_deref(), &working_dir) {
        Ok((settings, _)) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };
    if let Some(address) = cli.address {
        settings.address = address;
    }

    let command = cli.command.unwrap_or(Commands::Repl);
    let code = match cli.transport {
        TransportKind::Ws => run(WebSocketTransport, settings, command).await,
        TransportKind::Stdio => run(StdioTransport, settings, command).await,
    };
    std::process::exit(code);
}

async fn run<T: Transport>(transport: T, settings: BridgeSettings, command: Commands) -> i32 {
    let address = settings.address.clone();
    let bridge = match PluginBridge::spawn(transport, settings) {
        Ok(bridge) => bridge,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 2;
        }
    };

    eprintln!("Connecting to {}...", address);
    if let Err(e) = bridge.connect().await {
        eprintln!("Error: could not connect to {}: {}", address, e);
        return 1;
    }

    let code = match command {
        Commands::Repl => {
            match repl::run_session(&bridge, BufReader::new(stdin()), stdout()).await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    1
                }
            }
        }
        Commands::Call { command, params } => call(&bridge, &command, &params).await,
    };

    bridge.shutdown().await;
    code
}

async fn call(bridge: &PluginBridge, command: &str, params: &str) -> i32 {
    let params: Value = match serde_json::from_str(params) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            eprintln!("Error: parameters must be a JSON object, got {}", other);
            return 2;
        }
        Err(e) => {
            eprintln!("Error: could not parse parameters: {}", e);
            return 2;
        }
    };

    match bridge.send(command, params).await {
        Ok(value) => {
            println!("{}", repl::pretty(&value));
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}
