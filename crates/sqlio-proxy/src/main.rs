//! sqlio entry point: a TCP front-end for line-printer and marking devices.
//!
//! # Usage
//!
//! ```text
//! sqlio proxy --listen-port 7000 [--fanout-port 7001] [--protocol videojet]
//! sqlio proxy --host printer.local --port 9100 [--chat-port 7002]
//! sqlio proxy -l 7000 -f 7001 -r videojet
//! sqlio client --port 7000 -t 2000 4041420d0a
//! sqlio client --port 7000 -r sc500 -t 2000 '<msg id=1>status</msg>'
//! ```
//!
//! The `proxy` command either listens for devices (and optionally fans bytes
//! out to all of them) or connects to one device and bridges it to a local
//! chat peer.  The `client` command sends one payload and prints the first
//! reply.
//!
//! # Environment variable overrides
//!
//! | Variable              | Flag                 |
//! |-----------------------|----------------------|
//! | `SQLIO_CONFIG`        | `--config`           |
//! | `SQLIO_LISTEN_PORT`   | `--listen-port`      |
//! | `SQLIO_FANOUT_PORT`   | `--fanout-port`      |
//! | `SQLIO_HOST`          | `--host`             |
//! | `SQLIO_PORT`          | `--port`             |
//! | `SQLIO_CHAT_PORT`     | `--chat-port`        |
//! | `SQLIO_PROTOCOL`      | `--protocol`         |
//! | `SQLIO_DISPATCH`      | `--dispatch`         |
//! | `SQLIO_LOG_LEVEL`     | `--log-level`        |
//!
//! Flags win over environment variables, which win over the `[proxy]`
//! section of the config file.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sqlio_core::ProtocolKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sqlio_proxy::domain::{ClientConfig, DispatchMode};
use sqlio_proxy::infrastructure::client::{decode_payload, render_reply, run_client, ClientOutcome};
use sqlio_proxy::infrastructure::config_file::{load_config, ProxySection};
use sqlio_proxy::infrastructure::proxy::run_proxy;

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "sqlio",
    about = "TCP front-end for line-printer and marking devices",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the device proxy (listen mode or bridge mode).
    Proxy(ProxyArgs),
    /// Send one payload and optionally wait for a reply.
    Client(ClientArgs),
}

#[derive(Debug, Args)]
struct ProxyArgs {
    /// TOML file with a `[proxy]` section.
    #[arg(long, env = "SQLIO_CONFIG")]
    config: Option<PathBuf>,

    /// Accept devices on this port (all interfaces).
    #[arg(short = 'l', long, env = "SQLIO_LISTEN_PORT")]
    listen_port: Option<u16>,

    /// Accept fanout peers on this loopback port.  Listen mode only.
    #[arg(short = 'f', long, env = "SQLIO_FANOUT_PORT")]
    fanout_port: Option<u16>,

    /// Device to connect to (bridge mode).
    #[arg(short = 'H', long, env = "SQLIO_HOST")]
    host: Option<String>,

    /// Port of the device to connect to (bridge mode).
    #[arg(short = 'p', long, env = "SQLIO_PORT")]
    port: Option<u16>,

    /// Accept the chat peer on this loopback port.  Bridge mode only.
    #[arg(short = 'c', long, env = "SQLIO_CHAT_PORT")]
    chat_port: Option<u16>,

    /// Device protocol: default, videojet, or sc500.
    #[arg(short = 'r', long, visible_alias = "protocol-name", env = "SQLIO_PROTOCOL")]
    protocol: Option<ProtocolKind>,

    /// Delay between attempts to reach the device, in milliseconds.
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Spare buffer capacity reserved before every socket read.
    #[arg(long)]
    min_chunk: Option<usize>,

    /// Pending bytes tolerated without a complete message.
    #[arg(long)]
    max_buffer: Option<usize>,

    /// sequential (arrival order) or concurrent (task per message).
    #[arg(long, env = "SQLIO_DISPATCH")]
    dispatch: Option<DispatchMode>,

    /// Upper bound on graceful teardown, in seconds.
    #[arg(long)]
    shutdown_timeout_secs: Option<u64>,

    /// Frame fanout input with the device protocol instead of forwarding it
    /// verbatim.
    #[arg(long)]
    fanout_framed: bool,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, env = "SQLIO_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Debug, Args)]
struct ClientArgs {
    /// Host to connect to.
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to connect to.
    #[arg(short, long)]
    port: u16,

    /// Payload: hex, or the message text for sc500.
    #[arg(required_unless_present = "file", conflicts_with = "file")]
    payload: Option<String>,

    /// Send the raw contents of this file instead.
    #[arg(short, long, visible_alias = "filename")]
    file: Option<PathBuf>,

    /// Wait this many milliseconds for a reply.  Without it the client sends
    /// and exits.
    #[arg(short = 't', long)]
    reply_timeout: Option<u64>,

    /// Protocol used to frame the reply and to decode the payload.
    #[arg(short = 'r', long = "reply-protocol-name", default_value = "default")]
    reply_protocol: ProtocolKind,

    /// Log progress and timings.
    #[arg(short, long)]
    verbose: bool,
}

impl ProxyArgs {
    /// Loads the config file (if any) and lays the flags over it.
    fn resolve(&self) -> anyhow::Result<ProxySection> {
        let mut section = match &self.config {
            Some(path) => {
                load_config(path)
                    .with_context(|| format!("failed to load {}", path.display()))?
                    .proxy
            }
            None => ProxySection::default(),
        };

        section.listen_port = self.listen_port.or(section.listen_port);
        section.fanout_port = self.fanout_port.or(section.fanout_port);
        section.host = self.host.clone().or(section.host);
        section.port = self.port.or(section.port);
        section.chat_port = self.chat_port.or(section.chat_port);
        if let Some(protocol) = self.protocol {
            section.protocol = protocol.name().to_string();
        }
        if let Some(ms) = self.retry_delay_ms {
            section.retry_delay_ms = ms;
        }
        if let Some(min_chunk) = self.min_chunk {
            section.min_chunk = min_chunk;
        }
        if let Some(max_buffer) = self.max_buffer {
            section.max_buffer = max_buffer;
        }
        if let Some(dispatch) = self.dispatch {
            section.dispatch = dispatch;
        }
        if let Some(secs) = self.shutdown_timeout_secs {
            section.shutdown_timeout_secs = secs;
        }
        section.fanout_framed |= self.fanout_framed;
        if let Some(level) = &self.log_level {
            section.log_level = level.clone();
        }
        Ok(section)
    }
}

impl ClientArgs {
    fn into_client_config(self) -> anyhow::Result<ClientConfig> {
        let payload = match (&self.payload, &self.file) {
            (_, Some(path)) => std::fs::read(path)
                .with_context(|| format!("failed to read payload file {}", path.display()))?,
            (Some(text), None) => decode_payload(text, self.reply_protocol)?,
            (None, None) => anyhow::bail!("nothing to send: give a payload or --file"),
        };
        Ok(ClientConfig {
            addr: format!("{}:{}", self.host, self.port),
            payload,
            reply_timeout: self.reply_timeout.map(Duration::from_millis),
            reply_protocol: self.reply_protocol,
        })
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Command::Proxy(args) => proxy(args).await,
        Command::Client(args) => client(args).await,
    }
}

async fn proxy(args: ProxyArgs) -> anyhow::Result<ExitCode> {
    let section = args.resolve()?;
    init_tracing(&section.log_level);
    let config = section.to_proxy_config()?;

    info!("persistence is disabled: no packet store is configured");
    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    run_proxy(config, None, shutdown).await?;
    Ok(ExitCode::SUCCESS)
}

async fn client(args: ClientArgs) -> anyhow::Result<ExitCode> {
    init_tracing(if args.verbose { "debug" } else { "warn" });
    let protocol = args.reply_protocol;
    let config = args.into_client_config()?;

    match run_client(&config).await? {
        ClientOutcome::Sent => Ok(ExitCode::SUCCESS),
        ClientOutcome::Reply(reply) => {
            println!("{}", render_reply(&reply, protocol));
            Ok(ExitCode::SUCCESS)
        }
        ClientOutcome::NoReply => {
            eprintln!("No reply received");
            Ok(ExitCode::from(1))
        }
    }
}

/// `RUST_LOG` wins; otherwise `level`.
fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();
}

/// Cancels `shutdown` on Ctrl+C, or SIGTERM on Unix.
async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!("failed to listen for Ctrl+C: {e}");
                        }
                    }
                    _ = term.recv() => info!("received SIGTERM"),
                }
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("failed to listen for Ctrl+C: {e}");
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
        }
    }

    info!("initiating graceful shutdown");
    shutdown.cancel();
}

// ── Tests ─────────────────────────────────────────────────────────────────────
