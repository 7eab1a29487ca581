//! Runtime configuration types.
//!
//! [`ProxyConfig`] and [`ClientConfig`] are the single source of truth for
//! the two commands.  They are plain structs built once at startup by the
//! command line layer (optionally seeded from a TOML file) and then handed to
//! the wiring function by value.  Nothing in here reads the environment.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use sqlio_core::{ProtocolKind, DEFAULT_MAX_BUFFER, DEFAULT_MIN_CHUNK};

/// Delay between attempts to reach the outbound device.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Upper bound on graceful teardown after a shutdown signal.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(20);

/// Messages a sequential session may queue before its read loop waits.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// How a session hands framed messages to its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// One pipeline run at a time per connection, in arrival order.  A slow
    /// pipeline eventually pauses the read loop.
    #[default]
    Sequential,
    /// Every message runs on its own task.  Side effects of two messages
    /// from the same connection may complete in either order.
    Concurrent,
}

impl DispatchMode {
    pub fn name(&self) -> &'static str {
        match self {
            DispatchMode::Sequential => "sequential",
            DispatchMode::Concurrent => "concurrent",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(DispatchMode::Sequential),
            "concurrent" => Ok(DispatchMode::Concurrent),
            other => Err(format!(
                "unknown dispatch mode '{other}' (expected sequential or concurrent)"
            )),
        }
    }
}

// ── Session options ───────────────────────────────────────────────────────────

/// Tunables for one connection's read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Spare buffer capacity reserved before every read.
    pub min_chunk: usize,
    /// Pending bytes tolerated without a complete frame.
    pub max_buffer: usize,
    pub dispatch: DispatchMode,
    /// Queue depth for [`DispatchMode::Sequential`].
    pub queue_depth: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            min_chunk: DEFAULT_MIN_CHUNK,
            max_buffer: DEFAULT_MAX_BUFFER,
            dispatch: DispatchMode::default(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

// ── Proxy command ─────────────────────────────────────────────────────────────

/// Which side of the proxy this process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyMode {
    /// Devices connect to us.  Every accepted device is registered for fanout;
    /// bytes from fanout peers (loopback only) are broadcast to all devices.
    Listen {
        listen_addr: SocketAddr,
        fanout_addr: Option<SocketAddr>,
    },
    /// We connect to one device and keep reconnecting.  A single chat peer
    /// (loopback only) talks to that device through us.
    Bridge {
        /// `host:port` of the device; resolved on every attempt.
        remote: String,
        chat_addr: Option<SocketAddr>,
    },
}

/// Everything the `proxy` command needs to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub mode: ProxyMode,
    pub protocol: ProtocolKind,
    pub session: SessionOptions,
    pub retry_delay: Duration,
    pub shutdown_timeout: Duration,
    /// Frame fanout input with the device protocol instead of forwarding
    /// every received chunk verbatim.
    pub fanout_framed: bool,
}

impl ProxyConfig {
    /// A configuration for `mode` with every tunable at its default.
    pub fn new(mode: ProxyMode) -> Self {
        Self {
            mode,
            protocol: ProtocolKind::default(),
            session: SessionOptions::default(),
            retry_delay: DEFAULT_RETRY_DELAY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            fanout_framed: false,
        }
    }
}

// ── Client command ────────────────────────────────────────────────────────────

/// Everything the `client` command needs to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// `host:port` to connect to.
    pub addr: String,
    /// Bytes to send right after connecting.
    pub payload: Vec<u8>,
    /// Wait this long for a reply; `None` sends and exits.
    pub reply_timeout: Option<Duration>,
    /// Protocol used to frame the reply.
    pub reply_protocol: ProtocolKind,
}

// ── Bridge status ─────────────────────────────────────────────────────────────

/// Observable state of a bridge supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    /// No device connection; the next attempt follows after the retry delay.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The device session is running.
    Connected,
    /// Cancelled; no further attempts will be made.
    Stopped,
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BridgeStatus::Disconnected => "disconnected",
            BridgeStatus::Connecting => "connecting",
            BridgeStatus::Connected => "connected",
            BridgeStatus::Stopped => "stopped",
        };
        f.write_str(text)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
