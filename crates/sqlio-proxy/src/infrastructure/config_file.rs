//! TOML configuration file for the `proxy` command.
//!
//! Every setting the command line accepts can also live in a file passed
//! with `--config`.  Command-line flags win over file values; file values win
//! over built-in defaults.
//!
//! ```toml
//! [proxy]
//! listen_port = 7000
//! fanout_port = 7001
//! protocol = "videojet"
//! dispatch = "sequential"
//! max_buffer = 65536
//! log_level = "debug"
//! ```
//!
//! A missing file is not an error: it behaves like an empty one.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sqlio_core::{ProtocolKind, UnknownProtocol, DEFAULT_MAX_BUFFER, DEFAULT_MIN_CHUNK};
use thiserror::Error;

use crate::domain::config::{
    DispatchMode, ProxyConfig, ProxyMode, SessionOptions, DEFAULT_QUEUE_DEPTH,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Protocol(#[from] UnknownProtocol),

    /// Neither a listen port nor a host and port to connect to.
    #[error("nothing to run: give --listen-port, or --host and --port")]
    NoMode,
}

// ── Schema ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FileConfig {
    #[serde(default)]
    pub proxy: ProxySection,
}

/// Settings for the `proxy` command.  Also the merge target for command-line
/// overrides.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProxySection {
    /// Device listener port (any interface).  Selects listen mode.
    #[serde(default)]
    pub listen_port: Option<u16>,
    /// Fanout listener port (loopback).  Listen mode only.
    #[serde(default)]
    pub fanout_port: Option<u16>,
    /// Device to connect to.  Selects bridge mode together with `port`.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Chat listener port (loopback).  Bridge mode only.
    #[serde(default)]
    pub chat_port: Option<u16>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_min_chunk")]
    pub min_chunk: usize,
    #[serde(default = "default_max_buffer")]
    pub max_buffer: usize,
    #[serde(default)]
    pub dispatch: DispatchMode,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub fanout_framed: bool,
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_protocol() -> String {
    ProtocolKind::Default.name().to_string()
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_min_chunk() -> usize {
    DEFAULT_MIN_CHUNK
}
fn default_max_buffer() -> usize {
    DEFAULT_MAX_BUFFER
}
fn default_shutdown_timeout_secs() -> u64 {
    20
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            listen_port: None,
            fanout_port: None,
            host: None,
            port: None,
            chat_port: None,
            protocol: default_protocol(),
            retry_delay_ms: default_retry_delay_ms(),
            min_chunk: default_min_chunk(),
            max_buffer: default_max_buffer(),
            dispatch: DispatchMode::default(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            fanout_framed: false,
            log_level: default_log_level(),
        }
    }
}

impl ProxySection {
    /// Resolves the section into a runnable configuration.
    ///
    /// A listen port selects listen mode; otherwise host and port select
    /// bridge mode.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Protocol`] for an unknown protocol name,
    /// [`ConfigError::NoMode`] when neither mode is configured.
    pub fn to_proxy_config(&self) -> Result<ProxyConfig, ConfigError> {
        let loopback = |port: u16| SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        let mode = match (self.listen_port, &self.host, self.port) {
            (Some(listen), _, _) => ProxyMode::Listen {
                listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, listen)),
                fanout_addr: self.fanout_port.map(loopback),
            },
            (None, Some(host), Some(port)) => ProxyMode::Bridge {
                remote: format!("{host}:{port}"),
                chat_addr: self.chat_port.map(loopback),
            },
            _ => return Err(ConfigError::NoMode),
        };

        Ok(ProxyConfig {
            mode,
            protocol: self.protocol.parse()?,
            session: SessionOptions {
                min_chunk: self.min_chunk,
                max_buffer: self.max_buffer,
                dispatch: self.dispatch,
                queue_depth: DEFAULT_QUEUE_DEPTH,
            },
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            fanout_framed: self.fanout_framed,
        })
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Loads `path`, returning the defaults when the file does not exist.
///
/// # Errors
///
/// [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] for malformed TOML.
pub fn load_config(path: &Path) -> Result<FileConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let cfg: FileConfig = toml::from_str("").unwrap();

        assert_eq!(cfg.proxy, ProxySection::default());
        assert_eq!(cfg.proxy.protocol, "default");
        assert_eq!(cfg.proxy.retry_delay_ms, 1000);
        assert_eq!(cfg.proxy.shutdown_timeout_secs, 20);
        assert_eq!(cfg.proxy.log_level, "info");
    }

    #[test]
    fn test_partial_section_overrides_only_given_fields() {
        // Arrange
        let text = r#"
[proxy]
listen_port = 7000
protocol = "videojet"
dispatch = "concurrent"
"#;

        // Act
        let cfg: FileConfig = toml::from_str(text).unwrap();

        // Assert
        assert_eq!(cfg.proxy.listen_port, Some(7000));
        assert_eq!(cfg.proxy.protocol, "videojet");
        assert_eq!(cfg.proxy.dispatch, DispatchMode::Concurrent);
        assert_eq!(cfg.proxy.min_chunk, DEFAULT_MIN_CHUNK);
    }

    #[test]
    fn test_listen_port_selects_listen_mode_with_loopback_fanout() {
        let section = ProxySection {
            listen_port: Some(7000),
            fanout_port: Some(7001),
            host: Some("printer".to_string()),
            port: Some(9100),
            ..ProxySection::default()
        };

        let cfg = section.to_proxy_config().unwrap();

        assert_eq!(
            cfg.mode,
            ProxyMode::Listen {
                listen_addr: "0.0.0.0:7000".parse().unwrap(),
                fanout_addr: Some("127.0.0.1:7001".parse().unwrap()),
            }
        );
    }

    #[test]
    fn test_host_and_port_select_bridge_mode() {
        let section = ProxySection {
            host: Some("printer.local".to_string()),
            port: Some(9100),
            chat_port: Some(7002),
            protocol: "SC500".to_string(),
            retry_delay_ms: 250,
            ..ProxySection::default()
        };

        let cfg = section.to_proxy_config().unwrap();

        assert_eq!(
            cfg.mode,
            ProxyMode::Bridge {
                remote: "printer.local:9100".to_string(),
                chat_addr: Some("127.0.0.1:7002".parse().unwrap()),
            }
        );
        assert_eq!(cfg.protocol, ProtocolKind::Sc500);
        assert_eq!(cfg.retry_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_missing_mode_and_unknown_protocol_are_errors() {
        let nothing = ProxySection::default();
        let bad_protocol = ProxySection {
            listen_port: Some(7000),
            protocol: "zebra".to_string(),
            ..ProxySection::default()
        };

        assert!(matches!(nothing.to_proxy_config(), Err(ConfigError::NoMode)));
        assert!(matches!(
            bad_protocol.to_proxy_config(),
            Err(ConfigError::Protocol(_))
        ));
    }

    #[test]
    fn test_load_config_returns_default_when_file_absent() {
        let path = Path::new("/nonexistent/path/that/cannot/exist/sqlio.toml");

        let cfg = load_config(path).unwrap();

        assert_eq!(cfg, FileConfig::default());
    }

    #[test]
    fn test_load_config_reads_file_and_reports_parse_errors() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("sqlio_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let good = dir.join("good.toml");
        let bad = dir.join("bad.toml");
        std::fs::write(&good, "[proxy]\nchat_port = 7002\n").unwrap();
        std::fs::write(&bad, "[[[ not valid toml").unwrap();

        // Act
        let loaded = load_config(&good);
        let broken = load_config(&bad);

        // Assert
        assert_eq!(loaded.unwrap().proxy.chat_port, Some(7002));
        assert!(matches!(broken, Err(ConfigError::Parse(_))));

        std::fs::remove_dir_all(&dir).ok();
    }
}
