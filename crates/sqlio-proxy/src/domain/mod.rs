//! Domain layer for sqlio-proxy.
//!
//! Plain data types shared by the application and infrastructure layers.
//! Nothing here performs I/O.

pub mod config;

pub use config::{BridgeStatus, ClientConfig, DispatchMode, ProxyConfig, ProxyMode, SessionOptions};
