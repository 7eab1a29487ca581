//! Infrastructure layer for sqlio-proxy.
//!
//! Everything that touches sockets, tasks, or timers:
//!
//! - [`session`] – the per-connection read loop and message dispatch.
//! - [`server`] – `ConnectionServer`, a listener with start/stop.
//! - [`listeners`] – accept handlers for device, fanout, and chat peers.
//! - [`bridge`] – `BridgeSupervisor` and the outbound `Dialer` seam.
//! - [`proxy`] – assembles the above for the `proxy` command.
//! - [`client`] – the one-shot `client` command.
//! - [`config_file`] – the optional TOML configuration file.

pub mod bridge;
pub mod client;
pub mod config_file;
pub mod listeners;
pub mod proxy;
pub mod server;
pub mod session;
