//! sqlio-proxy library crate.
//!
//! This crate is the TCP front-end that sits between industrial marking
//! devices and everything that wants to talk to them.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Devices (raw TCP, ad-hoc framing)
//!         ↕
//! [sqlio-proxy]
//!   ├── domain/           Pure types: ProxyConfig, DispatchMode, BridgeStatus
//!   ├── application/      Packet model, handler pipeline, fanout registry,
//!   │                     bridge slots, pluggable packet store
//!   └── infrastructure/
//!         ├── session/    Read loop: socket → FrameBuffer → Framer → pipeline
//!         ├── server/     ConnectionServer: start/stop around an accept loop
//!         ├── listeners/  Device, fanout, and chat accept handlers
//!         ├── bridge/     BridgeSupervisor: reconnecting outbound device leg
//!         ├── proxy/      Wiring for the proxy command
//!         ├── client/     One-shot "send and wait for a reply" transport
//!         └── config_file/ TOML configuration file
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` and `sqlio-core`; it only touches
//!   sockets through the [`application::packet::Connection`] write half.
//! - `infrastructure` owns listeners, read loops, timers, and dialing.

/// Domain layer: configuration and state types (no I/O).
pub mod domain;

/// Application layer: packets, pipelines, fanout, bridge state, persistence.
pub mod application;

/// Infrastructure layer: sockets, read loops, servers, and the bridge.
pub mod infrastructure;
