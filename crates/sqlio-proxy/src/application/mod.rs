//! Application layer for sqlio-proxy.
//!
//! Everything that decides *what happens to a message*, independent of how
//! bytes get on and off the wire.
//!
//! - [`packet`] – the connection handle and the packet passed to handlers.
//! - [`pipeline`] – ordered handler chains built from layers.
//! - [`fanout`] – the fanout registry and its pipeline layer.
//! - [`bridge_state`] – the remote/chat slots of a bridge and the chat relay
//!   layer.
//! - [`persistence`] – the pluggable packet store and its pipeline layer.

pub mod bridge_state;
pub mod fanout;
pub mod packet;
pub mod persistence;
pub mod pipeline;

pub use bridge_state::{chat_relay_layer, BridgeState};
pub use fanout::{fanout_layer, FanoutRegistry};
pub use packet::{BoxedWriter, Connection, Packet};
pub use persistence::{persistence_layer, PacketStore, StoreError, StoreOptions, StoreRequest};
pub use pipeline::{Handler, HandlerError, PipelineBuilder};
