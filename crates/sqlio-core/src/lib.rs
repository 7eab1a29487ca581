//! # sqlio-core
//!
//! Shared library for SQLIO containing the stream framers, the frame
//! accumulator, the XML message model, and protocol selection.
//!
//! This crate has zero dependencies on sockets, async runtimes, or tasks.
//! Everything here operates on plain byte slices so it can be exercised
//! deterministically in unit and property tests.
//!
//! # Architecture overview
//!
//! Industrial marking devices (line printers, inkjet coders, label
//! applicators) talk over raw TCP using ad-hoc protocols.  None of them use
//! length prefixes: a message is delimited purely by sentinel bytes.  This
//! crate provides:
//!
//! - **`protocol::buffer`** – [`FrameBuffer`], the accumulator that sits
//!   between "bytes arrived on the socket" and "a message is complete".
//!
//! - **`protocol::framer`** – the [`Framer`] contract plus the three framing
//!   state machines: newline-delimited ([`LineFramer`]), binary marker inside a
//!   line ([`MarkerPrefixedFramer`]), and tag-delimited XML ([`TagFramer`]).
//!
//! - **`protocol::xml`** – an owned XML element tree produced for
//!   tag-delimited protocols.
//!
//! - **`protocol::kind`** – [`ProtocolKind`], the name → framer mapping used by
//!   the command line (`default`, `videojet`, `sc500`).

pub mod protocol;

pub use protocol::buffer::{FrameBuffer, DEFAULT_MAX_BUFFER, DEFAULT_MIN_CHUNK};
pub use protocol::framer::{Extraction, Frame, Framer, FramingError, Outcome, SkipReason};
pub use protocol::kind::{ProtocolKind, UnknownProtocol};
pub use protocol::line::{LineFramer, MarkerPrefixedFramer};
pub use protocol::tag::TagFramer;
pub use protocol::xml::{XmlElement, XmlError, XmlNode};

/// Renders a payload for log output.
///
/// Printable ASCII is kept as-is; `\r`, `\n`, and every other control or
/// non-ASCII byte is escaped, so a binary payload never corrupts a log line.
///
/// ```rust
/// assert_eq!(sqlio_core::display_payload(b"@ABC\r\n"), "@ABC\\r\\n");
/// ```
pub fn display_payload(bytes: &[u8]) -> String {
    bytes.escape_ascii().to_string()
}
