//! Protocol module containing the frame accumulator, the framers, and the
//! XML message model.

pub mod buffer;
pub mod framer;
pub mod kind;
pub mod line;
mod scan;
pub mod tag;
pub mod xml;

pub use buffer::FrameBuffer;
pub use framer::{Extraction, Frame, Framer, FramingError, Outcome, SkipReason};
pub use kind::ProtocolKind;
