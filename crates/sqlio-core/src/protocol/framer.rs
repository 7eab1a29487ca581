//! The framing contract shared by every device protocol.
//!
//! A [`Framer`] is a pure state machine: given the bytes accumulated so far it
//! either locates the next complete unit (and reports how many bytes that
//! unit consumed) or reports that more bytes are needed.  The caller invokes
//! it repeatedly until it returns `Ok(None)`, i.e. extraction is greedy.
//!
//! A located unit is not always a message.  Line-based protocols frequently
//! carry noise lines that lack the protocol's marker; those lines are still
//! consumed (so the buffer makes progress) but are reported as
//! [`Outcome::Skipped`] instead of being forwarded.

use thiserror::Error;

use crate::protocol::xml::{XmlElement, XmlError};

/// Errors raised while framing a byte stream.
#[derive(Debug, Error, PartialEq)]
pub enum FramingError {
    /// The stream ended while bytes of an unterminated message were buffered.
    #[error("stream ended with {remaining} bytes of an incomplete message")]
    Incomplete { remaining: usize },

    /// The buffer grew past its limit without yielding a single frame.
    #[error("buffer holds {pending} bytes without a complete frame (limit {limit})")]
    Oversized { pending: usize, limit: usize },

    /// A tag-delimited message was not valid UTF-8.
    #[error("message is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    /// A tag-delimited message was not a well-formed XML document.
    #[error("malformed XML message: {0}")]
    Xml(#[from] XmlError),
}

/// Why a located unit was consumed without producing a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The protocol's marker does not occur in the line.
    MarkerNotFound,
    /// The marker was found but nothing follows it before the terminator.
    EmptyPayload,
    /// An end tag was found with no start tag in front of it.
    MissingStartTag,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SkipReason::MarkerNotFound => "marker not found",
            SkipReason::EmptyPayload => "empty payload after marker",
            SkipReason::MissingStartTag => "end tag without start tag",
        };
        f.write_str(text)
    }
}

/// One complete application message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// The message bytes exactly as they appeared on the wire.
    pub bytes: Vec<u8>,
    /// Parsed document, present only for tag-delimited protocols.
    pub xml: Option<XmlElement>,
}

impl Frame {
    /// Creates a frame for a binary or line protocol.
    pub fn raw(bytes: Vec<u8>) -> Self {
        Self { bytes, xml: None }
    }

    /// Creates a frame carrying a parsed XML document.
    pub fn xml(bytes: Vec<u8>, document: XmlElement) -> Self {
        Self {
            bytes,
            xml: Some(document),
        }
    }
}

/// What a consumed unit turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A message to hand to the pipeline.
    Message(Frame),
    /// A unit that was consumed and dropped.
    Skipped(SkipReason),
}

/// The result of one successful extraction step.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub outcome: Outcome,
    /// Number of bytes at the front of the buffer this step consumed.  Always
    /// greater than zero.
    pub consumed: usize,
}

impl Extraction {
    pub(crate) fn message(frame: Frame, consumed: usize) -> Self {
        Self {
            outcome: Outcome::Message(frame),
            consumed,
        }
    }

    pub(crate) fn skipped(reason: SkipReason, consumed: usize) -> Self {
        Self {
            outcome: Outcome::Skipped(reason),
            consumed,
        }
    }
}

/// Locates complete units in an accumulating byte buffer.
pub trait Framer: Send + Sync {
    /// Attempts to extract the next unit from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete unit; the
    /// caller must then leave `buf` untouched and wait for more bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError`] when a complete unit was located but is
    /// malformed (for example, invalid XML).
    fn try_extract(&self, buf: &[u8]) -> Result<Option<Extraction>, FramingError>;

    /// Like [`Framer::try_extract`], but `buf[..scanned]` was already searched
    /// by an earlier call that returned `Ok(None)`, so the search for a
    /// terminator may start at `scanned`.  Unit boundaries are unchanged.
    ///
    /// The default ignores the hint and scans everything again.
    ///
    /// # Errors
    ///
    /// Same as [`Framer::try_extract`].
    fn try_extract_from(
        &self,
        buf: &[u8],
        scanned: usize,
    ) -> Result<Option<Extraction>, FramingError> {
        let _ = scanned;
        self.try_extract(buf)
    }

    /// After `try_extract` found no complete unit in `buf`, returns how many
    /// leading bytes the next call may skip once more bytes are appended.
    /// Must leave room for a terminator that straddles the end of `buf`.
    fn resume_from(&self, buf: &[u8]) -> usize {
        let _ = buf;
        0
    }

    /// Called once after the stream has ended and `try_extract` returned
    /// `Ok(None)`, giving the framer a chance to flush a unit whose
    /// terminator could only be confirmed by end of stream.
    fn finish(&self, buf: &[u8]) -> Result<Option<Extraction>, FramingError> {
        let _ = buf;
        Ok(None)
    }
}
