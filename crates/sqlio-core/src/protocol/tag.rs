//! Tag-delimited XML framer.
//!
//! Messages are XML documents whose root element is `msg`:
//!
//! ```text
//! garbage</msg><msg id="1">payload</msg><msg id="2">...
//!        ^^^^^^ no start tag in front: skipped
//!              |<------ message ------>|
//! ```
//!
//! The framer finds the first end tag, then looks for the first start tag in
//! the span before it.  The message is the start tag through the end tag.  An
//! end tag with nothing opening it is stepped over and scanning resumes
//! behind it, so leading garbage never produces a message.

use crate::protocol::framer::{Extraction, Frame, Framer, FramingError, SkipReason};
use crate::protocol::scan::find_sequence;
use crate::protocol::xml::XmlElement;

/// Start of a message element (matches `<msg>` and `<msg attr=...>`).
pub const START_TAG: &[u8] = b"<msg";

/// End of a message element.
pub const END_TAG: &[u8] = b"</msg>";

/// Framer for `<msg ...>...</msg>` protocols.
#[derive(Debug, Clone)]
pub struct TagFramer {
    start: Vec<u8>,
    end: Vec<u8>,
}

impl Default for TagFramer {
    fn default() -> Self {
        Self::new(START_TAG, END_TAG)
    }
}

impl TagFramer {
    /// Creates a framer with custom start and end markers.
    pub fn new(start: &[u8], end: &[u8]) -> Self {
        Self {
            start: start.to_vec(),
            end: end.to_vec(),
        }
    }

    fn parse(bytes: &[u8]) -> Result<XmlElement, FramingError> {
        let text =
            std::str::from_utf8(bytes).map_err(|e| FramingError::InvalidUtf8(e.to_string()))?;
        Ok(XmlElement::parse(text)?)
    }
}

impl Framer for TagFramer {
    fn try_extract(&self, buf: &[u8]) -> Result<Option<Extraction>, FramingError> {
        self.try_extract_from(buf, 0)
    }

    fn try_extract_from(
        &self,
        buf: &[u8],
        scanned: usize,
    ) -> Result<Option<Extraction>, FramingError> {
        let mut from = 0;
        let mut search = scanned.min(buf.len());
        loop {
            let Some(offset) = find_sequence(&buf[search..], &self.end) else {
                // Everything up to `from` was orphaned end tags and garbage.
                if from > 0 {
                    return Ok(Some(Extraction::skipped(SkipReason::MissingStartTag, from)));
                }
                return Ok(None);
            };
            let end_tag_at = search + offset;
            let end = end_tag_at + self.end.len();

            match find_sequence(&buf[from..end_tag_at], &self.start) {
                Some(start_offset) => {
                    let start = from + start_offset;
                    let bytes = &buf[start..end];
                    let document = Self::parse(bytes)?;
                    return Ok(Some(Extraction::message(
                        Frame::xml(bytes.to_vec(), document),
                        end,
                    )));
                }
                None => {
                    from = end;
                    search = end;
                }
            }
        }
    }

    /// An end tag may straddle the end of `buf`, so its first bytes are
    /// searched again.
    fn resume_from(&self, buf: &[u8]) -> usize {
        buf.len().saturating_sub(self.end.len().saturating_sub(1))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
