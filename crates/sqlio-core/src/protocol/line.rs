//! Newline-delimited framers.
//!
//! Both framers in this module share the same line scan: a line ends at the
//! first carriage return or line feed.  A carriage return immediately
//! followed by a line feed counts as one terminator, so `"@ABC\r\n"` is one
//! line and not a line plus an empty one.  Because the line feed may still be
//! in flight, a carriage return that is the last buffered byte holds the line
//! back until the next byte arrives (or, via [`Framer::finish`], until the
//! stream ends).
//!
//! ```text
//! buffer:  x x @ A B C D \r \n | x x ...
//!          |<-- content -->|<term>|
//!              ^ marker
//! message:     @ A B C D \r \n
//! ```

use crate::protocol::framer::{Extraction, Frame, Framer, FramingError, SkipReason};
use crate::protocol::scan::{find_any, find_sequence};

const TERMINATORS: &[u8] = b"\r\n";

/// Marker byte that opens a message in the default device protocol.
pub const AT_MARKER: u8 = b'@';

/// Marker sequence that opens a message in the videojet binary protocol.
pub const VIDEOJET_MARKER: [u8; 4] = [b'$', b'!', 0x06, 0x15];

/// Location of a complete line at the front of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Line {
    /// Index where the terminator starts (the content length).
    content_end: usize,
    /// Index just past the terminator (the bytes consumed).
    end: usize,
}

/// Finds the first complete line, searching for the terminator from `from`
/// (everything before it is known to hold none).  `at_eof` allows a trailing
/// carriage return to terminate a line without waiting for a possible line
/// feed.
fn scan_line(buf: &[u8], from: usize, at_eof: bool) -> Option<Line> {
    let from = from.min(buf.len());
    let content_end = from + find_any(&buf[from..], TERMINATORS)?;
    if buf[content_end] == b'\n' {
        return Some(Line {
            content_end,
            end: content_end + 1,
        });
    }
    match buf.get(content_end + 1) {
        Some(b'\n') => Some(Line {
            content_end,
            end: content_end + 2,
        }),
        Some(_) => Some(Line {
            content_end,
            end: content_end + 1,
        }),
        None if at_eof => Some(Line {
            content_end,
            end: content_end + 1,
        }),
        None => None,
    }
}

/// Where the next scan may start after [`scan_line`] found nothing: the end
/// of `buf`, or the held-back carriage return.
fn line_resume(buf: &[u8]) -> usize {
    match buf.last() {
        Some(b'\r') => buf.len() - 1,
        _ => buf.len(),
    }
}

/// Newline-delimited framer, optionally anchored on a single marker byte.
///
/// Without a marker every non-blank line is a message, terminator included.
/// With a marker, the message starts at the first marker byte in the line;
/// lines without the marker are dropped as [`SkipReason::MarkerNotFound`] and
/// lines where nothing follows the marker are dropped as
/// [`SkipReason::EmptyPayload`].
///
/// A device that ends a request with a bare `\r` and then goes quiet waiting
/// for an answer is not served: the line stays buffered until the next byte
/// or the end of the stream.  Such devices need `\r\n` or `\n`.
#[derive(Debug, Clone, Default)]
pub struct LineFramer {
    marker: Option<u8>,
}

impl LineFramer {
    /// A framer that forwards whole lines.
    pub fn plain() -> Self {
        Self { marker: None }
    }

    /// A framer that forwards each line from `marker` onward.
    pub fn with_marker(marker: u8) -> Self {
        Self {
            marker: Some(marker),
        }
    }

    /// The framer used by the default protocol (`@` marker).
    pub fn at_sign() -> Self {
        Self::with_marker(AT_MARKER)
    }

    fn process(&self, buf: &[u8], line: Line) -> Extraction {
        let content = &buf[..line.content_end];
        let start = match self.marker {
            None if content.is_empty() => {
                return Extraction::skipped(SkipReason::EmptyPayload, line.end);
            }
            None => 0,
            Some(marker) => match content.iter().position(|&b| b == marker) {
                Some(pos) => pos,
                None => return Extraction::skipped(SkipReason::MarkerNotFound, line.end),
            },
        };
        if self.marker.is_some() && start + 1 == content.len() {
            return Extraction::skipped(SkipReason::EmptyPayload, line.end);
        }
        Extraction::message(Frame::raw(buf[start..line.end].to_vec()), line.end)
    }
}

impl Framer for LineFramer {
    fn try_extract(&self, buf: &[u8]) -> Result<Option<Extraction>, FramingError> {
        self.try_extract_from(buf, 0)
    }

    fn try_extract_from(
        &self,
        buf: &[u8],
        scanned: usize,
    ) -> Result<Option<Extraction>, FramingError> {
        Ok(scan_line(buf, scanned, false).map(|line| self.process(buf, line)))
    }

    fn resume_from(&self, buf: &[u8]) -> usize {
        line_resume(buf)
    }

    fn finish(&self, buf: &[u8]) -> Result<Option<Extraction>, FramingError> {
        Ok(scan_line(buf, 0, true).map(|line| self.process(buf, line)))
    }
}

/// Newline-delimited framer whose payload starts at a multi-byte marker.
///
/// After a line is isolated, the line is scanned forward for the marker
/// sequence; only the marker onward (terminator included) is forwarded.
#[derive(Debug, Clone)]
pub struct MarkerPrefixedFramer {
    marker: Vec<u8>,
}

impl MarkerPrefixedFramer {
    /// Creates a framer for an arbitrary non-empty marker sequence.
    pub fn new(marker: impl Into<Vec<u8>>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    /// The framer used by the videojet protocol.
    pub fn videojet() -> Self {
        Self::new(VIDEOJET_MARKER.to_vec())
    }

    fn process(&self, buf: &[u8], line: Line) -> Extraction {
        let content = &buf[..line.content_end];
        let Some(start) = find_sequence(content, &self.marker) else {
            return Extraction::skipped(SkipReason::MarkerNotFound, line.end);
        };
        if start + self.marker.len() == content.len() {
            return Extraction::skipped(SkipReason::EmptyPayload, line.end);
        }
        Extraction::message(Frame::raw(buf[start..line.end].to_vec()), line.end)
    }
}

impl Framer for MarkerPrefixedFramer {
    fn try_extract(&self, buf: &[u8]) -> Result<Option<Extraction>, FramingError> {
        self.try_extract_from(buf, 0)
    }

    fn try_extract_from(
        &self,
        buf: &[u8],
        scanned: usize,
    ) -> Result<Option<Extraction>, FramingError> {
        Ok(scan_line(buf, scanned, false).map(|line| self.process(buf, line)))
    }

    fn resume_from(&self, buf: &[u8]) -> usize {
        line_resume(buf)
    }

    fn finish(&self, buf: &[u8]) -> Result<Option<Extraction>, FramingError> {
        Ok(scan_line(buf, 0, true).map(|line| self.process(buf, line)))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::framer::Outcome;

    fn message_bytes(extraction: &Extraction) -> &[u8] {
        match &extraction.outcome {
            Outcome::Message(frame) => &frame.bytes,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[test]
    fn test_at_sign_framer_strips_leading_noise_and_keeps_crlf() {
        // Arrange
        let framer = LineFramer::at_sign();

        // Act
        let extraction = framer.try_extract(b"xx@ABCD\r\n").unwrap().unwrap();

        // Assert
        assert_eq!(message_bytes(&extraction), b"@ABCD\r\n");
        assert_eq!(extraction.consumed, 9);
    }

    #[test]
    fn test_plain_framer_splits_on_line_feed() {
        let framer = LineFramer::plain();

        let extraction = framer.try_extract(b"one\ntwo\n").unwrap().unwrap();

        assert_eq!(message_bytes(&extraction), b"one\n");
        assert_eq!(extraction.consumed, 4);
    }

    #[test]
    fn test_plain_framer_splits_on_bare_carriage_return() {
        let framer = LineFramer::plain();

        let extraction = framer.try_extract(b"one\rtwo").unwrap().unwrap();

        assert_eq!(message_bytes(&extraction), b"one\r");
        assert_eq!(extraction.consumed, 4);
    }

    #[test]
    fn test_trailing_carriage_return_waits_for_possible_line_feed() {
        let framer = LineFramer::at_sign();

        assert_eq!(framer.try_extract(b"@AB\r").unwrap(), None);
    }

    #[test]
    fn test_finish_flushes_line_ended_by_trailing_carriage_return() {
        let framer = LineFramer::at_sign();

        let extraction = framer.finish(b"@AB\r").unwrap().unwrap();

        assert_eq!(message_bytes(&extraction), b"@AB\r");
        assert_eq!(extraction.consumed, 4);
    }

    #[test]
    fn test_finish_without_terminator_returns_none() {
        let framer = LineFramer::at_sign();
        assert_eq!(framer.finish(b"@AB").unwrap(), None);
    }

    #[test]
    fn test_line_without_marker_is_skipped_as_marker_not_found() {
        let framer = LineFramer::at_sign();

        let extraction = framer.try_extract(b"noise\n@A\n").unwrap().unwrap();

        assert_eq!(
            extraction.outcome,
            Outcome::Skipped(SkipReason::MarkerNotFound)
        );
        assert_eq!(extraction.consumed, 6);
    }

    #[test]
    fn test_marker_with_nothing_after_it_is_skipped_as_empty() {
        let framer = LineFramer::at_sign();

        let extraction = framer.try_extract(b"xx@\r\n").unwrap().unwrap();

        assert_eq!(extraction.outcome, Outcome::Skipped(SkipReason::EmptyPayload));
        assert_eq!(extraction.consumed, 5);
    }

    #[test]
    fn test_blank_line_is_skipped_by_plain_framer() {
        let framer = LineFramer::plain();

        let extraction = framer.try_extract(b"\n").unwrap().unwrap();

        assert_eq!(extraction.outcome, Outcome::Skipped(SkipReason::EmptyPayload));
    }

    #[test]
    fn test_no_terminator_is_idempotently_none() {
        // Repeated attempts against an unterminated buffer must never consume.
        let framer = LineFramer::at_sign();
        let buf = b"@partial message";

        for _ in 0..5 {
            assert_eq!(framer.try_extract(buf).unwrap(), None);
        }
    }

    #[test]
    fn test_videojet_framer_forwards_from_marker_onward() {
        // Arrange
        let framer = MarkerPrefixedFramer::videojet();
        let mut input = b"junk".to_vec();
        input.extend_from_slice(&VIDEOJET_MARKER);
        input.extend_from_slice(b"DATA\r\n");

        // Act
        let extraction = framer.try_extract(&input).unwrap().unwrap();

        // Assert
        let mut expected = VIDEOJET_MARKER.to_vec();
        expected.extend_from_slice(b"DATA\r\n");
        assert_eq!(message_bytes(&extraction), expected.as_slice());
        assert_eq!(extraction.consumed, input.len());
    }

    #[test]
    fn test_videojet_framer_requires_whole_marker_sequence() {
        // Only the first two marker bytes are present.
        let framer = MarkerPrefixedFramer::videojet();

        let extraction = framer.try_extract(b"$!DATA\n").unwrap().unwrap();

        assert_eq!(
            extraction.outcome,
            Outcome::Skipped(SkipReason::MarkerNotFound)
        );
    }

    #[test]
    fn test_videojet_marker_at_end_of_line_is_skipped_as_empty() {
        let framer = MarkerPrefixedFramer::videojet();
        let mut input = VIDEOJET_MARKER.to_vec();
        input.push(b'\n');

        let extraction = framer.try_extract(&input).unwrap().unwrap();

        assert_eq!(extraction.outcome, Outcome::Skipped(SkipReason::EmptyPayload));
    }

    #[test]
    fn test_lone_carriage_return_waits_for_the_next_byte() {
        let framer = LineFramer::at_sign();

        let held = framer.try_extract(b"@A\r").unwrap();
        let flushed = framer.finish(b"@A\r").unwrap().unwrap();

        assert_eq!(held, None);
        assert_eq!(framer.resume_from(b"@A\r"), 2);
        assert_eq!(message_bytes(&flushed), b"@A\r");
    }

    #[test]
    fn test_resumed_scan_finds_the_same_line() {
        // Arrange: the first four bytes were searched before and hold no terminator
        let framer = MarkerPrefixedFramer::videojet();
        let input = b"xx$!\x06\x15A\r\n";

        // Act
        let resumed = framer.try_extract_from(input, 4).unwrap().unwrap();
        let full = framer.try_extract(input).unwrap().unwrap();

        // Assert
        assert_eq!(resumed, full);
        assert_eq!(message_bytes(&resumed), b"$!\x06\x15A\r\n");
    }
}
