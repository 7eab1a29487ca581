//! The accumulator between the socket and the framer.
//!
//! # How it is used
//!
//! A session read loop alternates between two calls:
//!
//! 1. [`FrameBuffer::write_target`] hands out the buffer with at least
//!    `min_chunk` bytes of spare capacity; the loop reads straight into it.
//! 2. [`FrameBuffer::drain`] runs the framer greedily over everything buffered
//!    and removes each consumed prefix.  Whatever the framer could not use yet
//!    (half a line, an open `<msg>` element) stays for the next read.
//!
//! When the peer closes the stream, [`FrameBuffer::finish`] gives the framer a
//! last chance to flush and reports any bytes still left as
//! [`FramingError::Incomplete`].
//!
//! Growth is bounded: if the pending bytes exceed `max_len` after a drain, the
//! peer is sending something the framer will never accept and
//! [`FramingError::Oversized`] is returned.

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::protocol::framer::{Framer, FramingError, Outcome};

/// Spare capacity guaranteed before every read.
pub const DEFAULT_MIN_CHUNK: usize = 512;

/// Pending bytes allowed without a complete frame (1 MiB).
pub const DEFAULT_MAX_BUFFER: usize = 1024 * 1024;

/// Byte accumulator feeding a [`Framer`].
#[derive(Debug)]
pub struct FrameBuffer {
    inner: BytesMut,
    /// Leading bytes the framer already searched without finding a unit.
    scanned: usize,
    min_chunk: usize,
    max_len: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_CHUNK, DEFAULT_MAX_BUFFER)
    }
}

impl FrameBuffer {
    /// Creates an empty buffer.  A `min_chunk` of zero is raised to one so
    /// reads always have room to make progress.
    pub fn new(min_chunk: usize, max_len: usize) -> Self {
        let min_chunk = min_chunk.max(1);
        Self {
            inner: BytesMut::with_capacity(min_chunk),
            scanned: 0,
            min_chunk,
            max_len,
        }
    }

    /// Reserves at least `min_chunk` spare bytes and returns the buffer to
    /// read into.  New bytes must be appended, never inserted.
    pub fn write_target(&mut self) -> &mut BytesMut {
        self.inner.reserve(self.min_chunk);
        &mut self.inner
    }

    /// Appends bytes that were received elsewhere.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.inner.extend_from_slice(bytes);
    }

    /// Bytes received but not yet consumed by the framer.
    pub fn pending(&self) -> &[u8] {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Extracts every complete unit currently buffered, appending each
    /// outcome to `out` in arrival order.
    ///
    /// # Errors
    ///
    /// Propagates the framer's error for a malformed unit, or returns
    /// [`FramingError::Oversized`] when the leftover exceeds the limit.
    pub fn drain(
        &mut self,
        framer: &dyn Framer,
        out: &mut Vec<Outcome>,
    ) -> Result<(), FramingError> {
        loop {
            let Some(extraction) = framer.try_extract_from(&self.inner, self.scanned)? else {
                self.scanned = framer.resume_from(&self.inner).min(self.inner.len());
                break;
            };
            if extraction.consumed == 0 {
                break;
            }
            self.inner.advance(extraction.consumed.min(self.inner.len()));
            self.scanned = 0;
            trace!(
                "framer consumed {} bytes, {} pending",
                extraction.consumed,
                self.inner.len()
            );
            out.push(extraction.outcome);
        }

        if self.inner.len() > self.max_len {
            return Err(FramingError::Oversized {
                pending: self.inner.len(),
                limit: self.max_len,
            });
        }
        Ok(())
    }

    /// Drains at end of stream, letting the framer flush units that only the
    /// end of stream can terminate.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::Incomplete`] if bytes remain afterwards.  The
    /// outcomes extracted before that point are still appended to `out`.
    pub fn finish(
        &mut self,
        framer: &dyn Framer,
        out: &mut Vec<Outcome>,
    ) -> Result<(), FramingError> {
        loop {
            self.drain(framer, out)?;
            match framer.finish(&self.inner)? {
                Some(extraction) if extraction.consumed > 0 => {
                    self.inner.advance(extraction.consumed.min(self.inner.len()));
                    self.scanned = 0;
                    out.push(extraction.outcome);
                }
                _ => break,
            }
        }

        if self.inner.is_empty() {
            Ok(())
        } else {
            Err(FramingError::Incomplete {
                remaining: self.inner.len(),
            })
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::framer::SkipReason;
    use crate::protocol::line::LineFramer;
    use crate::protocol::tag::TagFramer;

    fn messages(outcomes: &[Outcome]) -> Vec<Vec<u8>> {
        outcomes
            .iter()
            .filter_map(|o| match o {
                Outcome::Message(frame) => Some(frame.bytes.clone()),
                Outcome::Skipped(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_write_target_reserves_min_chunk() {
        let mut buffer = FrameBuffer::new(512, DEFAULT_MAX_BUFFER);
        buffer.extend(b"abc");

        let target = buffer.write_target();

        assert!(target.capacity() - target.len() >= 512);
    }

    #[test]
    fn test_partial_message_stays_buffered_across_reads() {
        // Arrange
        let framer = LineFramer::at_sign();
        let mut buffer = FrameBuffer::default();
        let mut out = Vec::new();

        // Act: first read carries only half the line
        buffer.extend(b"@AB");
        buffer.drain(&framer, &mut out).unwrap();
        let after_first = out.len();
        buffer.extend(b"CD\n@EF\n");
        buffer.drain(&framer, &mut out).unwrap();

        // Assert
        assert_eq!(after_first, 0);
        assert_eq!(messages(&out), vec![b"@ABCD\n".to_vec(), b"@EF\n".to_vec()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_resumes_where_the_last_scan_stopped() {
        // Arrange
        let framer = LineFramer::at_sign();
        let mut buffer = FrameBuffer::default();
        let mut out = Vec::new();

        // Act: a long line arrives one byte at a time, CR and LF split apart
        for byte in b"@0123456789" {
            buffer.extend(&[*byte]);
            buffer.drain(&framer, &mut out).unwrap();
        }
        let scanned_before_cr = buffer.scanned;
        buffer.extend(b"\r");
        buffer.drain(&framer, &mut out).unwrap();
        let scanned_at_cr = buffer.scanned;
        buffer.extend(b"\n@X\n");
        buffer.drain(&framer, &mut out).unwrap();

        // Assert
        assert_eq!(scanned_before_cr, 11);
        assert_eq!(scanned_at_cr, 11, "the held carriage return is searched again");
        assert_eq!(
            messages(&out),
            vec![b"@0123456789\r\n".to_vec(), b"@X\n".to_vec()]
        );
        assert_eq!(buffer.scanned, 0);
    }

    #[test]
    fn test_drain_finds_end_tag_split_across_reads() {
        let framer = TagFramer::default();
        let mut buffer = FrameBuffer::default();
        let mut out = Vec::new();

        buffer.extend(b"<msg>payload</ms");
        buffer.drain(&framer, &mut out).unwrap();
        let scanned = buffer.scanned;
        buffer.extend(b"g>");
        buffer.drain(&framer, &mut out).unwrap();

        assert_eq!(scanned, 16 - 5);
        assert_eq!(messages(&out), vec![b"<msg>payload</msg>".to_vec()]);
    }

    #[test]
    fn test_drain_reports_skipped_lines_in_order() {
        let framer = LineFramer::at_sign();
        let mut buffer = FrameBuffer::default();
        let mut out = Vec::new();

        buffer.extend(b"noise\n@A\n");
        buffer.drain(&framer, &mut out).unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Outcome::Skipped(SkipReason::MarkerNotFound));
        assert!(matches!(out[1], Outcome::Message(_)));
    }

    #[test]
    fn test_finish_reports_incomplete_trailing_message() {
        // Arrange
        let framer = LineFramer::at_sign();
        let mut buffer = FrameBuffer::default();
        let mut out = Vec::new();
        buffer.extend(b"@A\n@unterminated");

        // Act
        let result = buffer.finish(&framer, &mut out);

        // Assert
        assert_eq!(result, Err(FramingError::Incomplete { remaining: 13 }));
        assert_eq!(messages(&out), vec![b"@A\n".to_vec()]);
    }

    #[test]
    fn test_finish_flushes_trailing_carriage_return_line() {
        let framer = LineFramer::at_sign();
        let mut buffer = FrameBuffer::default();
        let mut out = Vec::new();
        buffer.extend(b"@A\r");

        buffer.finish(&framer, &mut out).unwrap();

        assert_eq!(messages(&out), vec![b"@A\r".to_vec()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_finish_on_empty_buffer_is_clean() {
        let mut buffer = FrameBuffer::default();
        let mut out = Vec::new();

        assert_eq!(buffer.finish(&TagFramer::default(), &mut out), Ok(()));
        assert!(out.is_empty());
    }

    #[test]
    fn test_oversized_pending_bytes_are_rejected() {
        let framer = LineFramer::at_sign();
        let mut buffer = FrameBuffer::new(4, 8);
        let mut out = Vec::new();
        buffer.extend(b"@0123456789");

        let result = buffer.drain(&framer, &mut out);

        assert_eq!(
            result,
            Err(FramingError::Oversized {
                pending: 11,
                limit: 8
            })
        );
    }

    #[test]
    fn test_limit_applies_to_leftover_not_to_whole_read() {
        // A large read made of complete lines drains fully and is fine.
        let framer = LineFramer::at_sign();
        let mut buffer = FrameBuffer::new(4, 8);
        let mut out = Vec::new();
        buffer.extend(b"@0123456789\n@abcdefgh\n");

        buffer.drain(&framer, &mut out).unwrap();

        assert_eq!(out.len(), 2);
    }
}
