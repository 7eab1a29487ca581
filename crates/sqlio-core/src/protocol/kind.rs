//! Protocol selection by name.
//!
//! The command line names a protocol (`default`, `videojet`, `sc500`); this
//! module maps that name to the framer that understands it.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::protocol::framer::Framer;
use crate::protocol::line::{LineFramer, MarkerPrefixedFramer};
use crate::protocol::tag::TagFramer;

/// Returned when a protocol name is not recognised.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown protocol '{0}' (expected one of: default, videojet, sc500)")]
pub struct UnknownProtocol(pub String);

/// The device protocols understood by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum ProtocolKind {
    /// Newline-delimited, payload starts at `@`.
    #[default]
    Default,
    /// Newline-delimited, payload starts at the `$ ! ACK NAK` marker.
    Videojet,
    /// `<msg ...>...</msg>` XML documents.
    Sc500,
}

impl ProtocolKind {
    /// Every supported protocol, in display order.
    pub const ALL: [ProtocolKind; 3] = [
        ProtocolKind::Default,
        ProtocolKind::Videojet,
        ProtocolKind::Sc500,
    ];

    /// The lowercase name used on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolKind::Default => "default",
            ProtocolKind::Videojet => "videojet",
            ProtocolKind::Sc500 => "sc500",
        }
    }

    /// Builds a fresh framer for this protocol.
    pub fn framer(&self) -> Box<dyn Framer> {
        match self {
            ProtocolKind::Default => Box::new(LineFramer::at_sign()),
            ProtocolKind::Videojet => Box::new(MarkerPrefixedFramer::videojet()),
            ProtocolKind::Sc500 => Box::new(TagFramer::default()),
        }
    }

    /// Whether payloads of this protocol are text (shown and entered as UTF-8
    /// instead of hex).
    pub fn is_text(&self) -> bool {
        matches!(self, ProtocolKind::Sc500)
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProtocolKind {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownProtocol(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::framer::Outcome;

    #[test]
    fn test_names_parse_case_insensitively() {
        assert_eq!("default".parse(), Ok(ProtocolKind::Default));
        assert_eq!("VideoJet".parse(), Ok(ProtocolKind::Videojet));
        assert_eq!("SC500".parse(), Ok(ProtocolKind::Sc500));
    }

    #[test]
    fn test_unknown_name_is_rejected() {
        let result: Result<ProtocolKind, _> = "zebra".parse();
        assert_eq!(result, Err(UnknownProtocol("zebra".to_string())));
    }

    #[test]
    fn test_display_round_trips_through_from_str() {
        for kind in ProtocolKind::ALL {
            assert_eq!(kind.to_string().parse(), Ok(kind));
        }
    }

    #[test]
    fn test_default_protocol_framer_uses_at_marker() {
        // Arrange
        let framer = ProtocolKind::Default.framer();

        // Act
        let extraction = framer.try_extract(b"xx@ABCD\r\n").unwrap().unwrap();

        // Assert
        assert!(matches!(
            extraction.outcome,
            Outcome::Message(ref frame) if frame.bytes == b"@ABCD\r\n"
        ));
    }

    #[test]
    fn test_only_sc500_is_text() {
        assert!(ProtocolKind::Sc500.is_text());
        assert!(!ProtocolKind::Default.is_text());
        assert!(!ProtocolKind::Videojet.is_text());
    }
}
