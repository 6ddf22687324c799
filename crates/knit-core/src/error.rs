//! Error types for protocol operations.

use knit_crypto::PeerId;
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Protocol operation errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Candidate protocol lists share no entry.
    #[error("No common protocol")]
    NoCommonProtocol,

    /// Malformed or out-of-order negotiation message.
    #[error("Invalid negotiation message: {0}")]
    InvalidNegotiation(String),

    /// Handshake message or payload field has the wrong shape.
    #[error("Malformed handshake message: {0}")]
    HandshakeFormat(String),

    /// Handshake authentication failed (bad signature or AEAD tag).
    #[error("Handshake authentication failed: {0}")]
    HandshakeAuth(String),

    /// Handshake message processed out of state order.
    #[error("Handshake protocol error: {0}")]
    HandshakeProtocol(String),

    /// Remote identity differs from the one the caller expected.
    #[error("Peer identity mismatch: expected {expected}, got {actual}")]
    PeerIdentityMismatch {
        /// Peer id the caller asked for.
        expected: PeerId,
        /// Peer id the remote proved.
        actual: PeerId,
    },

    /// Sealed chunk failed authentication (possible tampering).
    #[error("Decryption failed: authentication tag mismatch")]
    Decrypt,

    /// Nonce counter reached its maximum value.
    #[error("Nonce space exhausted")]
    NonceExhausted,

    /// Peer opened a stream id it had already used.
    #[error("Duplicate stream id {0}")]
    DuplicateStreamId(u32),

    /// Peer sent more data than the advertised window.
    #[error("Flow control violation on stream {stream_id}")]
    FlowControlViolation {
        /// Offending stream.
        stream_id: u32,
    },

    /// Invalid frame format.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Insufficient data.
    #[error("Insufficient data: need {0} bytes")]
    InsufficientData(usize),

    /// Local concurrent stream limit reached, or stream ids ran out.
    #[error("Too many streams")]
    TooManyStreams,

    /// Write attempted after the local side sent FIN.
    #[error("Write after close")]
    WriteAfterClose,

    /// Stream was reset by either side.
    #[error("Stream reset")]
    StreamReset,

    /// Session is going away; no new streams.
    #[error("Session is going away")]
    GoneAway,

    /// Session has terminated.
    #[error("Session closed: {0}")]
    SessionClosed(CloseReason),

    /// Operation cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation deadline elapsed.
    #[error("Operation timed out")]
    Timeout,

    /// Underlying channel failure.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// Configuration values are inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Cryptographic error.
    #[error("Crypto error: {0}")]
    Crypto(#[from] knit_crypto::Error),
}

/// Coarse error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Protocol selection failed.
    Negotiation,
    /// Handshake failed; the connection must be dropped.
    Handshake,
    /// Secure channel integrity failure.
    Decrypt,
    /// Peer broke the framing or flow control rules.
    ProtocolViolation,
    /// Stream-scoped failure; the session survives.
    StreamLocal,
    /// Session is gone.
    Closed,
    /// Caller cancelled.
    Cancelled,
    /// Deadline elapsed.
    Timeout,
    /// Channel or crypto backend failure.
    Io,
    /// Caller supplied bad configuration.
    Config,
}

impl Error {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NoCommonProtocol | Self::InvalidNegotiation(_) => ErrorCategory::Negotiation,
            Self::HandshakeFormat(_)
            | Self::HandshakeAuth(_)
            | Self::HandshakeProtocol(_)
            | Self::PeerIdentityMismatch { .. } => ErrorCategory::Handshake,
            Self::Decrypt | Self::NonceExhausted => ErrorCategory::Decrypt,
            Self::DuplicateStreamId(_)
            | Self::FlowControlViolation { .. }
            | Self::InvalidFrame(_)
            | Self::InsufficientData(_) => ErrorCategory::ProtocolViolation,
            Self::TooManyStreams | Self::WriteAfterClose | Self::StreamReset | Self::GoneAway => {
                ErrorCategory::StreamLocal
            }
            Self::SessionClosed(_) => ErrorCategory::Closed,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Timeout => ErrorCategory::Timeout,
            Self::Io(_) | Self::Crypto(_) => ErrorCategory::Io,
            Self::InvalidConfig(_) => ErrorCategory::Config,
        }
    }

    /// Whether this error terminates the owning session.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Decrypt | ErrorCategory::ProtocolViolation
        )
    }

    /// GoAway code to report to the peer when this error ends a session.
    pub fn go_away_code(&self) -> GoAwayCode {
        if self.is_session_fatal() {
            GoAwayCode::ProtocolError
        } else {
            GoAwayCode::InternalError
        }
    }
}

impl From<io::Error> for Error {
    /// Unwraps protocol errors that crossed an `AsyncRead`/`AsyncWrite`
    /// boundary; anything else stays an I/O error.
    fn from(err: io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            return Self::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(inner)) => *inner,
            _ => Self::Io(io::ErrorKind::Other.into()),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(inner) => inner,
            other => io::Error::other(other),
        }
    }
}

/// GoAway codes carried in the frame length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GoAwayCode {
    /// Orderly shutdown (0x00).
    Normal = 0x00,
    /// Peer violated the protocol (0x01).
    ProtocolError = 0x01,
    /// Local failure (0x02).
    InternalError = 0x02,
}

impl GoAwayCode {
    /// Convert to wire format.
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// Convert from wire format.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x00 => Some(Self::Normal),
            0x01 => Some(Self::ProtocolError),
            0x02 => Some(Self::InternalError),
            _ => None,
        }
    }
}

impl fmt::Display for GoAwayCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal",
            Self::ProtocolError => "protocol error",
            Self::InternalError => "internal error",
        };
        f.write_str(name)
    }
}

/// Why a session ended. Recorded once, then reported by every operation.
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// Closed or aborted locally.
    Local(GoAwayCode),
    /// Peer sent GoAway.
    Remote(GoAwayCode),
    /// Channel reached end-of-file.
    Eof,
    /// Idle timeout elapsed with no open streams.
    IdleTimeout,
    /// A fatal error ended the session.
    Fatal(Arc<Error>),
}

impl CloseReason {
    /// The error that ended the session, if any.
    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Fatal(err) => Some(err),
            _ => None,
        }
    }

    /// Whether the session ended abnormally: a local failure or a peer
    /// GoAway with an error code. Streams stop delivering buffered data.
    pub fn is_error(&self) -> bool {
        match self {
            Self::Fatal(_) => true,
            Self::Remote(code) => *code != GoAwayCode::Normal,
            Self::Local(_) | Self::Eof | Self::IdleTimeout => false,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(code) => write!(f, "closed locally ({code})"),
            Self::Remote(code) => write!(f, "peer went away ({code})"),
            Self::Eof => f.write_str("connection closed by peer"),
            Self::IdleTimeout => f.write_str("idle timeout"),
            Self::Fatal(err) => write!(f, "{err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_go_away_code_wire_values() {
        for code in [
            GoAwayCode::Normal,
            GoAwayCode::ProtocolError,
            GoAwayCode::InternalError,
        ] {
            assert_eq!(GoAwayCode::from_u32(code.to_u32()), Some(code));
        }
        assert_eq!(GoAwayCode::ProtocolError.to_u32(), 1);
        assert_eq!(GoAwayCode::from_u32(3), None);
    }

    #[test]
    fn test_close_reason_is_error() {
        assert!(CloseReason::Fatal(Arc::new(Error::Decrypt)).is_error());
        assert!(CloseReason::Remote(GoAwayCode::ProtocolError).is_error());
        assert!(CloseReason::Remote(GoAwayCode::InternalError).is_error());
        assert!(!CloseReason::Remote(GoAwayCode::Normal).is_error());
        assert!(!CloseReason::Local(GoAwayCode::Normal).is_error());
        assert!(!CloseReason::Eof.is_error());
        assert!(!CloseReason::IdleTimeout.is_error());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Decrypt.is_session_fatal());
        assert!(Error::DuplicateStreamId(4).is_session_fatal());
        assert!(Error::FlowControlViolation { stream_id: 1 }.is_session_fatal());
        assert!(!Error::StreamReset.is_session_fatal());
        assert!(!Error::TooManyStreams.is_session_fatal());
        assert!(!Error::Timeout.is_session_fatal());
        assert_eq!(Error::HandshakeAuth("sig".into()).category(), ErrorCategory::Handshake);
    }

    #[test]
    fn test_io_roundtrip_preserves_protocol_error() {
        let io_err: io::Error = Error::DuplicateStreamId(4).into();
        match Error::from(io_err) {
            Error::DuplicateStreamId(4) => {}
            other => panic!("Expected DuplicateStreamId, got {other:?}"),
        }
    }

    #[test]
    fn test_plain_io_error_stays_io() {
        let err = Error::from(io::Error::from(io::ErrorKind::BrokenPipe));
        match err {
            Error::Io(inner) => assert_eq!(inner.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("Expected Io, got {other:?}"),
        }
    }

    #[test]
    fn test_io_error_unwraps_without_double_wrap() {
        let original = io::Error::from(io::ErrorKind::UnexpectedEof);
        let back: io::Error = Error::Io(original).into();
        assert_eq!(back.kind(), io::ErrorKind::UnexpectedEof);
        assert!(back.get_ref().is_none());
    }

    #[test]
    fn test_close_reason_reports_error() {
        let reason = CloseReason::Fatal(Arc::new(Error::Decrypt));
        assert!(matches!(reason.error(), Some(Error::Decrypt)));
        assert!(CloseReason::Eof.error().is_none());
        assert!(reason.to_string().contains("Decryption failed"));
    }
}
