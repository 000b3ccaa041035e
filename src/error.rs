//! Error types shared across the codec, engine, and driver.

use std::fmt;
use std::io;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying transport
    Io(io::Error),
    /// Invalid WebSocket frame on the wire
    InvalidFrame(&'static str),
    /// Invalid UTF-8 in a text message or close reason
    InvalidUtf8,
    /// Protocol violation (RFC 6455 framing rules)
    Protocol(&'static str),
    /// Malformed HTTP in the upgrade exchange
    InvalidHttp(&'static str),
    /// Upgrade request/response failed validation
    HandshakeFailed(&'static str),
    /// Connection closed by the peer
    ConnectionClosed,
    /// Connection reset by peer
    ConnectionReset,
    /// Would block (nonblocking I/O)
    WouldBlock,
    /// Operation not valid in the current connection phase
    InvalidState(&'static str),
    /// Close code outside the sendable set
    InvalidCloseCode(u16),
}

/// Close frame code and reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (endpoint shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received (local use only)
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure (local use only)
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension missing
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check whether a close code may legally appear on the wire.
    ///
    /// Covers the RFC 6455 defined codes minus the local-use-only ones
    /// (1005, 1006, 1015), plus the private range 3000-4999.
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            Error::InvalidUtf8 => write!(f, "Invalid UTF-8 in text payload"),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::InvalidHttp(msg) => write!(f, "Invalid HTTP: {}", msg),
            Error::HandshakeFailed(msg) => write!(f, "Handshake failed: {}", msg),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::ConnectionReset => write!(f, "Connection reset by peer"),
            Error::WouldBlock => write!(f, "Would block"),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidCloseCode(code) => write!(f, "Invalid close code: {}", code),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}
