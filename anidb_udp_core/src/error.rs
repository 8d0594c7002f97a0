//! Protocol-specific error types
//!
//! This module defines the error types for the UDP protocol layer together
//! with the server return-code taxonomy.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Protocol-specific error types
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Network I/O error
    #[error("network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Per-request deadline expired
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed packet: bad padding, bad DEFLATE stream, or an
    /// unparseable response line
    #[error("protocol framing error: {message}")]
    Framing { message: String },

    /// The multiplexer was closed while the request was in flight,
    /// or a request was issued after close
    #[error("connection closed")]
    ConnectionClosed,

    /// A request tag collided with one already in flight.
    /// Tags come from a monotonic counter, so this means counter
    /// overflow or a caller bug.
    #[error("duplicate request tag {tag:?}")]
    DuplicateTag { tag: String },

    /// Encoded request exceeds the UDP packet size
    #[error("packet size {size} exceeds maximum {max_size}")]
    PacketTooLarge { size: usize, max_size: usize },

    /// The server answered a handshake command with an unexpected code
    #[error("{command} failed: {code} {header}")]
    UnexpectedCode {
        command: &'static str,
        code: ReturnCode,
        header: String,
    },

    /// An authenticated command was issued without a session key
    #[error("not authenticated (no session key; AUTH first)")]
    NotAuthenticated,
}

impl ProtocolError {
    /// Create a framing error
    pub fn framing(message: impl Into<String>) -> Self {
        Self::Framing {
            message: message.into(),
        }
    }

    /// Create a duplicate tag error
    pub fn duplicate_tag(tag: impl Into<String>) -> Self {
        Self::DuplicateTag { tag: tag.into() }
    }

    /// Create a packet too large error
    pub fn packet_too_large(size: usize, max_size: usize) -> Self {
        Self::PacketTooLarge { size, max_size }
    }

    /// Create an unexpected return code error
    pub fn unexpected_code(
        command: &'static str,
        code: ReturnCode,
        header: impl Into<String>,
    ) -> Self {
        Self::UnexpectedCode {
            command,
            code,
            header: header.into(),
        }
    }

    /// Check if this error is transient.
    ///
    /// The core never retries; this classification is for caller policy.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) | Self::Timeout(_) => true,
            Self::UnexpectedCode { code, .. } => code.is_transient(),
            _ => false,
        }
    }

    /// Check if this error indicates a need to re-authenticate
    pub fn requires_reauth(&self) -> bool {
        match self {
            Self::NotAuthenticated => true,
            Self::UnexpectedCode { code, .. } => code.needs_auth(),
            _ => false,
        }
    }
}

/// Return code sent by the server on the first response line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnCode(pub u16);

impl ReturnCode {
    /// Check if the code indicates success (2xx and 3xx)
    pub fn is_success(&self) -> bool {
        matches!(self.0, 200..=399)
    }

    /// Check if the code asks the caller to authenticate first
    pub fn needs_auth(&self) -> bool {
        matches!(self.0, 501 | 502 | 506)
    }

    /// Check if the code indicates a ban, which is fatal to the session
    pub fn is_banned(&self) -> bool {
        matches!(self.0, 504 | 555)
    }

    /// Check if the code indicates a client-side bug
    pub fn is_client_bug(&self) -> bool {
        matches!(self.0, 505 | 598)
    }

    /// Check if the code is transient (caller may retry; the core does not)
    pub fn is_transient(&self) -> bool {
        matches!(self.0, 600 | 601 | 602 | 604)
    }

    /// Get a human-readable description of the return code
    pub fn description(&self) -> &'static str {
        match self.0 {
            200 => "LOGIN ACCEPTED",
            201 => "LOGIN ACCEPTED - NEW VERSION AVAILABLE",
            203 => "LOGGED OUT",
            208 => "UPTIME",
            209 => "ENCRYPTION ENABLED",
            220 => "FILE",
            300 => "PONG",
            501 => "LOGIN FIRST",
            502 => "ACCESS DENIED",
            504 => "CLIENT BANNED",
            505 => "ILLEGAL INPUT OR ACCESS DENIED",
            506 => "INVALID SESSION",
            555 => "BANNED",
            598 => "UNKNOWN COMMAND",
            600 => "INTERNAL SERVER ERROR",
            601 => "ANIDB OUT OF SERVICE - TRY AGAIN LATER",
            602 => "SERVER BUSY - TRY AGAIN LATER",
            604 => "TIMEOUT - DELAY AND RESUBMIT",
            _ => "UNKNOWN RETURN CODE",
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ProtocolError::framing("bad padding");
        assert!(matches!(err, ProtocolError::Framing { .. }));
        assert!(err.to_string().contains("bad padding"));

        let err = ProtocolError::duplicate_tag("1f");
        assert!(err.to_string().contains("1f"));
    }

    #[test]
    fn test_transient_errors() {
        let errors = vec![
            ProtocolError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout")),
            ProtocolError::Timeout(Duration::from_secs(5)),
            ProtocolError::unexpected_code("PING", ReturnCode(602), "SERVER BUSY"),
        ];
        for err in errors {
            assert!(err.is_transient(), "{err:?} should be transient");
        }
    }

    #[test]
    fn test_non_transient_errors() {
        let errors = vec![
            ProtocolError::framing("bad"),
            ProtocolError::ConnectionClosed,
            ProtocolError::unexpected_code("AUTH", ReturnCode(500), "LOGIN FAILED"),
            ProtocolError::duplicate_tag("1"),
        ];
        for err in errors {
            assert!(!err.is_transient(), "{err:?} should not be transient");
        }
    }

    #[test]
    fn test_requires_reauth() {
        let errors = vec![
            ProtocolError::NotAuthenticated,
            ProtocolError::unexpected_code("UPTIME", ReturnCode(501), "LOGIN FIRST"),
            ProtocolError::unexpected_code("UPTIME", ReturnCode(506), "INVALID SESSION"),
        ];
        for err in errors {
            assert!(err.requires_reauth(), "{err:?} should require reauth");
        }
        let err = ProtocolError::unexpected_code("PING", ReturnCode(300), "PONG");
        assert!(!err.requires_reauth());
    }

    #[test]
    fn test_return_code_taxonomy() {
        assert!(ReturnCode(200).is_success());
        assert!(ReturnCode(300).is_success());
        assert!(!ReturnCode(501).is_success());

        assert!(ReturnCode(501).needs_auth());
        assert!(ReturnCode(506).needs_auth());
        assert!(!ReturnCode(504).needs_auth());

        assert!(ReturnCode(504).is_banned());
        assert!(ReturnCode(555).is_banned());

        assert!(ReturnCode(505).is_client_bug());
        assert!(ReturnCode(598).is_client_bug());

        assert!(ReturnCode(600).is_transient());
        assert!(ReturnCode(604).is_transient());
        assert!(!ReturnCode(603).is_transient());
    }

    #[test]
    fn test_return_code_display() {
        assert_eq!(ReturnCode(300).to_string(), "300 PONG");
        assert_eq!(ReturnCode(555).to_string(), "555 BANNED");
        assert_eq!(ReturnCode(999).to_string(), "999 UNKNOWN RETURN CODE");
    }
}
