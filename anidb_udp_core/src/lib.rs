//! AniDB UDP API client core
//!
//! This crate implements the connection layer of the AniDB UDP API with a
//! modular architecture:
//! - `mux`: multiplexes tagged requests and responses on a single UDP socket
//! - `limiter`: enforces the server's flood-prevention recommendations
//! - `session`: layers the ENCRYPT/AUTH/LOGOUT handshake on top of the mux
//! - `message`: request parameter encoding and response parsing
//!
//! Most users want [`Session`]; [`Mux`] is the low-level API for callers
//! that manage rate limiting and authentication themselves.
//!
//! Documentation for the protocol can be found at
//! <https://wiki.anidb.net/UDP_API_Definition>.

pub mod error;
pub mod limiter;
pub mod message;
pub mod mux;
pub mod session;

mod codec;
mod keepalive;
mod router;

// Re-export main types
pub use error::{ProtocolError, Result, ReturnCode};
pub use message::{Params, Response};
pub use mux::{Mux, Requester};
pub use session::{Session, SessionConfig};

use std::time::Duration;

/// Protocol version supported by this implementation
pub const PROTOCOL_VERSION: &str = "3";

/// Maximum UDP packet size assumed by the protocol (considering PPPoE)
pub const MAX_PACKET_SIZE: usize = 1400;

/// Default AniDB server address
pub const DEFAULT_SERVER: &str = "api.anidb.net";

/// Default AniDB UDP port
pub const DEFAULT_PORT: u16 = 9000;

/// Default per-request deadline
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline applied to the LOGOUT attempt during session shutdown
pub const LOGOUT_TIMEOUT: Duration = Duration::from_secs(2);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_constants() {
        assert_eq!(PROTOCOL_VERSION, "3");
        assert_eq!(MAX_PACKET_SIZE, 1400);
        assert_eq!(DEFAULT_SERVER, "api.anidb.net");
        assert_eq!(DEFAULT_PORT, 9000);
        assert_eq!(DEFAULT_REQUEST_TIMEOUT, Duration::from_secs(5));
        assert_eq!(LOGOUT_TIMEOUT, Duration::from_secs(2));
    }
}
