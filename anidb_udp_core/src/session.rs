//! Authenticated UDP sessions
//!
//! [`Session`] layers the handshake on top of the multiplexer: optional
//! ENCRYPT key negotiation, AUTH with NAT detection, rate limiting on
//! every request, a keepalive when the connection turns out to be behind
//! NAT, and LOGOUT on close.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::codec;
use crate::error::{ProtocolError, Result};
use crate::keepalive::{ActivityTracker, KeepAlive};
use crate::limiter::RequestLimiter;
use crate::message::{Params, Response};
use crate::mux::{Mux, Requester};
use crate::{DEFAULT_PORT, DEFAULT_SERVER, LOGOUT_TIMEOUT, PROTOCOL_VERSION};

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server address (hostname:port)
    pub server: String,
    /// AniDB account name
    pub username: String,
    /// AniDB account password
    pub password: String,
    /// Registered client name
    pub client_name: String,
    /// Registered client version
    pub client_version: u32,
    /// UDP API key; enables encryption when set
    pub api_key: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server: format!("{DEFAULT_SERVER}:{DEFAULT_PORT}"),
            username: String::new(),
            password: String::new(),
            client_name: String::new(),
            client_version: 1,
            api_key: None,
        }
    }
}

/// An authenticated UDP session.
///
/// Methods are concurrency safe. Close the session after use; dropping
/// it without [`Session::close`] skips LOGOUT and leaves the server-side
/// session to time out on its own.
pub struct Session {
    requester: Arc<LimitedRequester>,
    session_key: Mutex<String>,
    keepalive: Mutex<Option<KeepAlive>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

/// The session-side request path: limiter first, then the mux, bumping
/// the activity clock the keepalive watches.
struct LimitedRequester {
    mux: Arc<Mux>,
    limiter: RequestLimiter,
    activity: ActivityTracker,
}

#[async_trait]
impl Requester for LimitedRequester {
    async fn request(&self, cmd: &str, params: Params) -> Result<Response> {
        self.limiter.acquire().await;
        self.activity.bump().await;
        self.mux.request(cmd, params).await
    }
}

impl Session {
    /// Connect and authenticate.
    ///
    /// Dials the server, negotiates encryption when an API key is
    /// configured, then authenticates. If the server reports a different
    /// address than the local socket's, the connection is behind NAT and
    /// a keepalive task is started. Any handshake failure disposes the
    /// connection and is returned.
    pub async fn start(config: SessionConfig) -> Result<Session> {
        debug!("starting UDP session with {}", config.server);
        let addr = lookup_host(&config.server).await?.next().ok_or_else(|| {
            ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no addresses found for {:?}", config.server),
            ))
        })?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;

        let session = Session {
            requester: Arc::new(LimitedRequester {
                mux: Arc::new(Mux::new(socket)),
                limiter: RequestLimiter::new(),
                activity: ActivityTracker::new(),
            }),
            session_key: Mutex::new(String::new()),
            keepalive: Mutex::new(None),
        };
        match session.handshake(&config).await {
            Ok(()) => Ok(session),
            Err(e) => {
                session.requester.mux.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, config: &SessionConfig) -> Result<()> {
        if let Some(api_key) = &config.api_key {
            self.negotiate_encryption(&config.username, api_key).await?;
        }
        let nat = self.authenticate(config).await?;
        if nat {
            // Probes go straight to the mux; their 2 s deadline cannot
            // sit out the short bucket.
            let mux = self.requester.mux.clone() as Arc<dyn Requester>;
            let keepalive = KeepAlive::start(mux, self.requester.activity.clone()).await?;
            *self.keepalive.lock().await = Some(keepalive);
        }
        Ok(())
    }

    /// ENCRYPT handshake: fetch the salt and install the session cipher.
    async fn negotiate_encryption(&self, username: &str, api_key: &str) -> Result<()> {
        let mut params = Params::new();
        params.set("user", username);
        params.set("type", "1");
        let resp = self.requester.request("ENCRYPT", params).await?;
        if resp.code.0 != 209 {
            return Err(ProtocolError::unexpected_code("ENCRYPT", resp.code, resp.header));
        }
        let salt = resp.header.split(' ').next().unwrap_or_default();
        let cipher = codec::derive_key(api_key, salt);
        self.requester.mux.set_cipher(Some(cipher)).await;
        debug!("encryption enabled");
        Ok(())
    }

    /// AUTH handshake. Returns whether the connection is behind NAT.
    async fn authenticate(&self, config: &SessionConfig) -> Result<bool> {
        debug!("authenticating user {:?}", config.username);
        let mut params = Params::new();
        params.set("user", &config.username);
        params.set("pass", &config.password);
        params.set("protover", PROTOCOL_VERSION);
        params.set("client", &config.client_name);
        params.set("clientver", config.client_version.to_string());
        params.set("nat", "1");
        params.set("comp", "1");
        trace!("AUTH request: {}", mask_password(&params.encode()));
        let resp = self.requester.request("AUTH", params).await?;
        if resp.code.0 == 201 {
            info!("new UDP API version available");
        } else if resp.code.0 != 200 {
            return Err(ProtocolError::unexpected_code("AUTH", resp.code, resp.header));
        }
        let (key, observed_addr) = parse_auth_header(&resp.header)?;
        *self.session_key.lock().await = key.to_string();

        // The comparison is textual and conservative; a mismatched IP
        // string with the same port still counts as NAT.
        let local_addr = self.requester.mux.local_addr()?.to_string();
        let nat = local_addr != observed_addr;
        if nat {
            info!("detected NAT (local {local_addr:?}, server saw {observed_addr:?})");
        }
        Ok(nat)
    }

    /// Issue an authenticated command, adding the session key as `s`.
    pub async fn command(&self, cmd: &str, mut params: Params) -> Result<Response> {
        params.set("s", self.current_key().await?);
        self.requester.request(cmd, params).await
    }

    /// PING the server and return the server-observed source port.
    pub async fn ping(&self) -> Result<String> {
        let mut params = Params::new();
        params.set("nat", "1");
        let resp = self.requester.request("PING", params).await?;
        if resp.code.0 != 300 {
            return Err(ProtocolError::unexpected_code("PING", resp.code, resp.header));
        }
        match resp.rows.first().and_then(|row| row.first()) {
            Some(port) => Ok(port.clone()),
            None => Err(ProtocolError::framing(format!(
                "unexpected PING response rows: {:?}",
                resp.rows
            ))),
        }
    }

    /// Fetch server uptime in milliseconds.
    pub async fn uptime(&self) -> Result<u64> {
        let resp = self.command("UPTIME", Params::new()).await?;
        if resp.code.0 != 208 {
            return Err(ProtocolError::unexpected_code("UPTIME", resp.code, resp.header));
        }
        resp.rows
            .first()
            .and_then(|row| row.first())
            .and_then(|uptime| uptime.parse().ok())
            .ok_or_else(|| {
                ProtocolError::framing(format!("unexpected UPTIME response rows: {:?}", resp.rows))
            })
    }

    /// LOGOUT and clear session state.
    ///
    /// The stored key and the cipher are cleared whatever the server
    /// answers; a non-203 code is reported but the session is logged out
    /// as far as this side is concerned.
    pub async fn logout(&self) -> Result<()> {
        let mut params = Params::new();
        params.set("s", self.current_key().await?);
        let resp = self.requester.request("LOGOUT", params).await?;
        self.session_key.lock().await.clear();
        self.requester.mux.set_cipher(None).await;
        if resp.code.0 != 203 {
            return Err(ProtocolError::unexpected_code("LOGOUT", resp.code, resp.header));
        }
        Ok(())
    }

    /// Local address of the underlying socket; useful for NAT diagnosis.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.requester.mux.local_addr()
    }

    /// Check whether AUTH has completed and LOGOUT has not run.
    pub async fn is_authenticated(&self) -> bool {
        !self.session_key.lock().await.is_empty()
    }

    /// Shut the session down.
    ///
    /// Stops the keepalive, lifts the rate limit so the farewell isn't
    /// starved, attempts LOGOUT with a short deadline when a session key
    /// is present, and closes the multiplexer. LOGOUT failures are
    /// swallowed; the connection may already be dead.
    pub async fn close(&self) {
        if let Some(keepalive) = self.keepalive.lock().await.take() {
            keepalive.stop().await;
        }
        self.requester.limiter.close();
        if self.is_authenticated().await {
            match timeout(LOGOUT_TIMEOUT, self.logout()).await {
                Ok(Ok(())) => debug!("logged out"),
                Ok(Err(e)) => warn!("logout failed: {e}"),
                Err(_) => warn!("logout timed out after {LOGOUT_TIMEOUT:?}"),
            }
        }
        self.requester.mux.close().await;
    }

    async fn current_key(&self) -> Result<String> {
        let key = self.session_key.lock().await;
        if key.is_empty() {
            return Err(ProtocolError::NotAuthenticated);
        }
        Ok(key.clone())
    }
}

/// Split an AUTH success header of the form
/// `"<session-key> <observed-addr> <server-version>"`.
fn parse_auth_header(header: &str) -> Result<(&str, &str)> {
    let mut parts = header.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(key), Some(addr), Some(_version)) if !key.is_empty() => Ok((key, addr)),
        _ => Err(ProtocolError::framing(format!(
            "invalid AUTH response header {header:?}"
        ))),
    }
}

/// Render an encoded AUTH request with the password masked, for logging.
fn mask_password(encoded: &str) -> String {
    encoded
        .split('&')
        .map(|part| {
            if part.starts_with("pass=") {
                "pass=***"
            } else {
                part
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.server, format!("{DEFAULT_SERVER}:{DEFAULT_PORT}"));
        assert_eq!(config.username, "");
        assert_eq!(config.password, "");
        assert_eq!(config.client_version, 1);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_parse_auth_header() {
        let (key, addr) = parse_auth_header("fk9BWsJd 203.0.113.9:32771 6").unwrap();
        assert_eq!(key, "fk9BWsJd");
        assert_eq!(addr, "203.0.113.9:32771");
    }

    #[test]
    fn test_parse_auth_header_too_short() {
        for header in ["", "keyonly", "key addr"] {
            let err = parse_auth_header(header).unwrap_err();
            assert!(matches!(err, ProtocolError::Framing { .. }), "{header:?}");
        }
    }

    #[test]
    fn test_mask_password() {
        let masked = mask_password("client=test&pass=hunter2&user=me");
        assert_eq!(masked, "client=test&pass=***&user=me");
    }
}
