//! Request/response multiplexing on a single UDP socket
//!
//! [`Mux`] owns the socket, the cipher state, the tag counter, and a
//! background reader task. It serializes outgoing requests, stamps each
//! with a fresh tag, and routes incoming datagrams back to the waiting
//! sender. Decryption and decompression happen here because both are
//! needed before the response tag is readable.
//!
//! The mux applies no rate limiting and no retries; those are policy and
//! belong to the layers above.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aes::Aes128;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::error::{ProtocolError, Result};
use crate::message::{parse_response, split_tag, Params, Response};
use crate::router::{PendingGuard, ResponseRouter, TagCounter};
use crate::{DEFAULT_REQUEST_TIMEOUT, MAX_PACKET_SIZE};

/// Issues requests to the AniDB UDP API.
///
/// The seam between the mux and the layers above it (session, keepalive),
/// so those layers can be tested against a fake.
#[async_trait]
pub trait Requester: Send + Sync {
    /// Perform one request and wait for its response.
    async fn request(&self, cmd: &str, params: Params) -> Result<Response>;
}

/// Multiplexes tagged requests and responses on a single UDP socket.
///
/// Methods can be called concurrently; each in-flight request is
/// identified by the tag the mux assigns at send time, so responses may
/// arrive in any order.
pub struct Mux {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// State shared with the reader task.
struct Shared {
    socket: UdpSocket,
    cipher: Mutex<Option<Aes128>>,
    router: ResponseRouter,
    tags: TagCounter,
    closed: AtomicBool,
    request_timeout: Duration,
}

impl Mux {
    /// Create a mux over a connected UDP socket and start its reader task.
    ///
    /// The socket is owned by the mux from here on. Call
    /// [`Mux::close`] after use.
    pub fn new(socket: UdpSocket) -> Self {
        Self::with_timeout(socket, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Like [`Mux::new`] with a custom per-request deadline.
    pub fn with_timeout(socket: UdpSocket, request_timeout: Duration) -> Self {
        let shared = Arc::new(Shared {
            socket,
            cipher: Mutex::new(None),
            router: ResponseRouter::new(),
            tags: TagCounter::default(),
            closed: AtomicBool::new(false),
            request_timeout,
        });
        let shutdown = CancellationToken::new();
        let reader = tokio::spawn(run_reader(shared.clone(), shutdown.clone()));
        Self {
            shared,
            reader: Mutex::new(Some(reader)),
            shutdown,
        }
    }

    /// Install or remove the cipher used for both directions.
    ///
    /// Takes effect for all subsequent sends and receives until replaced
    /// or the mux closes.
    pub async fn set_cipher(&self, cipher: Option<Aes128>) {
        *self.shared.cipher.lock().await = cipher;
    }

    /// Local address of the underlying socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Perform one request and wait for the matching response.
    ///
    /// `params` gains a fresh `tag` value, replacing any present. The
    /// whole exchange is bounded by the per-request deadline; on expiry
    /// the registration is cancelled and [`ProtocolError::Timeout`] is
    /// returned. Callers wanting a shorter bound can wrap this future in
    /// their own timeout; dropping it also cancels the registration.
    pub async fn request(&self, cmd: &str, params: Params) -> Result<Response> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::ConnectionClosed);
        }
        let deadline = self.shared.request_timeout;
        match timeout(deadline, self.shared.request_once(cmd, params)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("{cmd} request timed out after {deadline:?}");
                Err(ProtocolError::Timeout(deadline))
            }
        }
    }

    /// Close the mux.
    ///
    /// Stops the reader, unblocks every pending waiter with an empty
    /// payload, and waits for the reader task to exit. All later requests
    /// fail. Idempotent.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing mux");
        self.shutdown.cancel();
        self.shared.router.close();
        if let Some(handle) = self.reader.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl Requester for Mux {
    async fn request(&self, cmd: &str, params: Params) -> Result<Response> {
        Mux::request(self, cmd, params).await
    }
}

impl Shared {
    /// Send a single request packet and await its response. No deadline;
    /// the caller wraps this future.
    async fn request_once(&self, cmd: &str, mut params: Params) -> Result<Response> {
        let tag = self.tags.next();
        params.set("tag", tag.clone());
        let mut packet = format!("{cmd} {}", params.encode()).into_bytes();
        trace!("encoded {cmd} request, tag {tag}, {} bytes", packet.len());
        if let Some(cipher) = self.cipher().await {
            packet = codec::encrypt(&cipher, packet);
        }
        if packet.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::packet_too_large(packet.len(), MAX_PACKET_SIZE));
        }

        let slot = self.router.register(&tag)?;
        let _guard = PendingGuard::new(&self.router, &tag);
        debug!("sending {cmd} request, tag {tag}");
        let sent = self.socket.send(&packet).await?;
        if sent != packet.len() {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("partial send: {sent} of {} bytes", packet.len()),
            )));
        }
        match slot.await {
            Ok(payload) => parse_response(&payload),
            Err(_) => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn cipher(&self) -> Option<Aes128> {
        self.cipher.lock().await.clone()
    }

    /// Run the decrypt → decompress → split-tag pipeline on one datagram
    /// and route the payload. Per-packet failures are logged and the
    /// packet is dropped; no sender is disturbed.
    async fn handle_datagram(&self, data: &[u8]) {
        let mut data = data.to_vec();
        if let Some(cipher) = self.cipher().await {
            match codec::decrypt(&cipher, &data) {
                Ok(clear) => data = clear,
                Err(e) => {
                    warn!("dropping response packet: {e}");
                    return;
                }
            }
        }
        if codec::is_compressed(&data) {
            match codec::decompress(&data[codec::COMPRESSED_PREFIX_LEN..]) {
                Ok(inflated) => data = inflated,
                Err(e) => {
                    warn!("dropping response packet: {e}");
                    return;
                }
            }
        }
        let (tag, payload) = split_tag(&data);
        let tag = String::from_utf8_lossy(tag).into_owned();
        trace!("routing response for tag {tag}, {} bytes", payload.len());
        self.router.deliver(&tag, Bytes::copy_from_slice(payload));
    }
}

/// Reader task: pull datagrams off the socket until shutdown.
///
/// Transient read errors are logged and the loop continues; only the
/// shutdown signal (or the socket being closed underneath) ends it.
async fn run_reader(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("reader task shutting down");
                return;
            }
            received = shared.socket.recv(&mut buf) => received,
        };
        match received {
            Ok(0) => {}
            Ok(n) => shared.handle_datagram(&buf[..n]).await,
            Err(e) => {
                if shared.closed.load(Ordering::Acquire) {
                    return;
                }
                warn!("error reading from UDP socket: {e}");
            }
        }
    }
}
