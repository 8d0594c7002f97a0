//! Pending-response routing
//!
//! The server answers requests out of order; every request carries a tag
//! and every response leads with one. The router holds one single-use
//! delivery slot per in-flight tag so the reader task can hand each
//! datagram to exactly the sender that is waiting for it.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::oneshot;

use crate::error::{ProtocolError, Result};

/// Generates sequential request tags: lowercase hex, starting at `1`.
#[derive(Debug, Default)]
pub(crate) struct TagCounter {
    counter: AtomicU64,
}

impl TagCounter {
    pub(crate) fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{n:x}")
    }
}

/// Tracks pending responses by tag so they can be delivered out of order.
///
/// All methods are safe to call concurrently from many senders and the
/// reader task.
#[derive(Debug, Default)]
pub(crate) struct ResponseRouter {
    pending: DashMap<String, oneshot::Sender<Bytes>>,
}

impl ResponseRouter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a tag and return the slot to await.
    ///
    /// The caller must ensure [`ResponseRouter::cancel`] runs afterwards so
    /// the tag isn't leaked; [`PendingGuard`] does this on drop. A tag that
    /// is already registered means counter overflow or a caller bug and
    /// fails the new registration without touching the existing slot.
    pub(crate) fn register(&self, tag: &str) -> Result<oneshot::Receiver<Bytes>> {
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(tag.to_string()) {
            Entry::Occupied(_) => Err(ProtocolError::duplicate_tag(tag)),
            Entry::Vacant(entry) => {
                entry.insert(tx);
                Ok(rx)
            }
        }
    }

    /// Deliver a response payload to the slot registered for `tag`.
    ///
    /// Removal and fulfillment are one step; a concurrent cancel either
    /// wins the entry or loses it entirely. Unknown tags are logged and
    /// dropped.
    pub(crate) fn deliver(&self, tag: &str, payload: Bytes) {
        match self.pending.remove(tag) {
            Some((_, slot)) => {
                if slot.send(payload).is_err() {
                    debug!("response for tag {tag:?} dropped, waiter already gone");
                }
            }
            None => warn!("unknown tag {tag:?} for response"),
        }
    }

    /// Remove a registration. Idempotent.
    pub(crate) fn cancel(&self, tag: &str) {
        self.pending.remove(tag);
    }

    /// Unblock every pending waiter with an empty payload.
    ///
    /// Slots registered while close is running are not guaranteed to be
    /// drained by this call.
    pub(crate) fn close(&self) {
        let tags: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for tag in tags {
            self.deliver(&tag, Bytes::new());
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Cancels a registration when dropped.
///
/// Send paths have several early exits (write failure, deadline,
/// caller-side cancellation); the guard keeps the routing table clean on
/// all of them. Cancelling after delivery is a no-op.
pub(crate) struct PendingGuard<'a> {
    router: &'a ResponseRouter,
    tag: &'a str,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(router: &'a ResponseRouter, tag: &'a str) -> Self {
        Self { router, tag }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.router.cancel(self.tag);
    }
}
