//! Flood-prevention rate limiting
//!
//! The server's recommendations translate to two token buckets acquired in
//! series: a long-term bucket at one request per 4 seconds whose burst of
//! 30 absorbs roughly the first minute of activity, and a short-term
//! bucket at one request per 2 seconds with no burst. The session takes a
//! token from both before every request; the multiplexer below stays
//! policy-free.

use std::time::Duration;

use leaky_bucket::RateLimiter;
use log::debug;
use tokio_util::sync::CancellationToken;

/// Long-term bucket: 0.25 tokens/sec, burst 30
const LONG_INTERVAL: Duration = Duration::from_secs(4);
const LONG_BURST: usize = 30;

/// Short-term bucket: 0.5 tokens/sec, burst 1
const SHORT_INTERVAL: Duration = Duration::from_secs(2);
const SHORT_BURST: usize = 1;

/// Dual token bucket enforcing the server's flood-prevention rules.
pub struct RequestLimiter {
    long: RateLimiter,
    short: RateLimiter,
    disabled: CancellationToken,
}

impl RequestLimiter {
    /// Create a limiter with both buckets full.
    pub fn new() -> Self {
        Self {
            long: RateLimiter::builder()
                .max(LONG_BURST)
                .initial(LONG_BURST)
                .refill(1)
                .interval(LONG_INTERVAL)
                .build(),
            short: RateLimiter::builder()
                .max(SHORT_BURST)
                .initial(SHORT_BURST)
                .refill(1)
                .interval(SHORT_INTERVAL)
                .build(),
            disabled: CancellationToken::new(),
        }
    }

    /// Take one token from each bucket, long bucket first.
    ///
    /// Blocks until tokens are available. Cancellable: callers racing this
    /// against a deadline drop the future and no token is consumed beyond
    /// the ones already taken. Returns immediately once the limiter has
    /// been closed.
    pub async fn acquire(&self) {
        tokio::select! {
            _ = self.disabled.cancelled() => {
                debug!("rate limiter disabled, passing request through");
            }
            _ = async {
                self.long.acquire_one().await;
                self.short.acquire_one().await;
            } => {}
        }
    }

    /// Disable rate limiting and unblock all current waiters.
    ///
    /// Called at shutdown so the final LOGOUT isn't starved behind earlier
    /// traffic. Safe to call concurrently and more than once.
    pub fn close(&self) {
        self.disabled.cancel();
    }
}

impl Default for RequestLimiter {
    fn default() -> Self {
        Self::new()
    }
}
