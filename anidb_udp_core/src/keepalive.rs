//! NAT keepalive
//!
//! UDP NAT mappings expire after some idle period, after which the server
//! sees a different source port and session traffic goes nowhere. The
//! keepalive probes with `PING nat=1`, compares the server-observed port
//! against the last probe, and adapts its sleep interval to sit just
//! under the NAT idle timeout: raise while the port holds, back off once
//! a rebinding is seen, then sustain.
//!
//! Real traffic resets the idle clock, so the probe only fires after the
//! connection has actually been quiet for a full interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::error::{ProtocolError, Result};
use crate::message::Params;
use crate::mux::Requester;

const INITIAL_INTERVAL: Duration = Duration::from_secs(60);
const MIN_INTERVAL: Duration = Duration::from_secs(30);
const MAX_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Adjustment step, and the slack allowed between planned and actual sleep
const INTERVAL_STEP: Duration = Duration::from_secs(10);
/// Deadline for each probe
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Tracks when the socket last saw traffic.
///
/// Bumped by every request sender; read by the keepalive to decide how
/// long the connection has been quiet.
#[derive(Debug, Clone)]
pub(crate) struct ActivityTracker {
    last: Arc<Mutex<Instant>>,
}

impl ActivityTracker {
    pub(crate) fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub(crate) async fn bump(&self) {
        *self.last.lock().await = Instant::now();
    }

    pub(crate) async fn idle(&self) -> Duration {
        self.last.lock().await.elapsed()
    }
}

/// The interval state machine.
///
/// Fed the measured idle time and the server-observed port after every
/// successful probe. The interval always stays within
/// [`MIN_INTERVAL`, `MAX_INTERVAL`].
#[derive(Debug)]
struct IntervalPolicy {
    interval: Duration,
    last_port: String,
    timeout_hit: bool,
}

impl IntervalPolicy {
    fn new(reference_port: String) -> Self {
        Self {
            interval: INITIAL_INTERVAL,
            last_port: reference_port,
            timeout_hit: false,
        }
    }

    /// Update the interval after a successful probe.
    ///
    /// `idle` is how long the connection had been quiet when the probe
    /// fired.
    fn on_probe(&mut self, idle: Duration, port: &str) {
        if port != self.last_port {
            if idle > self.interval + INTERVAL_STEP {
                // The probe fired far later than planned, so the rebinding
                // can't be pinned on the current interval. Leave it alone.
                debug!(
                    "port changed after oversleeping ({idle:?} vs planned {:?}), keeping interval",
                    self.interval
                );
                return;
            }
            self.timeout_hit = true;
            self.interval = clamp(self.interval.saturating_sub(INTERVAL_STEP));
            self.last_port = port.to_string();
            debug!("port reset, lowering interval to {:?}", self.interval);
        } else if !self.timeout_hit {
            self.interval = clamp(idle + INTERVAL_STEP);
            debug!("timeout not hit, raising interval to {:?}", self.interval);
        }
    }

    /// Back off after a failed probe.
    fn on_failure(&mut self) {
        self.interval = clamp(self.interval + INTERVAL_STEP);
    }
}

fn clamp(interval: Duration) -> Duration {
    interval.clamp(MIN_INTERVAL, MAX_INTERVAL)
}

/// Handle to the background keepalive task.
pub(crate) struct KeepAlive {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl KeepAlive {
    /// Probe once to seed the reference port, then start the background
    /// loop. Call [`KeepAlive::stop`] before closing the mux underneath.
    pub(crate) async fn start(
        requester: Arc<dyn Requester>,
        activity: ActivityTracker,
    ) -> Result<Self> {
        let port = probe(requester.as_ref()).await?;
        activity.bump().await;
        let policy = IntervalPolicy::new(port);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(requester, activity, policy, shutdown.clone()));
        Ok(Self { shutdown, task })
    }

    /// Cancel the loop and wait for the task to exit.
    pub(crate) async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

/// Background loop: sleep until the connection has been quiet for a full
/// interval, probe, adapt. Never fails upward.
async fn run(
    requester: Arc<dyn Requester>,
    activity: ActivityTracker,
    mut policy: IntervalPolicy,
    shutdown: CancellationToken,
) {
    loop {
        let idle = loop {
            let idle = activity.idle().await;
            if idle >= policy.interval {
                break idle;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(policy.interval - idle) => {}
            }
        };
        let probed = tokio::select! {
            _ = shutdown.cancelled() => return,
            probed = probe(requester.as_ref()) => probed,
        };
        activity.bump().await;
        match probed {
            Ok(port) => policy.on_probe(idle, &port),
            Err(e) => {
                warn!("keepalive ping failed: {e}");
                policy.on_failure();
            }
        }
    }
}

/// Send one `PING nat=1` and return the server-observed port.
async fn probe(requester: &dyn Requester) -> Result<String> {
    let mut params = Params::new();
    params.set("nat", "1");
    let resp = timeout(PING_TIMEOUT, requester.request("PING", params))
        .await
        .map_err(|_| ProtocolError::Timeout(PING_TIMEOUT))??;
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
