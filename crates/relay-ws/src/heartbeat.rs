//! Heartbeat liveness monitoring.

use std::time::Duration;

use parking_lot::Mutex;
use relay_core::time::now_ms;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::connection::Outbound;
use crate::protocol::{CLOSE_HEARTBEAT_TIMEOUT, ping_frame};
use crate::transport::WireFrame;

/// Reason sent with a heartbeat-initiated close.
pub const HEARTBEAT_TIMEOUT_REASON: &str = "heartbeat timeout";

/// Time of the last inbound traffic on the current connection.
#[derive(Debug)]
pub(crate) struct Liveness {
    last_seen: Mutex<Instant>,
}

impl Liveness {
    pub(crate) fn new() -> Self {
        Self {
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// Record inbound traffic.
    pub(crate) fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub(crate) fn silence(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// Nothing arrived within the timeout; a close was requested.
    TimedOut,
    /// Cancelled, or the connection went away first.
    Cancelled,
}

/// Run heartbeat checks for one connection.
///
/// Every `timeout / 2` the silence since the last inbound frame is checked.
/// Once it reaches `timeout` a close with code 4000 is queued on `outbound`
/// and [`HeartbeatResult::TimedOut`] is returned. Otherwise a
/// `{type: "ping", timestamp}` frame is queued.
pub(crate) async fn run_heartbeat(
    liveness: &Liveness,
    outbound: mpsc::UnboundedSender<Outbound>,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let period = (timeout / 2).max(Duration::from_millis(1));
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if liveness.silence() >= timeout {
                    let _ = outbound.send(Outbound::Close {
                        code: CLOSE_HEARTBEAT_TIMEOUT,
                        reason: HEARTBEAT_TIMEOUT_REASON.to_owned(),
                    });
                    return HeartbeatResult::TimedOut;
                }
                let ping = ping_frame(now_ms()).to_string();
                if outbound.send(Outbound::Frame(WireFrame::Text(ping))).is_err() {
                    return HeartbeatResult::Cancelled;
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}
