//! Socket client counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free counters updated by the client and its tasks.
#[derive(Debug, Default)]
pub(crate) struct WsMetrics {
    pub(crate) messages_sent: AtomicU64,
    pub(crate) messages_received: AtomicU64,
    pub(crate) messages_queued: AtomicU64,
    pub(crate) messages_dropped: AtomicU64,
    pub(crate) send_errors: AtomicU64,
    pub(crate) parse_errors: AtomicU64,
    pub(crate) connection_errors: AtomicU64,
    pub(crate) reconnect_attempts: AtomicU64,
    pub(crate) last_reconnect_delay_ms: AtomicU64,
    pub(crate) heartbeat_timeouts: AtomicU64,
}

impl WsMetrics {
    pub(crate) fn incr(counter: &AtomicU64) {
        let _ = counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> WsMetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        WsMetricsSnapshot {
            messages_sent: load(&self.messages_sent),
            messages_received: load(&self.messages_received),
            messages_queued: load(&self.messages_queued),
            messages_dropped: load(&self.messages_dropped),
            send_errors: load(&self.send_errors),
            parse_errors: load(&self.parse_errors),
            connection_errors: load(&self.connection_errors),
            reconnect_attempts: load(&self.reconnect_attempts),
            last_reconnect_delay_ms: load(&self.last_reconnect_delay_ms),
            heartbeat_timeouts: load(&self.heartbeat_timeouts),
        }
    }
}

/// Point-in-time copy of the client counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WsMetricsSnapshot {
    /// Frames written, including control messages and pings.
    pub messages_sent: u64,
    /// Text frames received.
    pub messages_received: u64,
    /// Messages parked in the offline queue.
    pub messages_queued: u64,
    /// Queued messages evicted by overflow.
    pub messages_dropped: u64,
    /// Serialization or write failures.
    pub send_errors: u64,
    /// Inbound frames that were not valid envelopes.
    pub parse_errors: u64,
    /// Failed or timed-out connection attempts.
    pub connection_errors: u64,
    /// Reconnects scheduled since creation.
    pub reconnect_attempts: u64,
    /// Delay of the most recently scheduled reconnect.
    pub last_reconnect_delay_ms: u64,
    /// Connections closed by the heartbeat.
    pub heartbeat_timeouts: u64,
}
