//! # relay-ws
//!
//! Reconnecting socket client for the backend live-update channel.
//!
//! - Inbound `{type, payload}` messages are re-published on the
//!   [`relay_bus::EventBus`] as `websocket:message` plus a type-specific
//!   event (`execution:updated`, `system:status`, ...)
//! - Sends made while offline are queued (bounded, oldest dropped) and
//!   flushed after the topic re-subscription on the next open
//! - Lost connections are retried with capped exponential backoff
//! - A heartbeat pings every half timeout and closes a silent socket
//!   with code 4000
//!
//! The socket library sits behind the [`Connector`] trait;
//! [`TungsteniteConnector`] is the production transport.

#![deny(unsafe_code)]

pub mod client;
mod connection;
pub mod errors;
pub mod heartbeat;
mod metrics;
pub mod protocol;
pub mod transport;

pub use client::{CLIENT_DISCONNECT_REASON, ConnectionPhase, ConnectionSnapshot, WebSocketClient};
pub use errors::{TransportError, WsError};
pub use heartbeat::{HEARTBEAT_TIMEOUT_REASON, HeartbeatResult};
pub use metrics::WsMetricsSnapshot;
pub use protocol::{
    CLOSE_ABNORMAL, CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NORMAL, Message, derive_ws_url,
};
pub use transport::{Connector, FrameSink, FrameStream, TungsteniteConnector, WireFrame};
