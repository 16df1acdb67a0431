//! Wire envelope and message routing.
//!
//! Every frame on the socket is a JSON object `{type, payload}`. Control
//! messages (`subscribe`, `unsubscribe`, `ping`) go out; server pushes
//! come in and are re-published on the bus under catalogue names.

use relay_core::events;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::errors::WsError;

/// Normal closure; a peer closing with this code is not reconnected.
pub const CLOSE_NORMAL: u16 = 1000;
/// Abnormal closure reported when the transport dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Closure initiated by the heartbeat after a silent peer.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;

/// Inbound liveness reply.
pub const PONG: &str = "pong";

/// The `{type, payload}` envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific body.
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    /// Build a message.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// `{type: "subscribe", payload: {topics}}`.
    pub fn subscribe(topics: &[String]) -> Self {
        Self::new("subscribe", json!({ "topics": topics }))
    }

    /// `{type: "unsubscribe", payload: {topics}}`.
    pub fn unsubscribe(topics: &[String]) -> Self {
        Self::new("unsubscribe", json!({ "topics": topics }))
    }
}

/// Heartbeat frame body, `{type: "ping", timestamp}`.
pub fn ping_frame(timestamp: i64) -> Value {
    json!({ "type": "ping", "timestamp": timestamp })
}

/// Bus event an inbound message type is re-published as.
pub fn derived_event(kind: &str) -> Option<&'static str> {
    match kind {
        "execution_update" => Some(events::EXECUTION_UPDATED),
        "test_completion" => Some(events::TEST_COMPLETED),
        "system_status" => Some(events::SYSTEM_STATUS),
        "vault_update" => Some(events::VAULT_UPDATED),
        "coverage_update" => Some(events::COVERAGE_UPDATED),
        _ => None,
    }
}

/// Derive the socket URL from the page origin.
///
/// `http` maps to `ws` and `https` to `wss`; `ws`/`wss` origins are kept.
/// Any path on the origin is replaced by `path`.
pub fn derive_ws_url(origin: &str, path: &str) -> Result<String, WsError> {
    let invalid = |reason: &str| WsError::InvalidUrl {
        url: origin.to_owned(),
        reason: reason.to_owned(),
    };

    let (scheme, rest) = origin
        .split_once("://")
        .ok_or_else(|| invalid("missing scheme"))?;
    let ws_scheme = match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(invalid("unsupported scheme")),
    };
    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    let path = path.trim();
    if path.is_empty() || path.starts_with('/') {
        Ok(format!("{ws_scheme}://{host}{path}"))
    } else {
        Ok(format!("{ws_scheme}://{host}/{path}"))
    }
}

/// Check that an explicit URL uses a socket scheme.
pub fn validate_ws_url(url: &str) -> Result<(), WsError> {
    let lower = url.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("ws://")
        .or_else(|| lower.strip_prefix("wss://"));
    match rest {
        Some(rest) if !rest.is_empty() && !rest.starts_with('/') => Ok(()),
        Some(_) => Err(WsError::InvalidUrl {
            url: url.to_owned(),
            reason: "missing host".into(),
        }),
        None => Err(WsError::InvalidUrl {
            url: url.to_owned(),
            reason: "expected ws:// or wss://".into(),
        }),
    }
}
