//! Settings types.
//!
//! Every struct deserializes with camelCase keys and fills missing fields
//! from its `Default`, so a user file only needs the keys it changes.

use relay_core::retry::BackoffPolicy;
use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Log output.
    pub logging: LoggingSettings,
    /// Event bus.
    pub bus: BusSettings,
    /// State manager.
    pub state: StateSettings,
    /// Socket client.
    pub websocket: WsSettings,
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`RUST_LOG` overrides).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

/// Event bus settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusSettings {
    /// Ring size of the emitted-event history.
    pub history_limit: usize,
    /// Log every emit at debug level.
    pub debug: bool,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            history_limit: 100,
            debug: false,
        }
    }
}

/// State manager settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateSettings {
    /// Ring size of the write history.
    pub history_limit: usize,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self { history_limit: 50 }
    }
}

/// Socket client settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WsSettings {
    /// Explicit socket URL. When unset the URL is derived from `origin`.
    pub url: Option<String>,
    /// Page origin the dashboard is served from (`http(s)://host:port`).
    pub origin: String,
    /// Socket path appended to the derived URL.
    pub path: String,
    /// Reconnection backoff.
    pub reconnect: BackoffPolicy,
    /// How long a connection attempt may take before it is abandoned.
    pub connect_timeout_ms: u64,
    /// Silence window after which the connection is considered dead.
    pub heartbeat_timeout_ms: u64,
    /// Capacity of the offline send queue (oldest dropped on overflow).
    pub queue_capacity: usize,
    /// Topics subscribed on every successful open.
    pub default_topics: Vec<String>,
    /// Log unknown inbound message types.
    pub debug: bool,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            url: None,
            origin: "http://localhost:8000".into(),
            path: "/ws".into(),
            reconnect: BackoffPolicy::default(),
            connect_timeout_ms: 5000,
            heartbeat_timeout_ms: 60_000,
            queue_capacity: 100,
            default_topics: vec!["executions".into(), "system".into()],
            debug: false,
        }
    }
}
