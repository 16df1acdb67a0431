//! Socket client errors.

use thiserror::Error;

/// Errors returned by [`WebSocketClient::connect`](crate::WebSocketClient::connect).
///
/// Every other failure is counted in the metrics and published as a
/// `websocket:error` bus event instead of being returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WsError {
    /// The URL (or the origin it was derived from) is unusable.
    #[error("invalid websocket url '{url}': {reason}")]
    InvalidUrl {
        /// Offending URL or origin.
        url: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The socket did not open within the connect timeout.
    #[error("timed out after {timeout_ms}ms connecting to {url}")]
    ConnectTimeout {
        /// Target URL.
        url: String,
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// The transport refused or failed the connection.
    #[error("failed to connect to {url}: {message}")]
    Connect {
        /// Target URL.
        url: String,
        /// Transport error text.
        message: String,
    },
}

impl WsError {
    /// Short machine-readable label used in `websocket:error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidUrl { .. } => "invalid_url",
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::Connect { .. } => "connect",
        }
    }
}

/// Failure reported by a [`Connector`](crate::Connector) or by an open
/// transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    /// Wrap any displayable error.
    pub fn new(err: impl std::fmt::Display) -> Self {
        Self(err.to_string())
    }
}
