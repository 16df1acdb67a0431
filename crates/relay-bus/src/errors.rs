//! Bus error types.

use thiserror::Error;

/// Errors returned by [`EventBus::wait_for`](crate::EventBus::wait_for).
///
/// Every other bus operation fails soft (logs and returns an inert value).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The event type was empty, so nothing could be awaited.
    #[error("event type must not be empty")]
    InvalidEventType,

    /// No matching event arrived before the timeout.
    #[error("timed out after {timeout_ms}ms waiting for '{event_type}'")]
    Timeout {
        /// The awaited event type.
        event_type: String,
        /// How long we waited.
        timeout_ms: u64,
    },

    /// The waiting listener was removed (for example by `off(type, None)`)
    /// before the event fired.
    #[error("wait for '{event_type}' was cancelled")]
    Cancelled {
        /// The awaited event type.
        event_type: String,
    },
}
