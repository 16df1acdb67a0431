//! Dispatched event and history record types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The per-dispatch event handed to each listener.
///
/// One `Event` is built per `emit` call and passed to every listener in
/// priority order. Calling [`Event::stop_propagation`] prevents the
/// remaining listeners of *this* dispatch from running.
#[derive(Clone, Debug)]
pub struct Event {
    /// Event type.
    pub event_type: String,
    /// Payload.
    pub data: Value,
    /// Emission time in ms since the epoch.
    pub timestamp: i64,
    propagation_stopped: bool,
    context: Option<String>,
}

impl Event {
    pub(crate) fn new(event_type: &str, data: Value, timestamp: i64) -> Self {
        Self {
            event_type: event_type.to_owned(),
            data,
            timestamp,
            propagation_stopped: false,
            context: None,
        }
    }

    /// Skip every listener after the current one in this dispatch.
    pub fn stop_propagation(&mut self) {
        self.propagation_stopped = true;
    }

    /// Whether a listener has stopped propagation.
    pub fn is_propagation_stopped(&self) -> bool {
        self.propagation_stopped
    }

    /// Context label the running listener was registered with.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub(crate) fn set_context(&mut self, context: Option<String>) {
        self.context = context;
    }
}

/// An emitted event as kept in the bus history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Payload.
    pub data: Value,
    /// Emission time in ms since the epoch.
    pub timestamp: i64,
}
