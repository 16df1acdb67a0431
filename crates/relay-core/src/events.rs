//! Bus event names.
//!
//! Single source of truth for every event type the runtime emits or expects
//! page controllers to emit. A new event must be added here (and to
//! [`ALL_EVENTS`]) to be discoverable.

// ---------------------------------------------------------------------------
// State / data
// ---------------------------------------------------------------------------

/// A collection finished loading (`{collection, count}`).
pub const DATA_LOADED: &str = "data:loaded";
/// Any state path changed (`{path, value, oldValue}`; batch and restore variants).
pub const DATA_UPDATED: &str = "data:updated";
/// The active page changed (`{page, previous}`).
pub const PAGE_CHANGED: &str = "page:changed";
/// A selection set changed (`{kind, ids}`).
pub const SELECTION_CHANGED: &str = "selection:changed";
/// A loading flag flipped (`{key, loading}`).
pub const LOADING_CHANGED: &str = "loading:changed";
/// A filter value changed (`{key, value}`).
pub const FILTER_CHANGED: &str = "filter:changed";
/// A modal was opened (`{name, data}`).
pub const MODAL_OPENED: &str = "modal:opened";
/// A modal was closed (`{name}`).
pub const MODAL_CLOSED: &str = "modal:closed";

// ---------------------------------------------------------------------------
// Socket lifecycle
// ---------------------------------------------------------------------------

/// Socket opened (`{url, reconnected}`).
pub const WEBSOCKET_CONNECTED: &str = "websocket:connected";
/// Socket closed (`{code, reason}`).
pub const WEBSOCKET_DISCONNECTED: &str = "websocket:disconnected";
/// Transport failure (`{kind, message}`).
pub const WEBSOCKET_ERROR: &str = "websocket:error";
/// Every parsed inbound message, verbatim, `pong` included. This is the
/// `ws:message` event of the browser client, renamed to share the
/// `websocket:` prefix.
pub const WEBSOCKET_MESSAGE: &str = "websocket:message";
/// Reconnection gave up after the maximum attempt count (`{attempts}`).
pub const WEBSOCKET_RECONNECT_FAILED: &str = "websocket:reconnect_failed";

// ---------------------------------------------------------------------------
// Server push (derived from inbound message types)
// ---------------------------------------------------------------------------

/// `execution_update` message payload.
pub const EXECUTION_UPDATED: &str = "execution:updated";
/// `test_completion` message payload.
pub const TEST_COMPLETED: &str = "test:completed";
/// `system_status` message payload.
pub const SYSTEM_STATUS: &str = "system:status";
/// `vault_update` message payload.
pub const VAULT_UPDATED: &str = "vault:updated";
/// `coverage_update` message payload.
pub const COVERAGE_UPDATED: &str = "coverage:updated";

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

/// A handler failed during dispatch (`{eventType, error}`).
pub const SYSTEM_ERROR: &str = "system:error";
/// Health flag changed (`{healthy}`).
pub const SYSTEM_HEALTH_CHANGED: &str = "system:health_changed";

/// Every catalogued event name.
pub const ALL_EVENTS: &[&str] = &[
    DATA_LOADED,
    DATA_UPDATED,
    PAGE_CHANGED,
    SELECTION_CHANGED,
    LOADING_CHANGED,
    FILTER_CHANGED,
    MODAL_OPENED,
    MODAL_CLOSED,
    WEBSOCKET_CONNECTED,
    WEBSOCKET_DISCONNECTED,
    WEBSOCKET_ERROR,
    WEBSOCKET_MESSAGE,
    WEBSOCKET_RECONNECT_FAILED,
    EXECUTION_UPDATED,
    TEST_COMPLETED,
    SYSTEM_STATUS,
    VAULT_UPDATED,
    COVERAGE_UPDATED,
    SYSTEM_ERROR,
    SYSTEM_HEALTH_CHANGED,
];

/// Whether `name` is part of the catalogue.
pub fn is_known_event(name: &str) -> bool {
    ALL_EVENTS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn catalogue_has_no_duplicates() {
        let unique: HashSet<_> = ALL_EVENTS.iter().collect();
        assert_eq!(unique.len(), ALL_EVENTS.len());
    }

    #[test]
    fn names_are_namespaced() {
        for name in ALL_EVENTS {
            let (ns, rest) = name.split_once(':').unwrap();
            assert!(!ns.is_empty(), "{name}");
            assert!(!rest.is_empty(), "{name}");
        }
    }

    #[test]
    fn known_and_unknown() {
        assert!(is_known_event("data:updated"));
        assert!(is_known_event(WEBSOCKET_CONNECTED));
        assert!(!is_known_event("data:exploded"));
        assert!(!is_known_event(""));
    }
}
