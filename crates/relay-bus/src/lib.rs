//! # relay-bus
//!
//! Synchronous publish/subscribe hub that decouples page controllers, the
//! state manager and the socket client.
//!
//! - Listeners run in priority order (higher first, ties by registration)
//! - `once` listeners are removed before they are invoked
//! - A listener can stop propagation for the current dispatch
//! - Failing listeners are isolated and reported as `system:error`
//! - A bounded history of emitted events is kept for diagnostics

#![deny(unsafe_code)]

pub mod bus;
pub mod errors;
pub mod event;
pub mod subscription;

pub use bus::{DEFAULT_HISTORY_LIMIT, EventBus};
pub use errors::BusError;
pub use event::{Event, EventRecord};
pub use subscription::{HandlerResult, ListenerId, ListenerOptions, Unsubscribe};
