//! # relay-core
//!
//! Foundation types and utilities shared by every Relay crate.
//!
//! - **Event catalogue**: [`events`] holds the closed set of bus event names
//!   that page controllers, the state manager and the socket client agree on
//! - **Backoff**: [`retry`] computes reconnection delays
//! - **Time**: [`time`] provides millisecond wall-clock timestamps
//! - **Logging**: [`logging`] installs the `tracing` subscriber and offers an
//!   in-memory capture layer for tests

#![deny(unsafe_code)]

pub mod events;
pub mod logging;
pub mod retry;
pub mod time;

pub use events::{ALL_EVENTS, is_known_event};
pub use retry::{BackoffPolicy, calculate_backoff_delay};
pub use time::now_ms;
