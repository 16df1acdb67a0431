//! # relay-state
//!
//! The application state tree shared by every page controller.
//!
//! - [`StateManager`]: dot-path reads and writes, exact-path and wildcard
//!   watchers, memoized computed values, snapshots and batching
//! - [`SelectionSet`]: ordered id sets kept as JSON arrays in the tree
//! - Fixed-path helpers and typed accessors for the well-known slices
//!   (`activePage`, `data.*`, `ui.*`, `selections.*`, `system.*`)
//!
//! Every write is announced on the [`relay_bus::EventBus`] as
//! `data:updated` unless it was silent.

#![deny(unsafe_code)]

pub mod manager;
pub mod path;
pub mod selection;
pub mod watcher;

pub use manager::{DEFAULT_HISTORY_LIMIT, HistoryEntry, SetOptions, StateManager, initial_state};
pub use selection::SelectionSet;
pub use watcher::{ChangeKind, StateChange, Unwatch, WILDCARD, WatchResult};
