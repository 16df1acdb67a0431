//! Path watchers.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::error;

/// Channel that fires for every change regardless of path.
pub const WILDCARD: &str = "*";

/// What happened at the watched path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// A `set` or `update`.
    Set,
    /// A `delete`.
    Delete,
    /// The whole tree was replaced from a snapshot.
    Restore,
    /// The whole tree went back to its initial shape.
    Reset,
}

/// Passed to watcher callbacks.
#[derive(Clone, Debug, PartialEq)]
pub struct StateChange {
    /// The changed path, or `"*"` for whole-tree changes.
    pub path: String,
    /// New value; `None` after a delete.
    pub value: Option<Value>,
    /// Previous value; `None` when the path did not exist.
    pub old_value: Option<Value>,
    /// Kind of change.
    pub kind: ChangeKind,
}

impl StateChange {
    /// Whether the path was deleted.
    pub fn is_deleted(&self) -> bool {
        self.kind == ChangeKind::Delete
    }
}

/// Result returned by watcher callbacks. Errors are logged and swallowed.
pub type WatchResult = anyhow::Result<()>;

type Callback = dyn Fn(&StateChange) -> WatchResult + Send + Sync;

struct Watcher {
    id: u64,
    callback: Arc<Callback>,
}

/// Watchers keyed by exact path, plus the [`WILDCARD`] channel.
#[derive(Default)]
pub(crate) struct WatcherRegistry {
    watchers: RwLock<HashMap<String, Vec<Arc<Watcher>>>>,
    next_id: AtomicU64,
}

impl WatcherRegistry {
    pub(crate) fn add<F>(self: &Arc<Self>, path: &str, callback: F) -> Unwatch
    where
        F: Fn(&StateChange) -> WatchResult + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.watchers
            .write()
            .entry(path.to_owned())
            .or_default()
            .push(Arc::new(Watcher {
                id,
                callback: Arc::new(callback),
            }));
        Unwatch {
            registry: Arc::downgrade(self),
            path: path.to_owned(),
            id: Some(id),
            done: AtomicBool::new(false),
        }
    }

    fn remove(&self, path: &str, id: u64) {
        let mut watchers = self.watchers.write();
        if let Some(list) = watchers.get_mut(path) {
            list.retain(|w| w.id != id);
            if list.is_empty() {
                let _ = watchers.remove(path);
            }
        }
    }

    pub(crate) fn count(&self, path: &str) -> usize {
        self.watchers.read().get(path).map_or(0, Vec::len)
    }

    /// Run exact-path watchers, then wildcard watchers. A failing watcher is
    /// logged and the rest still run. No lock is held during callbacks.
    pub(crate) fn notify(&self, change: &StateChange) {
        let snapshot: Vec<Arc<Watcher>> = {
            let watchers = self.watchers.read();
            let exact = if change.path == WILDCARD {
                None
            } else {
                watchers.get(&change.path)
            };
            exact
                .into_iter()
                .chain(watchers.get(WILDCARD))
                .flatten()
                .cloned()
                .collect()
        };

        for watcher in snapshot {
            let callback = Arc::clone(&watcher.callback);
            let failure = match catch_unwind(AssertUnwindSafe(|| callback(change))) {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{err:#}"),
                Err(_) => "watcher panicked".to_owned(),
            };
            error!(path = %change.path, watcher = watcher.id, error = %failure, "state watcher failed");
        }
    }
}

/// Handle returned by `watch`. [`Unwatch::unwatch`] is idempotent; dropping
/// the handle leaves the watcher registered.
pub struct Unwatch {
    registry: Weak<WatcherRegistry>,
    path: String,
    id: Option<u64>,
    done: AtomicBool,
}

impl Unwatch {
    pub(crate) fn inert() -> Self {
        Self {
            registry: Weak::new(),
            path: String::new(),
            id: None,
            done: AtomicBool::new(true),
        }
    }

    /// Remove the watcher.
    pub fn unwatch(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let (Some(registry), Some(id)) = (self.registry.upgrade(), self.id) {
            registry.remove(&self.path, id);
        }
    }

    /// Whether the registration was rejected.
    pub fn is_inert(&self) -> bool {
        self.id.is_none()
    }
}

impl fmt::Debug for Unwatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unwatch")
            .field("path", &self.path)
            .field("id", &self.id)
            .finish()
    }
}
