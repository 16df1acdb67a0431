//! The state manager.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use relay_bus::EventBus;
use relay_core::events;
use relay_core::time::now_ms;
use relay_settings::StateSettings;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::path;
use crate::selection::SelectionSet;
use crate::watcher::{ChangeKind, StateChange, Unwatch, WatchResult, WatcherRegistry, WILDCARD};

/// Default ring size of the change history.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// The tree a fresh manager starts with and `reset` returns to.
pub fn initial_state() -> Value {
    json!({
        "activePage": "dashboard",
        "data": {
            "suites": [],
            "tests": [],
            "executions": [],
            "results": [],
        },
        "ui": {
            "loading": {},
            "modals": {},
            "filters": {},
        },
        "selections": {
            "selectedSuiteIds": [],
            "selectedTestIds": [],
        },
        "system": {
            "healthy": true,
            "connected": false,
        },
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Options and records
// ─────────────────────────────────────────────────────────────────────────────

/// Options for [`StateManager::set`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Skip the `data:updated` bus event. Watchers still run.
    pub silent: bool,
    /// Shallow-merge into the current value when both are objects.
    pub merge: bool,
}

impl SetOptions {
    /// Silent replace.
    pub const SILENT: Self = Self {
        silent: true,
        merge: false,
    };
    /// Non-silent merge.
    pub const MERGE: Self = Self {
        silent: false,
        merge: true,
    };
}

/// One recorded write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Write time in ms since the epoch.
    pub timestamp: i64,
    /// Written path.
    pub path: String,
    /// Value before the write.
    pub old_value: Option<Value>,
    /// Value after the write; `None` for deletes.
    pub new_value: Option<Value>,
}

#[derive(Default)]
struct BatchBuffer {
    depth: usize,
    events: Vec<Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// StateManager
// ─────────────────────────────────────────────────────────────────────────────

/// Single source of truth for application state.
///
/// The tree is a JSON object addressed by dot paths. Every write runs the
/// matching watchers synchronously, then emits `data:updated` on the bus
/// unless the write was silent. Locks are released before watchers and bus
/// listeners run, so both may read and write state re-entrantly.
pub struct StateManager {
    bus: EventBus,
    tree: RwLock<Value>,
    watchers: Arc<WatcherRegistry>,
    history: Mutex<VecDeque<HistoryEntry>>,
    history_limit: usize,
    computed: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    batch: Mutex<BatchBuffer>,
}

impl StateManager {
    /// Create a manager with the default history size.
    pub fn new(bus: EventBus) -> Self {
        Self::with_history_limit(bus, DEFAULT_HISTORY_LIMIT)
    }

    /// Create a manager from settings.
    pub fn with_settings(bus: EventBus, settings: &StateSettings) -> Self {
        Self::with_history_limit(bus, settings.history_limit)
    }

    /// Create a manager keeping at most `history_limit` writes.
    pub fn with_history_limit(bus: EventBus, history_limit: usize) -> Self {
        Self {
            bus,
            tree: RwLock::new(initial_state()),
            watchers: Arc::new(WatcherRegistry::default()),
            history: Mutex::new(VecDeque::with_capacity(history_limit)),
            history_limit,
            computed: Mutex::new(HashMap::new()),
            batch: Mutex::new(BatchBuffer::default()),
        }
    }

    /// The bus this manager publishes on.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ── reads ───────────────────────────────────────────────────────────────

    /// Value at `path`, or `None` when any segment is missing.
    pub fn get(&self, path: &str) -> Option<Value> {
        let segs = path::segments(path)?;
        path::lookup(&self.tree.read(), &segs).cloned()
    }

    /// Deserialize the value at `path` into `T`; `None` when missing or of
    /// the wrong shape.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, path: &str) -> Option<T> {
        self.get(path).and_then(|v| serde_json::from_value(v).ok())
    }

    /// The whole tree.
    pub fn get_all(&self) -> Value {
        self.tree.read().clone()
    }

    // ── writes ──────────────────────────────────────────────────────────────

    /// Write `value` at `path`.
    ///
    /// Intermediate objects are created as needed and are not removed again
    /// if something later goes wrong. An empty or malformed path is ignored
    /// with a warning.
    pub fn set(&self, path: &str, value: Value, options: SetOptions) {
        let Some(segs) = path::segments(path) else {
            warn!(path, "ignoring write to invalid state path");
            return;
        };

        let (new_value, old_value) = {
            let mut tree = self.tree.write();
            let current = path::lookup(&tree, &segs);
            let new_value = if options.merge {
                path::shallow_merge(current, value)
            } else {
                value
            };
            let old_value = path::assign(&mut tree, &segs, new_value.clone());
            (new_value, old_value)
        };

        self.record(path, old_value.clone(), Some(new_value.clone()));
        self.watchers.notify(&StateChange {
            path: path.to_owned(),
            value: Some(new_value.clone()),
            old_value: old_value.clone(),
            kind: ChangeKind::Set,
        });

        if !options.silent {
            self.emit(
                events::DATA_UPDATED,
                json!({
                    "path": path,
                    "value": new_value,
                    "oldValue": old_value,
                }),
            );
        }
    }

    /// Merge-mode [`set`](Self::set).
    pub fn update(&self, path: &str, value: Value) {
        self.set(path, value, SetOptions::MERGE);
    }

    /// Remove the leaf at `path`. Empty parents stay. Returns whether
    /// something was removed; a missing path changes nothing and emits
    /// nothing.
    pub fn delete(&self, path: &str) -> bool {
        let Some(segs) = path::segments(path) else {
            warn!(path, "ignoring delete of invalid state path");
            return false;
        };
        let Some(old_value) = path::remove(&mut self.tree.write(), &segs) else {
            return false;
        };

        self.record(path, Some(old_value.clone()), None);
        self.watchers.notify(&StateChange {
            path: path.to_owned(),
            value: None,
            old_value: Some(old_value.clone()),
            kind: ChangeKind::Delete,
        });
        self.emit(
            events::DATA_UPDATED,
            json!({
                "path": path,
                "oldValue": old_value,
                "deleted": true,
            }),
        );
        true
    }

    // ── watchers ────────────────────────────────────────────────────────────

    /// Call `callback` on every change at exactly `path`, or on every change
    /// when `path` is `"*"`.
    pub fn watch<F>(&self, path: &str, callback: F) -> Unwatch
    where
        F: Fn(&StateChange) -> WatchResult + Send + Sync + 'static,
    {
        if path != WILDCARD && path::segments(path).is_none() {
            warn!(path, "rejected watcher on invalid state path");
            return Unwatch::inert();
        }
        self.watchers.add(path, callback)
    }

    /// Number of watchers on `path`.
    pub fn watcher_count(&self, path: &str) -> usize {
        self.watchers.count(path)
    }

    // ── computed values ─────────────────────────────────────────────────────

    /// Memoized `compute(tree)` under `key`.
    ///
    /// The cached value is reused until [`invalidate_computed`] is called;
    /// there is no dependency tracking. A cached value of a different type
    /// is recomputed and replaced.
    ///
    /// [`invalidate_computed`]: Self::invalidate_computed
    pub fn get_computed<T, F>(&self, key: &str, compute: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce(&Value) -> T,
    {
        let cached = self.computed.lock().get(key).cloned();
        if let Some(hit) = cached.and_then(|v| v.downcast::<T>().ok()) {
            return hit;
        }

        let tree = self.get_all();
        let value = Arc::new(compute(&tree));
        let erased: Arc<dyn Any + Send + Sync> = value.clone();
        let _ = self.computed.lock().insert(key.to_owned(), erased);
        value
    }

    /// Drop one cached computed value, or all of them with `None`.
    pub fn invalidate_computed(&self, key: Option<&str>) {
        let mut computed = self.computed.lock();
        match key {
            Some(key) => {
                let _ = computed.remove(key);
            }
            None => computed.clear(),
        }
    }

    // ── snapshots ───────────────────────────────────────────────────────────

    /// Deep copy of the tree.
    pub fn get_snapshot(&self) -> Value {
        self.get_all()
    }

    /// Replace the tree with `snapshot`.
    ///
    /// Clears computed values, notifies wildcard watchers with path `"*"`
    /// and emits `data:updated {path: "*", restored: true}`. A snapshot that
    /// is not a JSON object is rejected with a warning.
    pub fn restore_snapshot(&self, snapshot: Value) -> bool {
        if !snapshot.is_object() {
            warn!("rejected state snapshot: not an object");
            return false;
        }
        self.replace_tree(snapshot, ChangeKind::Restore);
        true
    }

    /// Return to [`initial_state`], clearing computed values and history.
    pub fn reset(&self) {
        self.history.lock().clear();
        self.replace_tree(initial_state(), ChangeKind::Reset);
    }

    fn replace_tree(&self, tree: Value, kind: ChangeKind) {
        let old = std::mem::replace(&mut *self.tree.write(), tree.clone());
        self.invalidate_computed(None);
        self.watchers.notify(&StateChange {
            path: WILDCARD.to_owned(),
            value: Some(tree),
            old_value: Some(old),
            kind,
        });
        let flag = if kind == ChangeKind::Reset {
            "reset"
        } else {
            "restored"
        };
        let mut data = json!({ "path": WILDCARD });
        data[flag] = Value::Bool(true);
        self.emit(events::DATA_UPDATED, data);
    }

    // ── batching ────────────────────────────────────────────────────────────

    /// Run `f`, collapsing every event this manager emits meanwhile into one
    /// `data:updated {batch: true, count, events}`.
    ///
    /// Nothing is emitted if `f` produced no events. Reads inside `f` see
    /// intermediate values. Nested batches fold into the outermost one. If
    /// `f` panics the collected events are discarded.
    pub fn batch<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        self.batch.lock().depth += 1;
        let _guard = BatchGuard { manager: self };
        f(self)
    }

    /// Whether a batch is open.
    pub fn in_batch(&self) -> bool {
        self.batch.lock().depth > 0
    }

    fn end_batch(&self) {
        let events = {
            let mut batch = self.batch.lock();
            batch.depth = batch.depth.saturating_sub(1);
            if batch.depth > 0 {
                return;
            }
            std::mem::take(&mut batch.events)
        };
        if std::thread::panicking() {
            debug!(count = events.len(), "discarding batched events after panic");
            return;
        }
        if events.is_empty() {
            return;
        }
        let _ = self.bus.emit(
            events::DATA_UPDATED,
            json!({
                "batch": true,
                "count": events.len(),
                "events": events,
            }),
        );
    }

    fn emit(&self, event_type: &str, data: Value) {
        {
            let mut batch = self.batch.lock();
            if batch.depth > 0 {
                batch.events.push(json!({ "type": event_type, "data": data }));
                return;
            }
        }
        let _ = self.bus.emit(event_type, data);
    }

    // ── history ─────────────────────────────────────────────────────────────

    fn record(&self, path: &str, old_value: Option<Value>, new_value: Option<Value>) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= self.history_limit {
            let _ = history.pop_front();
        }
        history.push_back(HistoryEntry {
            timestamp: now_ms(),
            path: path.to_owned(),
            old_value,
            new_value,
        });
    }

    /// Recorded writes, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().iter().cloned().collect()
    }

    /// Forget recorded writes.
    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Fixed-path helpers
    // ─────────────────────────────────────────────────────────────────────

    /// Switch the active page and emit `page:changed {page, previous}`.
    pub fn set_active_page(&self, page: &str) {
        let previous = self.get("activePage").unwrap_or(Value::Null);
        self.set("activePage", json!(page), SetOptions::default());
        self.emit(
            events::PAGE_CHANGED,
            json!({ "page": page, "previous": previous }),
        );
    }

    /// Replace `data.<collection>` and emit `data:loaded {collection, count}`.
    pub fn set_data(&self, collection: &str, rows: Value) {
        let count = rows.as_array().map_or(0, Vec::len);
        self.set(&format!("data.{collection}"), rows, SetOptions::default());
        self.emit(
            events::DATA_LOADED,
            json!({ "collection": collection, "count": count }),
        );
    }

    /// Flip `ui.loading.<key>` and emit `loading:changed {key, loading}`.
    pub fn set_loading(&self, key: &str, loading: bool) {
        self.set(&format!("ui.loading.{key}"), json!(loading), SetOptions::default());
        self.emit(
            events::LOADING_CHANGED,
            json!({ "key": key, "loading": loading }),
        );
    }

    /// Write `ui.filters.<key>` and emit `filter:changed {key, value}`.
    pub fn set_filter(&self, key: &str, value: Value) {
        self.set(&format!("ui.filters.{key}"), value.clone(), SetOptions::default());
        self.emit(events::FILTER_CHANGED, json!({ "key": key, "value": value }));
    }

    /// Mark `ui.modals.<name>` open with `data` and emit `modal:opened`.
    pub fn open_modal(&self, name: &str, data: Value) {
        self.set(
            &format!("ui.modals.{name}"),
            json!({ "open": true, "data": data.clone() }),
            SetOptions::default(),
        );
        self.emit(events::MODAL_OPENED, json!({ "name": name, "data": data }));
    }

    /// Mark `ui.modals.<name>` closed and emit `modal:closed`.
    pub fn close_modal(&self, name: &str) {
        self.set(
            &format!("ui.modals.{name}"),
            json!({ "open": false, "data": null }),
            SetOptions::default(),
        );
        self.emit(events::MODAL_CLOSED, json!({ "name": name }));
    }

    /// Toggle a suite id. Returns whether it is now selected.
    pub fn toggle_suite_selection(&self, id: &str) -> bool {
        self.toggle_selection(SUITE_SELECTION, "suites", id)
    }

    /// Toggle a test id. Returns whether it is now selected.
    pub fn toggle_test_selection(&self, id: &str) -> bool {
        self.toggle_selection(TEST_SELECTION, "tests", id)
    }

    fn toggle_selection(&self, path: &str, kind: &str, id: &str) -> bool {
        let mut set = SelectionSet::from_value(self.get(path).as_ref());
        let selected = set.toggle(id);
        self.set(path, set.to_value(), SetOptions::default());
        self.emit(
            events::SELECTION_CHANGED,
            json!({ "kind": kind, "ids": set.to_value() }),
        );
        selected
    }

    /// Empty both selection sets.
    pub fn clear_selections(&self) {
        let empty = SelectionSet::new().to_value();
        self.set(SUITE_SELECTION, empty.clone(), SetOptions::default());
        self.set(TEST_SELECTION, empty.clone(), SetOptions::default());
        self.emit(
            events::SELECTION_CHANGED,
            json!({ "kind": "all", "ids": empty }),
        );
    }

    /// Write `system.healthy` and emit `system:health_changed {healthy}`.
    pub fn set_system_health(&self, healthy: bool) {
        self.set("system.healthy", json!(healthy), SetOptions::default());
        self.emit(events::SYSTEM_HEALTH_CHANGED, json!({ "healthy": healthy }));
    }

    /// Write `system.connected` silently.
    pub fn set_connection_status(&self, connected: bool) {
        self.set("system.connected", json!(connected), SetOptions::SILENT);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Typed accessors
    // ─────────────────────────────────────────────────────────────────────

    /// The active page name.
    pub fn active_page(&self) -> Option<String> {
        self.get_as("activePage")
    }

    /// Whether `ui.loading.<key>` is set.
    pub fn is_loading(&self, key: &str) -> bool {
        self.get_as(&format!("ui.loading.{key}")).unwrap_or(false)
    }

    /// Whether any loading flag is set.
    pub fn any_loading(&self) -> bool {
        self.get("ui.loading")
            .and_then(|v| v.as_object().map(|m| m.values().any(|f| f.as_bool() == Some(true))))
            .unwrap_or(false)
    }

    /// Selected suite ids.
    pub fn selected_suite_ids(&self) -> SelectionSet {
        SelectionSet::from_value(self.get(SUITE_SELECTION).as_ref())
    }

    /// Selected test ids.
    pub fn selected_test_ids(&self) -> SelectionSet {
        SelectionSet::from_value(self.get(TEST_SELECTION).as_ref())
    }

    /// `system.healthy`, defaulting to healthy.
    pub fn system_healthy(&self) -> bool {
        self.get_as("system.healthy").unwrap_or(true)
    }

    /// `system.connected`.
    pub fn is_connected(&self) -> bool {
        self.get_as("system.connected").unwrap_or(false)
    }

    /// Number of rows in `data.<collection>`.
    pub fn data_len(&self, collection: &str) -> usize {
        self.get(&format!("data.{collection}"))
            .and_then(|v| v.as_array().map(Vec::len))
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("history_limit", &self.history_limit)
            .field("in_batch", &self.in_batch())
            .finish_non_exhaustive()
    }
}

const SUITE_SELECTION: &str = "selections.selectedSuiteIds";
const TEST_SELECTION: &str = "selections.selectedTestIds";

struct BatchGuard<'a> {
    manager: &'a StateManager,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.manager.end_batch();
    }
}
