//! The event bus.

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use relay_core::events::SYSTEM_ERROR;
use relay_core::time::now_ms;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::errors::BusError;
use crate::event::{Event, EventRecord};
use crate::subscription::{Handler, HandlerResult, ListenerId, ListenerOptions, Unsubscribe};

/// Default ring size of the emitted-event history.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

struct Listener {
    id: ListenerId,
    handler: Arc<Handler>,
    priority: i32,
    once: bool,
    context: Option<String>,
    fired: AtomicBool,
}

pub(crate) struct BusInner {
    /// Listeners keyed by event type, sorted by priority descending.
    listeners: RwLock<HashMap<String, Vec<Arc<Listener>>>>,
    history: Mutex<VecDeque<EventRecord>>,
    history_limit: usize,
    next_id: AtomicU64,
    debug: AtomicBool,
}

impl BusInner {
    /// Remove one registration, deleting the list once it is empty.
    pub(crate) fn remove(&self, event_type: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(list) = listeners.get_mut(event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|l| l.id != id);
        let removed = list.len() < before;
        if list.is_empty() {
            let _ = listeners.remove(event_type);
        }
        removed
    }
}

/// In-process publish/subscribe hub.
///
/// Cloning is cheap and every clone shares the same listeners and history.
/// Dispatch is synchronous: [`EventBus::emit`] returns after every listener
/// has run. No lock is held while a listener runs, so listeners may
/// subscribe, unsubscribe and emit re-entrantly.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with the default history size.
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Create a bus keeping at most `history_limit` emitted events.
    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(HashMap::new()),
                history: Mutex::new(VecDeque::with_capacity(history_limit)),
                history_limit,
                next_id: AtomicU64::new(1),
                debug: AtomicBool::new(false),
            }),
        }
    }

    /// Register `handler` for `event_type`.
    ///
    /// An empty `event_type` is rejected with a warning and an inert handle.
    pub fn on<F>(&self, event_type: &str, handler: F, options: ListenerOptions) -> Unsubscribe
    where
        F: Fn(&mut Event) -> HandlerResult + Send + Sync + 'static,
    {
        if event_type.is_empty() {
            warn!("rejected listener registration: event type is empty");
            return Unsubscribe::inert();
        }

        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let listener = Arc::new(Listener {
            id,
            handler: Arc::new(handler),
            priority: options.priority,
            once: options.once,
            context: options.context,
            fired: AtomicBool::new(false),
        });

        {
            let mut listeners = self.inner.listeners.write();
            let list = listeners.entry(event_type.to_owned()).or_default();
            // After every listener of equal or higher priority.
            let pos = list
                .iter()
                .position(|l| l.priority < listener.priority)
                .unwrap_or(list.len());
            list.insert(pos, listener);
        }

        if self.is_debug() {
            debug!(event_type, %id, priority = options.priority, once = options.once, "listener registered");
        }
        Unsubscribe::new(Arc::downgrade(&self.inner), event_type, id)
    }

    /// Register a listener that runs at most once.
    pub fn once<F>(&self, event_type: &str, handler: F, options: ListenerOptions) -> Unsubscribe
    where
        F: Fn(&mut Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.on(
            event_type,
            handler,
            ListenerOptions {
                once: true,
                ..options
            },
        )
    }

    /// Remove one listener, or every listener for `event_type` when `id` is
    /// `None`. Unknown ids are ignored.
    pub fn off(&self, event_type: &str, id: Option<ListenerId>) {
        match id {
            Some(id) => {
                let _ = self.inner.remove(event_type, id);
            }
            None => {
                let _ = self.inner.listeners.write().remove(event_type);
            }
        }
    }

    /// Drop every registration on every event type.
    pub fn clear(&self) {
        self.inner.listeners.write().clear();
    }

    /// Dispatch `data` to every listener of `event_type`.
    ///
    /// Returns `false` without recording anything when nobody listens.
    /// Listener failures are logged and re-emitted as `system:error`
    /// (except failures while dispatching `system:error` itself).
    pub fn emit(&self, event_type: &str, data: Value) -> bool {
        let snapshot: Vec<Arc<Listener>> = match self.inner.listeners.read().get(event_type) {
            Some(list) if !list.is_empty() => list.clone(),
            _ => return false,
        };

        let timestamp = now_ms();
        self.record(EventRecord {
            event_type: event_type.to_owned(),
            data: data.clone(),
            timestamp,
        });
        if self.is_debug() {
            debug!(event_type, listeners = snapshot.len(), "emit");
        }

        let mut event = Event::new(event_type, data, timestamp);
        for listener in snapshot {
            if event.is_propagation_stopped() {
                break;
            }
            if listener.once {
                if listener.fired.swap(true, Ordering::SeqCst) {
                    continue;
                }
                let _ = self.inner.remove(event_type, listener.id);
            }

            event.set_context(listener.context.clone());
            let handler = Arc::clone(&listener.handler);
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(&mut event)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("{err:#}")),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };
            if let Some(message) = failure {
                self.report_failure(event_type, listener.id, &message);
            }
        }
        true
    }

    fn report_failure(&self, event_type: &str, id: ListenerId, message: &str) {
        error!(event_type, listener = %id, error = message, "event handler failed");
        if event_type == SYSTEM_ERROR {
            return;
        }
        let _ = self.emit(
            SYSTEM_ERROR,
            json!({
                "eventType": event_type,
                "error": message,
                "timestamp": now_ms(),
            }),
        );
    }

    fn record(&self, record: EventRecord) {
        if self.inner.history_limit == 0 {
            return;
        }
        let mut history = self.inner.history.lock();
        while history.len() >= self.inner.history_limit {
            let _ = history.pop_front();
        }
        history.push_back(record);
    }

    /// Whether anyone listens on `event_type`.
    pub fn has_listeners(&self, event_type: &str) -> bool {
        self.listener_count(event_type) > 0
    }

    /// Number of registrations on `event_type`.
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.inner
            .listeners
            .read()
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Event types with at least one listener, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner.listeners.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Resolve with the data of the next `event_type` emission.
    ///
    /// With a non-zero `timeout` the wait fails with [`BusError::Timeout`]
    /// once it elapses. The internal listener is removed on every exit path,
    /// including when the returned future is dropped.
    pub async fn wait_for(
        &self,
        event_type: &str,
        timeout: Option<Duration>,
    ) -> Result<Value, BusError> {
        let (tx, rx) = oneshot::channel::<Value>();
        let tx = Mutex::new(Some(tx));
        let handle = self.once(
            event_type,
            move |event| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(event.data.clone());
                }
                Ok(())
            },
            ListenerOptions::default(),
        );
        if handle.is_inert() {
            return Err(BusError::InvalidEventType);
        }
        let _guard = UnsubscribeOnDrop(handle);

        let cancelled = || BusError::Cancelled {
            event_type: event_type.to_owned(),
        };
        match timeout.filter(|d| !d.is_zero()) {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received.map_err(|_| cancelled()),
                Err(_) => Err(BusError::Timeout {
                    event_type: event_type.to_owned(),
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                }),
            },
            None => rx.await.map_err(|_| cancelled()),
        }
    }

    /// Recorded events, oldest first, optionally filtered by type and
    /// limited to the most recent `limit`.
    pub fn history(&self, event_type: Option<&str>, limit: Option<usize>) -> Vec<EventRecord> {
        let history = self.inner.history.lock();
        let matching: Vec<&EventRecord> = history
            .iter()
            .filter(|r| event_type.is_none_or(|t| r.event_type == t))
            .collect();
        let skip = limit.map_or(0, |n| matching.len().saturating_sub(n));
        matching.into_iter().skip(skip).cloned().collect()
    }

    /// Forget recorded events.
    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    /// Toggle debug logging of registrations and emits.
    pub fn set_debug(&self, enabled: bool) {
        self.inner.debug.store(enabled, Ordering::Relaxed);
    }

    /// Whether debug logging is on.
    pub fn is_debug(&self) -> bool {
        self.inner.debug.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("event_types", &self.event_types())
            .field("history_limit", &self.inner.history_limit)
            .finish()
    }
}

struct UnsubscribeOnDrop(Unsubscribe);

impl Drop for UnsubscribeOnDrop {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}
