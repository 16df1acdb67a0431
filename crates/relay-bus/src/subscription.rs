//! Listener registration types.

use std::fmt;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::bus::BusInner;
use crate::event::Event;

/// Result returned by listeners. An `Err` is logged and re-emitted as
/// `system:error`; it never reaches the emitter.
pub type HandlerResult = anyhow::Result<()>;

pub(crate) type Handler = dyn Fn(&mut Event) -> HandlerResult + Send + Sync;

/// Identifies one registration on the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Options accepted by [`EventBus::on`](crate::EventBus::on).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Remove the registration after its first invocation.
    pub once: bool,
    /// Higher runs first; ties keep registration order.
    pub priority: i32,
    /// Opaque label exposed to the handler through [`Event::context`].
    pub context: Option<String>,
}

impl ListenerOptions {
    /// Default options with the given priority.
    #[must_use]
    pub fn with_priority(priority: i32) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    /// Attach a context label.
    #[must_use]
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Handle returned by `on`/`once`.
///
/// Calling [`Unsubscribe::unsubscribe`] removes the registration; further
/// calls do nothing. Dropping the handle does **not** unsubscribe.
pub struct Unsubscribe {
    bus: Weak<BusInner>,
    event_type: String,
    id: Option<ListenerId>,
    done: AtomicBool,
}

impl Unsubscribe {
    pub(crate) fn new(bus: Weak<BusInner>, event_type: &str, id: ListenerId) -> Self {
        Self {
            bus,
            event_type: event_type.to_owned(),
            id: Some(id),
            done: AtomicBool::new(false),
        }
    }

    /// A handle that refers to nothing, returned for rejected registrations.
    pub(crate) fn inert() -> Self {
        Self {
            bus: Weak::new(),
            event_type: String::new(),
            id: None,
            done: AtomicBool::new(true),
        }
    }

    /// Remove the registration. Idempotent.
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let (Some(bus), Some(id)) = (self.bus.upgrade(), self.id) {
            let _ = bus.remove(&self.event_type, id);
        }
    }

    /// The registration id, `None` for an inert handle.
    pub fn id(&self) -> Option<ListenerId> {
        self.id
    }

    /// Whether the registration was rejected.
    pub fn is_inert(&self) -> bool {
        self.id.is_none()
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("event_type", &self.event_type)
            .field("id", &self.id)
            .field("done", &self.done.load(Ordering::Relaxed))
            .finish()
    }
}
