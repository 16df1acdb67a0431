//! Status bridge: keeps the state tree in step with socket events.
//!
//! - `websocket:connected` / `websocket:disconnected` → `system.connected`
//! - `system:status` → `system.healthy`
//! - `execution:updated` → upsert into `data.executions` by `id`

use std::sync::Arc;

use anyhow::{Context, bail};
use relay_bus::{EventBus, ListenerOptions, Unsubscribe};
use relay_core::events;
use relay_state::{SetOptions, StateManager};
use serde_json::Value;
use tracing::{debug, info};

const EXECUTIONS: &str = "data.executions";

/// Handles for the bridge listeners.
#[derive(Debug)]
pub struct StatusBridge {
    handles: Vec<Unsubscribe>,
}

impl StatusBridge {
    /// Register the bridge listeners on `bus`.
    pub fn install(bus: &EventBus, state: &Arc<StateManager>) -> Self {
        let mut handles = Vec::with_capacity(4);

        let s = Arc::clone(state);
        handles.push(bus.on(
            events::WEBSOCKET_CONNECTED,
            move |_| {
                s.set_connection_status(true);
                Ok(())
            },
            ListenerOptions::default(),
        ));

        let s = Arc::clone(state);
        handles.push(bus.on(
            events::WEBSOCKET_DISCONNECTED,
            move |_| {
                s.set_connection_status(false);
                Ok(())
            },
            ListenerOptions::default(),
        ));

        let s = Arc::clone(state);
        handles.push(bus.on(
            events::SYSTEM_STATUS,
            move |e| {
                let healthy = health_of(&e.data)?;
                if healthy != s.system_healthy() {
                    info!(healthy, "backend health changed");
                }
                s.set_system_health(healthy);
                Ok(())
            },
            ListenerOptions::default(),
        ));

        let s = Arc::clone(state);
        handles.push(bus.on(
            events::EXECUTION_UPDATED,
            move |e| upsert_execution(&s, &e.data),
            ListenerOptions::default(),
        ));

        Self { handles }
    }

    /// Remove every bridge listener.
    pub fn uninstall(&self) {
        for handle in &self.handles {
            handle.unsubscribe();
        }
    }
}

/// Read health from a `system_status` payload.
///
/// Accepts `{healthy: bool}` or `{status: "healthy" | "ok" | ...}`.
fn health_of(payload: &Value) -> anyhow::Result<bool> {
    if let Some(healthy) = payload.get("healthy").and_then(Value::as_bool) {
        return Ok(healthy);
    }
    match payload.get("status").and_then(Value::as_str) {
        Some(status) => Ok(matches!(status, "healthy" | "ok")),
        None => bail!("system status payload has neither `healthy` nor `status`"),
    }
}

/// Merge an execution update into `data.executions`.
///
/// An entry with the same `id` is shallow-merged; otherwise the update is
/// appended.
fn upsert_execution(state: &StateManager, update: &Value) -> anyhow::Result<()> {
    let fields = update
        .as_object()
        .context("execution update is not an object")?;
    let id = fields
        .get("id")
        .filter(|id| !id.is_null())
        .context("execution update has no id")?;

    let mut rows = match state.get(EXECUTIONS) {
        Some(Value::Array(rows)) => rows,
        _ => Vec::new(),
    };
    match rows.iter_mut().find(|row| row.get("id") == Some(id)) {
        Some(Value::Object(row)) => {
            for (key, value) in fields {
                let _ = row.insert(key.clone(), value.clone());
            }
        }
        _ => {
            debug!(%id, "tracking new execution");
            rows.push(update.clone());
        }
    }
    state.set(EXECUTIONS, Value::Array(rows), SetOptions::default());
    Ok(())
}
