//! Application root: builds every component once and hands out handles.

use std::sync::Arc;

use relay_bus::EventBus;
use relay_settings::RelaySettings;
use relay_state::StateManager;
use relay_ws::{Connector, WebSocketClient};

/// The shared runtime objects.
///
/// Built once at startup; page controllers receive clones of these handles
/// instead of reaching for globals.
#[derive(Clone, Debug)]
pub struct AppContext {
    /// The event bus every component publishes on.
    pub bus: EventBus,
    /// The application state tree.
    pub state: Arc<StateManager>,
    /// The live-update socket.
    pub ws: WebSocketClient,
}

impl AppContext {
    /// Build the runtime over the network transport.
    pub fn new(settings: &RelaySettings) -> Self {
        let bus = Self::build_bus(settings);
        let ws = WebSocketClient::new(bus.clone(), settings.websocket.clone());
        Self::assemble(bus, settings, ws)
    }

    /// Build the runtime over a custom transport.
    pub fn with_connector(settings: &RelaySettings, connector: Arc<dyn Connector>) -> Self {
        let bus = Self::build_bus(settings);
        let ws = WebSocketClient::with_connector(bus.clone(), settings.websocket.clone(), connector);
        Self::assemble(bus, settings, ws)
    }

    fn build_bus(settings: &RelaySettings) -> EventBus {
        let bus = EventBus::with_history_limit(settings.bus.history_limit);
        bus.set_debug(settings.bus.debug);
        bus
    }

    fn assemble(bus: EventBus, settings: &RelaySettings, ws: WebSocketClient) -> Self {
        let state = Arc::new(StateManager::with_settings(bus.clone(), &settings.state));
        Self { bus, state, ws }
    }
}
