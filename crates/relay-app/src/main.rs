//! # relay
//!
//! Runs the Relay runtime headless: loads settings, builds the
//! [`AppContext`], keeps the state tree in step with the backend socket and
//! logs bus traffic until Ctrl-C.

#![deny(unsafe_code)]

mod bridge;
mod context;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use relay_bus::{EventBus, ListenerOptions, Unsubscribe};
use relay_core::events::ALL_EVENTS;
use relay_settings::RelaySettings;

use crate::bridge::StatusBridge;
use crate::context::AppContext;

/// Relay runtime.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Reactive runtime core for the test-orchestration dashboard")]
struct Cli {
    /// Socket URL (`ws://` or `wss://`). Derived from the origin when omitted.
    #[arg(long)]
    url: Option<String>,

    /// Page origin the socket URL is derived from.
    #[arg(long)]
    origin: Option<String>,

    /// Extra topic to subscribe to (repeatable).
    #[arg(long = "topic")]
    topics: Vec<String>,

    /// Log level (`RUST_LOG` overrides).
    #[arg(long)]
    log_level: Option<String>,

    /// Verbose bus and socket diagnostics.
    #[arg(long)]
    debug: bool,

    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,
}

impl Cli {
    /// Layer the flags over loaded settings.
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(url) = &self.url {
            settings.websocket.url = Some(url.clone());
        }
        if let Some(origin) = &self.origin {
            settings.websocket.origin.clone_from(origin);
        }
        for topic in &self.topics {
            if !settings.websocket.default_topics.contains(topic) {
                settings.websocket.default_topics.push(topic.clone());
            }
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.debug {
            settings.bus.debug = true;
            settings.websocket.debug = true;
        }
    }

    fn load_settings(&self) -> Result<RelaySettings> {
        let path = self
            .settings
            .clone()
            .unwrap_or_else(relay_settings::settings_path);
        let mut settings = relay_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        self.apply(&mut settings);
        Ok(settings)
    }
}

/// Log every catalogued event at debug level.
fn log_traffic(bus: &EventBus) -> Vec<Unsubscribe> {
    ALL_EVENTS
        .iter()
        .map(|&event_type| {
            bus.on(
                event_type,
                |e| {
                    tracing::debug!(event_type = %e.event_type, data = %e.data, "bus event");
                    Ok(())
                },
                ListenerOptions::with_priority(i32::MIN),
            )
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    if settings.logging.json {
        relay_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        relay_core::logging::init_subscriber(&settings.logging.level);
    }

    let ctx = AppContext::new(&settings);
    let bridge = StatusBridge::install(&ctx.bus, &ctx.state);
    let _traffic = log_traffic(&ctx.bus);

    // A failed first open is retried in the background.
    if let Err(err) = ctx.ws.connect(None).await {
        tracing::warn!(error = %err, "initial connection failed, retrying in background");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    ctx.ws.disconnect();
    bridge.uninstall();
    tracing::info!(metrics = ?ctx.ws.metrics(), "socket counters at shutdown");
    Ok(())
}
