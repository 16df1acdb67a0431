//! # relay-settings
//!
//! Configuration for the Relay runtime, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **User file**: `~/.relay/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `RELAY_*` overrides (highest priority)
//!
//! The application root loads the settings once and hands each component its
//! section; no global instance is kept.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{BusSettings, LoggingSettings, RelaySettings, StateSettings, WsSettings};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = RelaySettings::default();
        let path = settings_path();
        assert!(path.ends_with(".relay/settings.json"));
    }
}
