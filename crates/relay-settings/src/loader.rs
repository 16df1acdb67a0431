//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If `~/.relay/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `RELAY_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::RelaySettings;

/// Resolve the path to the settings file (`~/.relay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    if !path.exists() {
        debug!(?path, "no settings file, using defaults");
        return Ok(serde_json::from_value(defaults)?);
    }

    debug!(?path, "merging settings file over defaults");
    let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_owned(),
        source,
    })?;
    let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
        path: path.to_owned(),
        source,
    })?;
    let merged = deep_merge(defaults, user);

    let mut settings: RelaySettings = serde_json::from_value(merged)?;
    enforce_ranges(&mut settings);
    Ok(settings)
}

// ── Ranges shared by the file and env layers ────────────────────────────────

const CONNECT_TIMEOUT_MS: (u64, u64) = (100, 120_000);
const HEARTBEAT_TIMEOUT_MS: (u64, u64) = (1000, 600_000);
const RECONNECT_BASE_MS: (u64, u64) = (10, 60_000);
const RECONNECT_MAX_MS: (u64, u64) = (10, 600_000);

/// Reset out-of-range timing values from the file layer to their defaults.
fn enforce_ranges(settings: &mut RelaySettings) {
    let defaults = RelaySettings::default().websocket;
    let ws = &mut settings.websocket;
    in_range(
        "connectTimeoutMs",
        &mut ws.connect_timeout_ms,
        CONNECT_TIMEOUT_MS,
        defaults.connect_timeout_ms,
    );
    in_range(
        "heartbeatTimeoutMs",
        &mut ws.heartbeat_timeout_ms,
        HEARTBEAT_TIMEOUT_MS,
        defaults.heartbeat_timeout_ms,
    );
    in_range(
        "reconnect.baseDelayMs",
        &mut ws.reconnect.base_delay_ms,
        RECONNECT_BASE_MS,
        defaults.reconnect.base_delay_ms,
    );
    in_range(
        "reconnect.maxDelayMs",
        &mut ws.reconnect.max_delay_ms,
        RECONNECT_MAX_MS,
        defaults.reconnect.max_delay_ms,
    );
}

fn in_range(key: &str, value: &mut u64, (min, max): (u64, u64), default: u64) {
    if (min..=max).contains(value) {
        return;
    }
    warn!(
        key,
        value = *value,
        min,
        max,
        default,
        "websocket setting out of range, using default"
    );
    *value = default;
}

/// Merge `overlay` into `base`: objects key by key, everything else
/// replaced, `null` in the overlay ignored.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    let (mut base, overlay) = match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => (base, overlay),
        (_, overlay) => return overlay,
    };
    for (key, value) in overlay.into_iter().filter(|(_, v)| !v.is_null()) {
        let merged = match base.remove(&key) {
            Some(existing) => deep_merge(existing, value),
            None => value,
        };
        let _ = base.insert(key, merged);
    }
    Value::Object(base)
}

/// Apply process environment overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Each variable has strict parsing rules; invalid values are logged and
/// ignored (falling back to the file/default value).
pub fn apply_overrides_from(settings: &mut RelaySettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("RELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("RELAY_LOG_JSON") {
        settings.logging.json = v;
    }

    // ── Debug (bus + socket) ────────────────────────────────────────
    if let Some(v) = env.bool("RELAY_DEBUG") {
        settings.bus.debug = v;
        settings.websocket.debug = v;
    }

    // ── Socket ──────────────────────────────────────────────────────
    if let Some(v) = env.string("RELAY_WS_URL") {
        settings.websocket.url = Some(v);
    }
    if let Some(v) = env.string("RELAY_WS_ORIGIN") {
        settings.websocket.origin = v;
    }
    if let Some(v) = env.u32("RELAY_WS_MAX_RECONNECT_ATTEMPTS", 0, 1000) {
        settings.websocket.reconnect.max_attempts = v;
    }
    if let Some(v) = env.u64("RELAY_WS_RECONNECT_BASE_MS", RECONNECT_BASE_MS) {
        settings.websocket.reconnect.base_delay_ms = v;
    }
    if let Some(v) = env.u64("RELAY_WS_HEARTBEAT_TIMEOUT_MS", HEARTBEAT_TIMEOUT_MS) {
        settings.websocket.heartbeat_timeout_ms = v;
    }
    if let Some(v) = env.string("RELAY_WS_TOPICS") {
        settings.websocket.default_topics = parse_list(&v);
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u32` within an inclusive range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Split a comma-separated list, trimming blanks.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

// ── Env readers ─────────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u32(&self, name: &str, min: u32, max: u32) -> Option<u32> {
        let val = (self.lookup)(name)?;
        let result = parse_u32_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u32 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, (min, max): (u64, u64)) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"websocket": {"path": "/ws", "debug": false}});
        let source = serde_json::json!({"websocket": {"debug": true}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["websocket"]["debug"], true);
        assert_eq!(merged["websocket"]["path"], "/ws");
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"topics": ["a", "b", "c"]});
        let source = serde_json::json!({"topics": ["z"]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["topics"], serde_json::json!(["z"]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1});
        let source = serde_json::json!({"a": null});
        assert_eq!(deep_merge(target, source)["a"], 1);
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        assert_eq!(deep_merge(target, source)["a"], 42);
    }

    // ── file layer ──────────────────────────────────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let settings = load_file_layer(Path::new("/nonexistent/relay.json")).unwrap();
        assert_eq!(settings, RelaySettings::default());
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"websocket": {"reconnect": {"maxAttempts": 3}, "defaultTopics": ["vault"]}}"#,
        )
        .unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.websocket.reconnect.max_attempts, 3);
        assert_eq!(settings.websocket.reconnect.base_delay_ms, 1000);
        assert_eq!(settings.websocket.default_topics, vec!["vault"]);
        assert_eq!(settings.bus.history_limit, 100);
    }

    #[test]
    fn out_of_range_file_timings_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"websocket": {"heartbeatTimeoutMs": 0, "connectTimeoutMs": 0,
                "reconnect": {"baseDelayMs": 2000, "maxDelayMs": 0}}}"#,
        )
        .unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.websocket.heartbeat_timeout_ms, 60_000);
        assert_eq!(settings.websocket.connect_timeout_ms, 5000);
        assert_eq!(settings.websocket.reconnect.base_delay_ms, 2000);
        assert_eq!(settings.websocket.reconnect.max_delay_ms, 30_000);
    }

    #[test]
    fn in_range_file_timings_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"websocket": {"heartbeatTimeoutMs": 1000, "connectTimeoutMs": 120000}}"#,
        )
        .unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.websocket.heartbeat_timeout_ms, 1000);
        assert_eq!(settings.websocket.connect_timeout_ms, 120_000);
    }

    #[test]
    fn invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();

        let err = load_file_layer(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Parse { .. }));
        assert!(err.to_string().contains("settings.json"));
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let mut settings = RelaySettings::default();
        apply_overrides_from(
            &mut settings,
            env_of(&[
                ("RELAY_WS_URL", "ws://10.0.0.5:9000/ws"),
                ("RELAY_WS_MAX_RECONNECT_ATTEMPTS", "4"),
                ("RELAY_WS_TOPICS", "executions, vault ,,coverage"),
                ("RELAY_DEBUG", "yes"),
                ("RELAY_LOG_LEVEL", "debug"),
            ]),
        );
        assert_eq!(settings.websocket.url.as_deref(), Some("ws://10.0.0.5:9000/ws"));
        assert_eq!(settings.websocket.reconnect.max_attempts, 4);
        assert_eq!(
            settings.websocket.default_topics,
            vec!["executions", "vault", "coverage"]
        );
        assert!(settings.bus.debug);
        assert!(settings.websocket.debug);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn invalid_env_values_ignored() {
        let mut settings = RelaySettings::default();
        apply_overrides_from(
            &mut settings,
            env_of(&[
                ("RELAY_WS_HEARTBEAT_TIMEOUT_MS", "10"),
                ("RELAY_DEBUG", "maybe"),
                ("RELAY_WS_URL", ""),
            ]),
        );
        assert_eq!(settings, RelaySettings::default());
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in ["true", "1", "yes", "ON"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in ["false", "0", "No", "off"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u32_range("5", 0, 10), Some(5));
        assert_eq!(parse_u32_range("11", 0, 10), None);
        assert_eq!(parse_u64_range("999", 1000, 2000), None);
        assert_eq!(parse_u64_range("abc", 0, 10), None);
    }

    #[test]
    fn parse_list_trims() {
        assert_eq!(parse_list(" a, b ,, c "), vec!["a", "b", "c"]);
        assert!(parse_list("").is_empty());
    }
}
