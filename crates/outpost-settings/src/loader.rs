//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`OutpostSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `OUTPOST_*` environment variable overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::OutpostSettings;

/// Resolve the default settings path (`~/.outpost/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".outpost").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<OutpostSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<OutpostSettings> {
    let mut settings = read_layered(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_layered(path: &Path) -> Result<OutpostSettings> {
    let defaults = serde_json::to_value(OutpostSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (falling back to file/default).
pub fn apply_env_overrides(settings: &mut OutpostSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

fn apply_overrides_from(settings: &mut OutpostSettings, get: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| get(name).filter(|v| !v.is_empty());
    let read_u64 = |name: &str, min: u64, max: u64| {
        let val = read(name)?;
        let parsed = parse_u64_range(&val, min, max);
        if parsed.is_none() {
            tracing::warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        parsed
    };
    let read_bool = |name: &str| {
        let val = read(name)?;
        let parsed = parse_bool(&val);
        if parsed.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        parsed
    };

    if let Some(v) = read_u64("OUTPOST_POLL_INTERVAL_MS", 1_000, 3_600_000) {
        settings.polling.interval_ms = v;
    }
    if let Some(v) = read_u64("OUTPOST_REQUEST_TIMEOUT_MS", 100, 600_000) {
        settings.polling.request_timeout_ms = v;
    }
    if let Some(v) = read_u64("OUTPOST_RECONNECT_BASE_MS", 100, 600_000) {
        settings.link.reconnect_base_delay_ms = v;
    }
    if let Some(v) = read_u64("OUTPOST_RECONNECT_MAX_MS", 100, 3_600_000) {
        settings.link.reconnect_max_delay_ms = v;
    }
    if let Some(v) = read_u64("OUTPOST_RECONNECT_MAX_ATTEMPTS", 0, 1_000) {
        settings.link.reconnect_max_attempts = v as u32;
    }
    if let Some(v) = read_u64("OUTPOST_IDLE_DWELL_SECS", 1, 86_400) {
        settings.activity.idle_dwell_secs = v;
    }
    if let Some(v) = read_u64("OUTPOST_NOTIFY_MIN_INTERVAL_MS", 0, 600_000) {
        settings.notifications.min_interval_ms = v;
    }
    if let Some(v) = read_bool("OUTPOST_TEAM_CHAT") {
        settings.notifications.team_chat = v;
    }
    if let Some(v) = read("OUTPOST_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_bool("OUTPOST_LOG_JSON") {
        settings.logging.json = v;
    }
}

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

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
