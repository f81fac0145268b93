//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SyncSettings::default()`]
//! 2. If `~/.flowsync/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. [`SyncSettings::validate`]
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::SyncSettings;

/// Resolve the path to the settings file (`~/.flowsync/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".flowsync").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<SyncSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<SyncSettings> {
    let mut settings = load_file_layer(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate();
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<SyncSettings> {
    let defaults = serde_json::to_value(SyncSettings::default())?;

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
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `FLOWSYNC_*` overrides read through `lookup`.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_overrides<F>(settings: &mut SyncSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("FLOWSYNC_BASE_URL") {
        settings.api.base_url = v;
    }
    if let Some(v) = env.string("FLOWSYNC_TOKEN_ENV") {
        settings.api.token_env = v;
    }
    if let Some(v) = env.u64("FLOWSYNC_REQUEST_TIMEOUT_MS", 0, 3_600_000) {
        settings.stream.request_timeout_ms = v;
    }
    if let Some(v) = env.u64("FLOWSYNC_IDLE_TIMEOUT_MS", 0, 3_600_000) {
        settings.stream.idle_timeout_ms = v;
    }
    if let Some(v) = env.u64("FLOWSYNC_DEBOUNCE_MS", 1, 60_000) {
        settings.persistence.debounce_ms = v;
    }
    if let Some(v) = env.u64("FLOWSYNC_DRAG_SETTLE_MS", 1, 60_000) {
        settings.persistence.drag_settle_ms = v;
    }
    if let Some(v) = env.string("FLOWSYNC_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("FLOWSYNC_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Parse a string as a boolean.
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
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
