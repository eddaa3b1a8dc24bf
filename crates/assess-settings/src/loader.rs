//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`AssessSettings::default()`]
//! 2. If `~/.assess/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `ASSESS_*` environment variable overrides
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::AssessSettings;

/// Resolve the path to the settings file (`~/.assess/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".assess").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<AssessSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<AssessSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<AssessSettings> {
    let defaults = serde_json::to_value(AssessSettings::default())?;

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

/// Apply `ASSESS_*` overrides read through `lookup`.
///
/// Out-of-range or unparseable values are ignored with a warning.
pub fn apply_env_overrides<F>(settings: &mut AssessSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("ASSESS_WS_BASE_URL") {
        settings.channel.ws_base_url = v;
    }
    if let Some(v) = read("ASSESS_RECONNECT_BASE_DELAY_MS")
        .and_then(|v| checked("ASSESS_RECONNECT_BASE_DELAY_MS", &v, parse_u64_range(&v, 100, 600_000)))
    {
        settings.channel.reconnect.base_delay_ms = v;
    }
    if let Some(v) = read("ASSESS_MAX_RECONNECT_ATTEMPTS")
        .and_then(|v| checked("ASSESS_MAX_RECONNECT_ATTEMPTS", &v, parse_u32_range(&v, 0, 100)))
    {
        settings.channel.reconnect.max_attempts = v;
    }
    if let Some(v) = read("ASSESS_DEBOUNCE_MS")
        .and_then(|v| checked("ASSESS_DEBOUNCE_MS", &v, parse_u64_range(&v, 0, 60_000)))
    {
        settings.channel.debounce_ms = v;
    }
    if let Some(v) = read("ASSESS_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

fn checked<T>(key: &str, raw: &str, parsed: Option<T>) -> Option<T> {
    if parsed.is_none() {
        warn!(key, value = %raw, "invalid env var, ignoring");
    }
    parsed
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `u32` within an inclusive range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}
