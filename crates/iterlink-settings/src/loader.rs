//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SyncSettings::default()`]
//! 2. If `~/.iterlink/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `ITERLINK_*` environment overrides (highest priority)
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

/// Root directory for iterlink state (`~/.iterlink`).
pub fn iterlink_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".iterlink")
}

/// Resolve the path to the settings file (`~/.iterlink/settings.json`).
pub fn settings_path() -> PathBuf {
    iterlink_dir().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<SyncSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a merged result that
/// fails [`SyncSettings::validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SyncSettings> {
    let mut settings = merge_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn merge_file(path: &Path) -> Result<SyncSettings> {
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

/// Apply `ITERLINK_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut SyncSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides using `lookup` as the variable source.
///
/// Invalid or out-of-range values are logged and ignored, leaving the
/// file/default value in place.
pub fn apply_overrides_from(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("ITERLINK_SERVER_URL") {
        settings.server.url = v;
    }
    if let Some(v) = env.u64("ITERLINK_HEARTBEAT_INTERVAL_MS", 1000, 600_000) {
        settings.server.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.string("ITERLINK_DEFAULT_INSTANCE") {
        settings.server.default_instance = v;
    }

    // ── Reconnect ───────────────────────────────────────────────────
    if let Some(v) = env.u64("ITERLINK_RECONNECT_INITIAL_DELAY_MS", 10, 600_000) {
        settings.reconnect.initial_delay_ms = v;
    }
    if let Some(v) = env.u64("ITERLINK_RECONNECT_MAX_DELAY_MS", 10, 3_600_000) {
        settings.reconnect.max_delay_ms = v;
    }
    if let Some(v) = env.u64("ITERLINK_RECONNECT_MAX_ATTEMPTS", 1, 10_000) {
        settings.reconnect.max_attempts = v as u32;
    }

    // ── Store ───────────────────────────────────────────────────────
    if let Some(v) = env.string("ITERLINK_DB_PATH") {
        settings.store.db_path = PathBuf::from(v);
    }
    if let Some(v) = env.u64("ITERLINK_DB_POOL_SIZE", 1, 64) {
        settings.store.pool_size = v as u32;
    }

    // ── Write queue ─────────────────────────────────────────────────
    if let Some(v) = env.u64("ITERLINK_WRITE_MAX_RETRIES", 0, 20) {
        settings.write_queue.max_retries = v as u32;
    }
    if let Some(v) = env.u64("ITERLINK_WRITE_RETRY_BASE_DELAY_MS", 1, 60_000) {
        settings.write_queue.retry_base_delay_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("ITERLINK_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("ITERLINK_LOG_JSON") {
        settings.logging.json = v;
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

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

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
            tracing::warn!(key = name, value = %val, min, max, "invalid integer env var, ignoring");
        }
        result
    }
}
