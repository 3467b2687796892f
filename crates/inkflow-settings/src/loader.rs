//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`InkflowSettings::default()`]
//! 2. If `~/.inkflow/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `INKFLOW_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::InkflowSettings;

/// Root directory for inkflow state (`~/.inkflow`).
pub fn inkflow_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".inkflow")
}

/// Resolve the path to the settings file (`~/.inkflow/settings.json`).
pub fn settings_path() -> PathBuf {
    inkflow_home().join("settings.json")
}

/// Resolve a configured path: absolute paths are kept, relative ones are
/// placed under [`inkflow_home`].
pub fn resolve_path(configured: &str) -> PathBuf {
    let path = Path::new(configured);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        inkflow_home().join(path)
    }
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<InkflowSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or out-of-range values are
/// errors.
pub fn load_settings_from_path(path: &Path) -> Result<InkflowSettings> {
    let defaults = serde_json::to_value(InkflowSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: InkflowSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
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

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (file/default value stays).
pub fn apply_env_overrides(settings: &mut InkflowSettings) {
    if let Some(v) = read_env_string("INKFLOW_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("INKFLOW_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_string("INKFLOW_DB_PATH") {
        settings.server.db_path = v;
    }
    if let Some(v) = read_env_u64("INKFLOW_STREAM_TIMEOUT_MS", 100, 3_600_000) {
        settings.stream.safety_timeout_ms = v;
    }
    if let Some(v) = read_env_usize("INKFLOW_TOKEN_BATCH_SIZE", 1, 10_000) {
        settings.stream.token_batch_size = v;
    }
    if let Some(v) = read_env_string("INKFLOW_PERSIST_URL") {
        settings.persistence.base_url = Some(v);
    }
    if let Some(v) = read_env_u64("INKFLOW_PERSIST_MAX_ATTEMPTS", 1, 20) {
        settings.persistence.max_attempts = v as u32;
    }
    if let Some(v) = read_env_u64("INKFLOW_SAVE_TIMEOUT_MS", 100, 3_600_000) {
        settings.queue.operation_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("INKFLOW_TOOL_TIMEOUT_MS", 100, 3_600_000) {
        settings.tools.timeout_ms = v;
    }
    if let Some(v) = read_env_usize("INKFLOW_CHUNK_SIZE", 1, 100_000) {
        settings.broadcast.chunk_size = v;
    }
    if let Some(v) = read_env_u64("INKFLOW_CHUNK_DELAY_MS", 0, 60_000) {
        settings.broadcast.chunk_delay_ms = v;
    }
    if let Some(v) = read_env_string("INKFLOW_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("INKFLOW_LOG_JSON") {
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

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}
