//! Settings sections. Every section deserializes with defaults for missing
//! keys, so a partial user file is always valid.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InkflowSettings {
    pub server: ServerSettings,
    pub stream: StreamSettings,
    pub persistence: PersistenceSettings,
    pub queue: QueueSettings,
    pub broadcast: BroadcastSettings,
    pub tools: ToolSettings,
    pub logging: LoggingSettings,
}

impl InkflowSettings {
    /// Reject values that would make a component misbehave (zero sizes,
    /// zero timeouts).
    pub fn validate(&self) -> Result<()> {
        if self.stream.token_batch_size == 0 {
            return Err(SettingsError::InvalidValue("stream.tokenBatchSize must be > 0".into()));
        }
        if self.stream.safety_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue("stream.safetyTimeoutMs must be > 0".into()));
        }
        if self.persistence.max_attempts == 0 {
            return Err(SettingsError::InvalidValue("persistence.maxAttempts must be > 0".into()));
        }
        if self.queue.operation_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue("queue.operationTimeoutMs must be > 0".into()));
        }
        if self.tools.timeout_ms == 0 {
            return Err(SettingsError::InvalidValue("tools.timeoutMs must be > 0".into()));
        }
        if self.broadcast.chunk_size == 0 {
            return Err(SettingsError::InvalidValue("broadcast.chunkSize must be > 0".into()));
        }
        Ok(())
    }
}

/// HTTP/WebSocket server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. `0` picks an ephemeral port.
    pub port: u16,
    /// SQLite message store (relative paths resolve under `~/.inkflow`).
    pub db_path: String,
    /// Per-subscriber outbound queue depth.
    pub max_send_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9410,
            db_path: "database/messages.db".to_string(),
            max_send_queue: 256,
        }
    }
}

/// Response stream reading.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Upper bound for reading one model response.
    pub safety_timeout_ms: u64,
    /// Number of content tokens batched before a live-typing flush.
    pub token_batch_size: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            safety_timeout_ms: 30_000,
            token_batch_size: 8,
        }
    }
}

/// Batch persistence client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceSettings {
    /// Base URL of the message API. `None` commits in-process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Attempts for network-class failures (including the first).
    pub max_attempts: u32,
    /// Backoff unit; the wait before attempt n+1 is n units.
    pub backoff_unit_ms: u64,
    /// Refetch-and-retry rounds after optimistic-concurrency conflicts.
    pub max_conflict_retries: u32,
    /// Per-request HTTP timeout.
    pub request_timeout_ms: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            max_attempts: 3,
            backoff_unit_ms: 1_000,
            max_conflict_retries: 3,
            request_timeout_ms: 10_000,
        }
    }
}

/// Per-resource save queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSettings {
    /// Upper bound for one queued operation once it starts running.
    pub operation_timeout_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { operation_timeout_ms: 30_000 }
    }
}

/// Chunked re-broadcast of document deltas.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BroadcastSettings {
    /// Target chunk length in characters.
    pub chunk_size: usize,
    /// Pause between consecutive chunks.
    pub chunk_delay_ms: u64,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            chunk_size: 80,
            chunk_delay_ms: 15,
        }
    }
}

/// Tool execution during a round.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolSettings {
    /// Upper bound for a single tool call.
    pub timeout_ms: u64,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self { timeout_ms: 60_000 }
    }
}

/// Log output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-module level overrides, e.g. `{"inkflow_engine": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            modules: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = InkflowSettings::default();
        assert_eq!(s.server.port, 9410);
        assert_eq!(s.stream.safety_timeout_ms, 30_000);
        assert_eq!(s.persistence.max_attempts, 3);
        assert_eq!(s.persistence.backoff_unit_ms, 1_000);
        assert_eq!(s.queue.operation_timeout_ms, 30_000);
        assert_eq!(s.broadcast.chunk_size, 80);
        assert_eq!(s.broadcast.chunk_delay_ms, 15);
        assert_eq!(s.tools.timeout_ms, 60_000);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn camel_case_keys() {
        let json = serde_json::to_value(InkflowSettings::default()).unwrap();
        assert!(json["stream"]["safetyTimeoutMs"].is_u64());
        assert!(json["broadcast"]["chunkDelayMs"].is_u64());
        assert!(json["persistence"].get("baseUrl").is_none());
    }

    #[test]
    fn partial_section_fills_defaults() {
        let s: InkflowSettings = serde_json::from_value(serde_json::json!({
            "broadcast": { "chunkSize": 40 }
        }))
        .unwrap();
        assert_eq!(s.broadcast.chunk_size, 40);
        assert_eq!(s.broadcast.chunk_delay_ms, 15);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let mut s = InkflowSettings::default();
        s.broadcast.chunk_size = 0;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("chunkSize"));
    }
}
