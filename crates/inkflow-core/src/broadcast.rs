use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Chunk,
    End,
    Error,
}

/// Where viewers should place streamed text in the document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkPosition {
    Start,
    End,
    Cursor,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub chunk_index: usize,
    pub total_chunks: usize,
}

/// Transient event delivered to live viewers of a resource. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<ChunkPosition>,
    pub metadata: ChunkMetadata,
}

impl StreamChunk {
    pub fn chunk(data: impl Into<String>, position: ChunkPosition, index: usize, total: usize) -> Self {
        Self {
            chunk_type: ChunkType::Chunk,
            data: Some(data.into()),
            position: Some(position),
            metadata: ChunkMetadata::now(index, total),
        }
    }

    pub fn end(position: ChunkPosition, total: usize) -> Self {
        Self {
            chunk_type: ChunkType::End,
            data: None,
            position: Some(position),
            metadata: ChunkMetadata::now(total, total),
        }
    }

    pub fn error(message: impl Into<String>, index: usize, total: usize) -> Self {
        Self {
            chunk_type: ChunkType::Error,
            data: Some(message.into()),
            position: None,
            metadata: ChunkMetadata::now(index, total),
        }
    }
}

impl ChunkMetadata {
    fn now(chunk_index: usize, total_chunks: usize) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            chunk_index,
            total_chunks,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("publish to {resource_id} failed: {reason}")]
    Publish { resource_id: String, reason: String },
}

/// Publish/subscribe primitive of the real-time transport.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, resource_id: &str, chunk: StreamChunk) -> Result<(), BroadcastError>;

    fn subscriber_count(&self, resource_id: &str) -> usize;
}

/// Downstream consumer of batched content tokens (live typing).
#[async_trait]
pub trait TokenSink: Send + Sync {
    async fn flush_tokens(&self, text: &str);
}
