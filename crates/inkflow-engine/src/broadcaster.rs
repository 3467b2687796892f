//! Re-streams text to live viewers of a resource in small, word-aligned chunks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use inkflow_core::broadcast::{BroadcastError, ChunkPosition, Publisher, StreamChunk, TokenSink};

pub const DEFAULT_CHUNK_SIZE: usize = 80;
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(15);

/// Split `text` into chunks of about `target` characters.
///
/// Each word travels with the whitespace that follows it, so chunk boundaries
/// fall on whitespace and concatenating the chunks gives back `text`. A word
/// longer than `target` becomes a chunk of its own.
pub fn chunk_text(text: &str, target: usize) -> Vec<String> {
    let target = target.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for piece in word_pieces(text) {
        let piece_len = piece.chars().count();
        if current_len > 0 && current_len + piece_len > target {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.push_str(piece);
        current_len += piece_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Word plus trailing whitespace. Leading whitespace stays with the first piece.
fn word_pieces(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut in_space = false;
    let mut seen_word = false;

    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            in_space = true;
        } else {
            if in_space && seen_word {
                pieces.push(&text[start..i]);
                start = i;
            }
            in_space = false;
            seen_word = true;
        }
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub chunks_sent: usize,
    pub total_chunks: usize,
    /// Subscribers at the start of the stream.
    pub subscribers: usize,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct ChunkedBroadcaster {
    publisher: Arc<dyn Publisher>,
    chunk_size: usize,
    delay: Duration,
}

impl ChunkedBroadcaster {
    pub fn new(publisher: Arc<dyn Publisher>, chunk_size: usize, delay: Duration) -> Self {
        Self {
            publisher,
            chunk_size: chunk_size.max(1),
            delay,
        }
    }

    pub fn with_defaults(publisher: Arc<dyn Publisher>) -> Self {
        Self::new(publisher, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_DELAY)
    }

    pub async fn broadcast_text(&self, resource_id: &str, text: &str, position: ChunkPosition) -> BroadcastReport {
        let chunks = chunk_text(text, self.chunk_size);
        self.stream(resource_id, &chunks, position).await
    }

    /// Publish `chunks` in order, then an `end` event. Never fails: a publish
    /// error stops the stream and is reported to viewers as an `error` event.
    #[instrument(skip(self, chunks), fields(total = chunks.len()))]
    pub async fn stream(&self, resource_id: &str, chunks: &[String], position: ChunkPosition) -> BroadcastReport {
        let subscribers = self.publisher.subscriber_count(resource_id);
        if subscribers == 0 {
            warn!("no subscribers for resource, streaming anyway");
        }

        let mut report = BroadcastReport {
            total_chunks: chunks.len(),
            subscribers,
            ..Default::default()
        };
        if let Err(e) = self.send_all(resource_id, chunks, position, &mut report.chunks_sent).await {
            warn!(error = %e, sent = report.chunks_sent, "broadcast interrupted");
            let notice = StreamChunk::error(e.to_string(), report.chunks_sent, chunks.len());
            self.publish_best_effort(resource_id, notice).await;
            report.error = Some(e.to_string());
        } else {
            debug!(sent = report.chunks_sent, "broadcast complete");
        }
        report
    }

    async fn send_all(
        &self,
        resource_id: &str,
        chunks: &[String],
        position: ChunkPosition,
        sent: &mut usize,
    ) -> Result<(), BroadcastError> {
        let total = chunks.len();
        for (index, data) in chunks.iter().enumerate() {
            self.publisher
                .publish(resource_id, StreamChunk::chunk(data.as_str(), position, index, total))
                .await?;
            *sent += 1;
            if index + 1 < total && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
        self.publisher
            .publish(resource_id, StreamChunk::end(position, total))
            .await
    }

    /// Non-critical publish. Viewers may already be gone, so failures are
    /// logged and dropped here and nowhere else.
    async fn publish_best_effort(&self, resource_id: &str, chunk: StreamChunk) {
        if let Err(e) = self.publisher.publish(resource_id, chunk).await {
            debug!(resource_id, error = %e, "best-effort publish dropped");
        }
    }

    /// Token sink that types content into `resource_id` at the cursor.
    pub fn live(&self, resource_id: impl Into<String>) -> LiveTyping {
        LiveTyping {
            broadcaster: self.clone(),
            resource_id: resource_id.into(),
            sent: AtomicUsize::new(0),
        }
    }
}

/// Publishes batched tokens as they arrive from the model.
pub struct LiveTyping {
    broadcaster: ChunkedBroadcaster,
    resource_id: String,
    sent: AtomicUsize,
}

impl LiveTyping {
    pub fn chunks_sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    /// Close the live stream with an `end` event.
    pub async fn finish(&self) {
        let total = self.chunks_sent();
        self.broadcaster
            .publish_best_effort(&self.resource_id, StreamChunk::end(ChunkPosition::Cursor, total))
            .await;
    }
}

#[async_trait]
impl TokenSink for LiveTyping {
    async fn flush_tokens(&self, text: &str) {
        let index = self.sent.fetch_add(1, Ordering::Relaxed);
        let chunk = StreamChunk::chunk(text, ChunkPosition::Cursor, index, index + 1);
        self.broadcaster.publish_best_effort(&self.resource_id, chunk).await;
    }
}
