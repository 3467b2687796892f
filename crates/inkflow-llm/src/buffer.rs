use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::{debug, instrument, warn};

use inkflow_core::broadcast::TokenSink;
use inkflow_core::stream::StreamDelta;
use inkflow_core::tools::ToolCall;

use crate::accumulator::{MalformedCall, ToolCallAccumulator};
use crate::error::LlmError;
use crate::sse::{ParsedEvent, SseDecoder};

pub const DEFAULT_SAFETY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TOKEN_BATCH_SIZE: usize = 8;

/// Batches content tokens for live typing.
#[derive(Debug)]
pub struct TokenBuffer {
    batch_size: usize,
    text: String,
    count: usize,
}

impl TokenBuffer {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            text: String::new(),
            count: 0,
        }
    }

    /// Add a token. Returns the batched text once `batch_size` tokens are held.
    pub fn push(&mut self, token: &str) -> Option<String> {
        self.text.push_str(token);
        self.count += 1;
        if self.count >= self.batch_size {
            self.flush()
        } else {
            None
        }
    }

    /// Drain whatever is buffered.
    pub fn flush(&mut self) -> Option<String> {
        self.count = 0;
        if self.text.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.text))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Upper bound for reading the whole response.
    pub safety_timeout: Duration,
    pub token_batch_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            safety_timeout: DEFAULT_SAFETY_TIMEOUT,
            token_batch_size: DEFAULT_TOKEN_BATCH_SIZE,
        }
    }
}

/// Everything read from one response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub malformed: Vec<MalformedCall>,
    /// Ids of all streamed calls in the order the model emitted them.
    pub call_order: Vec<String>,
    pub finish_reason: Option<String>,
    /// The terminal `[DONE]` marker was seen.
    pub completed: bool,
}

impl StreamSummary {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty() || !self.malformed.is_empty()
    }

    /// Content as stored on an assistant message (`None` when empty).
    pub fn content_or_none(&self) -> Option<String> {
        (!self.content.is_empty()).then(|| self.content.clone())
    }
}

struct ResponseReader {
    decoder: SseDecoder,
    accumulator: ToolCallAccumulator,
    buffer: TokenBuffer,
    content: String,
    finish_reason: Option<String>,
    completed: bool,
}

impl ResponseReader {
    fn new(batch_size: usize) -> Self {
        Self {
            decoder: SseDecoder::new(),
            accumulator: ToolCallAccumulator::new(),
            buffer: TokenBuffer::new(batch_size),
            content: String::new(),
            finish_reason: None,
            completed: false,
        }
    }

    async fn drive<S, E>(&mut self, stream: S, sink: &dyn TokenSink) -> Result<(), LlmError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: fmt::Display + Send,
    {
        let mut stream = std::pin::pin!(stream);
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| LlmError::Transport(e.to_string()))?;
            let events = self.decoder.push(&bytes);
            self.apply(events, sink).await?;
            if self.completed {
                break;
            }
        }
        if !self.completed {
            let events = self.decoder.finish();
            self.apply(events, sink).await?;
        }
        self.flush_to(sink).await;
        Ok(())
    }

    async fn apply(&mut self, events: Vec<ParsedEvent>, sink: &dyn TokenSink) -> Result<(), LlmError> {
        for event in events {
            match event {
                ParsedEvent::Done => {
                    self.completed = true;
                    return Ok(());
                }
                ParsedEvent::Delta(StreamDelta::Content(text)) => {
                    self.content.push_str(&text);
                    if let Some(batch) = self.buffer.push(&text) {
                        sink.flush_tokens(&batch).await;
                    }
                }
                ParsedEvent::Delta(StreamDelta::ToolCall(delta)) => self.accumulator.push(&delta),
                ParsedEvent::Delta(StreamDelta::Finish(reason)) => self.finish_reason = Some(reason),
                ParsedEvent::Delta(StreamDelta::ProviderError(message)) => {
                    return Err(LlmError::Provider(message));
                }
            }
        }
        Ok(())
    }

    async fn flush_to(&mut self, sink: &dyn TokenSink) {
        if let Some(rest) = self.buffer.flush() {
            sink.flush_tokens(&rest).await;
        }
    }

    fn into_summary(self) -> StreamSummary {
        let calls = self.accumulator.finish();
        StreamSummary {
            content: self.content,
            tool_calls: calls.ready,
            malformed: calls.malformed,
            call_order: calls.order,
            finish_reason: self.finish_reason,
            completed: self.completed,
        }
    }
}

/// Read one streamed response to completion.
///
/// Content tokens are forwarded to `sink` in batches. The whole read races
/// `config.safety_timeout`; if the timer wins, the buffered tokens are flushed
/// and [`LlmError::Timeout`] carries what was read so far.
#[instrument(skip_all, fields(timeout_ms = config.safety_timeout.as_millis() as u64))]
pub async fn read_response<S, E>(stream: S, sink: &dyn TokenSink, config: &StreamConfig) -> Result<StreamSummary, LlmError>
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: fmt::Display + Send,
{
    let mut reader = ResponseReader::new(config.token_batch_size);

    let finished = {
        let read = reader.drive(stream, sink);
        tokio::pin!(read);
        tokio::select! {
            res = &mut read => Some(res),
            () = tokio::time::sleep(config.safety_timeout) => None,
        }
    };

    match finished {
        Some(Ok(())) => {
            let summary = reader.into_summary();
            debug!(
                content_len = summary.content.len(),
                tool_calls = summary.tool_calls.len(),
                malformed = summary.malformed.len(),
                completed = summary.completed,
                "response read"
            );
            Ok(summary)
        }
        Some(Err(e)) => {
            warn!(error = %e, kind = e.error_kind(), "response stream failed");
            Err(e)
        }
        None => {
            reader.flush_to(sink).await;
            let partial = reader.into_summary();
            warn!(
                timeout_ms = config.safety_timeout.as_millis() as u64,
                partial_len = partial.content.len(),
                "response stream exceeded safety timeout"
            );
            Err(LlmError::Timeout {
                after: config.safety_timeout,
                partial: Box::new(partial),
            })
        }
    }
}
