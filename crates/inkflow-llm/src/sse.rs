use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use inkflow_core::stream::{StreamDelta, ToolCallDelta};

use crate::error::LlmError;

/// One unit of decoder output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParsedEvent {
    Delta(StreamDelta),
    /// `data: [DONE]` was seen. Nothing follows.
    Done,
}

/// Incremental decoder for a chat-completions style event stream.
///
/// Bytes may arrive split anywhere, including inside a multi-byte character or
/// inside a JSON payload. Output does not depend on where the splits fall.
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Trailing bytes of an incomplete UTF-8 sequence.
    utf8_tail: Vec<u8>,
    /// Text after the last newline.
    line_buf: String,
    /// Data lines that did not parse on their own yet.
    pending_json: String,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed the next chunk of the response body.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ParsedEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }

        let text = self.decode_utf8(chunk);
        self.line_buf.push_str(&text);

        while let Some(pos) = self.line_buf.find('\n') {
            let line: String = self.line_buf.drain(..=pos).collect();
            self.handle_line(line.trim_end_matches(['\n', '\r']), &mut events);
            if self.done {
                self.line_buf.clear();
                break;
            }
        }
        events
    }

    /// Signal end of input. A final line without a trailing newline is still
    /// processed; a payload that never completed is dropped.
    pub fn finish(&mut self) -> Vec<ParsedEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }

        if !self.utf8_tail.is_empty() {
            let tail = std::mem::take(&mut self.utf8_tail);
            self.line_buf.push_str(&String::from_utf8_lossy(&tail));
        }
        let last = std::mem::take(&mut self.line_buf);
        let last = last.trim_end_matches('\r');
        if !last.is_empty() {
            self.handle_line(last, &mut events);
        }
        if !self.pending_json.is_empty() {
            debug!(
                buffered = self.pending_json.len(),
                "stream ended with an incomplete payload, dropping it"
            );
            self.pending_json.clear();
        }
        self.done = true;
        events
    }

    fn decode_utf8(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.utf8_tail);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            self.utf8_tail = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<ParsedEvent>) {
        // event:, id:, retry:, comments and blank lines carry nothing we use
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.strip_prefix(' ').unwrap_or(data);

        if data.trim() == "[DONE]" {
            if !self.pending_json.is_empty() {
                debug!(buffered = self.pending_json.len(), "done marker with incomplete payload pending");
                self.pending_json.clear();
            }
            self.done = true;
            events.push(ParsedEvent::Done);
            return;
        }
        if data.trim().is_empty() {
            return;
        }

        let candidate = if self.pending_json.is_empty() {
            data.to_string()
        } else {
            format!("{}{}", self.pending_json, data)
        };

        match serde_json::from_str::<Value>(&candidate) {
            Ok(value) => {
                self.pending_json.clear();
                events.extend(decode_payload(value).into_iter().map(ParsedEvent::Delta));
            }
            Err(e) => {
                let err = LlmError::StreamParse(e.to_string());
                debug!(error = %err, buffered = candidate.len(), "buffering partial payload");
                self.pending_json = candidate;
            }
        }
    }
}

/// Turn one parsed payload into stream deltas.
///
/// A top-level `error` object wins over anything else in the payload.
pub fn decode_payload(value: Value) -> Vec<StreamDelta> {
    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| error.as_str().map(str::to_string))
            .unwrap_or_else(|| error.to_string());
        return vec![StreamDelta::ProviderError(message)];
    }

    let payload: ChunkPayload = match serde_json::from_value(value) {
        Ok(p) => p,
        Err(e) => {
            debug!(error = %e, "payload has unexpected shape, skipping");
            return Vec::new();
        }
    };

    let mut deltas = Vec::new();
    for choice in payload.choices.unwrap_or_default() {
        if let Some(delta) = choice.delta {
            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                deltas.push(StreamDelta::Content(content));
            }
            for (position, call) in delta.tool_calls.unwrap_or_default().into_iter().enumerate() {
                let function = call.function.unwrap_or_default();
                deltas.push(StreamDelta::ToolCall(ToolCallDelta {
                    index: call.index.unwrap_or(position as u32),
                    id: call.id.filter(|id| !id.is_empty()),
                    name: function.name.filter(|n| !n.is_empty()),
                    arguments: function.arguments,
                }));
            }
        }
        if let Some(reason) = choice.finish_reason {
            deltas.push(StreamDelta::Finish(reason));
        }
    }
    deltas
}

// --- Deserialization types for streamed chunks ---

#[derive(Deserialize)]
struct ChunkPayload {
    choices: Option<Vec<ChoicePayload>>,
}

#[derive(Deserialize)]
struct ChoicePayload {
    delta: Option<DeltaPayload>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct DeltaPayload {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallPayload>>,
}

#[derive(Deserialize)]
struct ToolCallPayload {
    index: Option<u32>,
    id: Option<String>,
    function: Option<FunctionPayload>,
}

#[derive(Default, Deserialize)]
struct FunctionPayload {
    name: Option<String>,
    arguments: Option<String>,
}
