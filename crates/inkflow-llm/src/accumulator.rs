use std::collections::HashMap;

use inkflow_core::stream::ToolCallDelta;
use inkflow_core::tools::ToolCall;

/// Why an accumulated call cannot be executed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ToolArgumentError {
    #[error("tool call {call_id} has no function name")]
    MissingName { call_id: String },
    #[error("arguments of tool call {call_id} are not valid JSON ({len} bytes): {reason}")]
    InvalidJson {
        call_id: String,
        len: usize,
        reason: String,
    },
}

/// A call that was streamed but cannot run. It keeps its raw arguments so the
/// failure can be reported back to the model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MalformedCall {
    pub call: ToolCall,
    pub error: ToolArgumentError,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccumulatedCalls {
    /// Executable calls in first-seen order.
    pub ready: Vec<ToolCall>,
    pub malformed: Vec<MalformedCall>,
    /// Ids of every call, ready or malformed, in first-seen order.
    pub order: Vec<String>,
}

impl AccumulatedCalls {
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.malformed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ready.len() + self.malformed.len()
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    name: String,
    arguments: String,
}

/// Reassembles tool calls from streamed fragments.
///
/// Fragments are keyed by call id. A fragment without an id belongs to the
/// call last seen at the same index; if there is none, the id `call_{index}` is
/// used so reassembly stays deterministic.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: HashMap<String, PartialCall>,
    order: Vec<String>,
    index_ids: HashMap<u32, String>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &ToolCallDelta) {
        let id = match delta.id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => self
                .index_ids
                .get(&delta.index)
                .cloned()
                .unwrap_or_else(|| format!("call_{}", delta.index)),
        };
        let _ = self.index_ids.insert(delta.index, id.clone());

        let entry = self.calls.entry(id.clone()).or_insert_with(|| {
            self.order.push(id);
            PartialCall::default()
        });
        if let Some(name) = delta.name.as_deref().filter(|n| !n.is_empty()) {
            entry.name = name.to_string();
        }
        if let Some(arguments) = &delta.arguments {
            entry.arguments.push_str(arguments);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Complete accumulation and split calls into executable and malformed.
    /// Empty arguments count as `{}`.
    pub fn finish(mut self) -> AccumulatedCalls {
        let mut out = AccumulatedCalls {
            order: self.order.clone(),
            ..Default::default()
        };
        for id in self.order {
            let Some(partial) = self.calls.remove(&id) else {
                continue;
            };
            let arguments = if partial.arguments.trim().is_empty() {
                "{}".to_string()
            } else {
                partial.arguments
            };
            let call = ToolCall::new(id, partial.name, arguments);

            if call.function_name.is_empty() {
                let error = ToolArgumentError::MissingName { call_id: call.id.clone() };
                out.malformed.push(MalformedCall { call, error });
                continue;
            }
            match call.parsed_arguments() {
                Ok(_) => out.ready.push(call),
                Err(e) => {
                    let error = ToolArgumentError::InvalidJson {
                        call_id: call.id.clone(),
                        len: call.arguments.len(),
                        reason: e.to_string(),
                    };
                    out.malformed.push(MalformedCall { call, error });
                }
            }
        }
        out
    }
}
