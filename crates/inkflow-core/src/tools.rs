use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broadcast::ChunkPosition;

/// A complete tool invocation requested by the model.
///
/// `arguments` is the raw JSON text exactly as streamed; it is only parsed when
/// the call is validated or executed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function_name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, function_name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            function_name: function_name.into(),
            arguments: arguments.into(),
        }
    }

    pub fn parsed_arguments(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.arguments)
    }
}

/// Opaque tool output. Serialized to a string only at the persistence boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolResultPayload(pub Value);

impl ToolResultPayload {
    pub fn text(s: impl Into<String>) -> Self {
        Self(Value::String(s.into()))
    }

    pub fn is_defined(&self) -> bool {
        !self.0.is_null()
    }

    /// String form stored as tool message content. Strings (including strings
    /// that already hold JSON) pass through unchanged; anything else is
    /// serialized as JSON.
    pub fn to_persisted_string(&self) -> String {
        match &self.0 {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl From<Value> for ToolResultPayload {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub result: ToolResultPayload,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn succeeded(call: &ToolCall, result: impl Into<ToolResultPayload>, duration: Duration) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.function_name.clone(),
            result: result.into(),
            success: true,
            duration_ms: duration.as_millis() as u64,
            error: None,
        }
    }

    /// A failed result keeps the round history complete: the call is still
    /// answered, with the error as its content.
    pub fn failed(call: &ToolCall, error: impl Into<String>, duration: Duration) -> Self {
        let error = error.into();
        Self {
            tool_call_id: call.id.clone(),
            name: call.function_name.clone(),
            result: ToolResultPayload(serde_json::json!({ "error": error })),
            success: false,
            duration_ms: duration.as_millis() as u64,
            error: Some(error),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRange {
    pub start: usize,
    pub end: usize,
}

impl TextRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Replace,
    Delete,
}

/// One edit a tool applied to a document, with its position in the new
/// content when the tool reports it (character offsets).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedOp {
    pub kind: OpKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_after: Option<TextRange>,
}

impl AppliedOp {
    pub fn insert(range_after: TextRange) -> Self {
        Self { kind: OpKind::Insert, range_after: Some(range_after) }
    }

    pub fn replace(range_after: TextRange) -> Self {
        Self { kind: OpKind::Replace, range_after: Some(range_after) }
    }

    pub fn delete() -> Self {
        Self { kind: OpKind::Delete, range_after: None }
    }
}

/// Before/after snapshot of a document a tool changed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentMutation {
    pub document_id: String,
    pub old_content: String,
    pub new_content: String,
    #[serde(default)]
    pub applied_ops: Vec<AppliedOp>,
    #[serde(default = "default_position")]
    pub position: ChunkPosition,
}

fn default_position() -> ChunkPosition {
    ChunkPosition::End
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolExecution {
    pub result: ToolResult,
    pub mutation: Option<DocumentMutation>,
}

impl From<ToolResult> for ToolExecution {
    fn from(result: ToolResult) -> Self {
        Self { result, mutation: None }
    }
}

/// Executes completed tool calls. Concrete tools live outside this workspace.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall, arguments: Value) -> Result<ToolExecution, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}
