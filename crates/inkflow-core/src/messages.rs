use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::MessageId;
use crate::tools::ToolCall;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a conversation as it is persisted and replayed.
///
/// Consumers replay messages sequentially and expect every assistant tool call
/// to be followed by its tool message, so batches are always built in call order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub timestamp: String,
    #[serde(default)]
    pub relance_index: u32,
}

impl ConversationMessage {
    fn base(role: Role, content: Option<String>, relance_index: u32) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            timestamp: now_timestamp(),
            relance_index,
        }
    }

    pub fn user(text: impl Into<String>, relance_index: u32) -> Self {
        Self::base(Role::User, Some(text.into()), relance_index)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::base(Role::System, Some(text.into()), 0)
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>, relance_index: u32) -> Self {
        let mut msg = Self::base(Role::Assistant, content, relance_index);
        msg.tool_calls = tool_calls;
        msg
    }

    pub fn tool(call: &ToolCall, content: String, relance_index: u32) -> Self {
        let mut msg = Self::base(Role::Tool, Some(content), relance_index);
        msg.tool_call_id = Some(call.id.clone());
        msg.name = Some(call.function_name.clone());
        msg
    }
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Check the call/response pairing invariant over a message batch.
///
/// Every tool message must carry `tool_call_id` and `name`, and every tool call
/// of an assistant message must be answered exactly once by a tool message that
/// follows it. Returns one line per violation; an empty list means the batch is
/// well formed.
pub fn pairing_violations(messages: &[ConversationMessage]) -> Vec<String> {
    let mut errors = Vec::new();
    // call id -> number of tool messages answering it
    let mut open_calls: HashMap<&str, usize> = HashMap::new();
    let mut call_order: Vec<&str> = Vec::new();

    for (idx, msg) in messages.iter().enumerate() {
        match msg.role {
            Role::Assistant => {
                for call in &msg.tool_calls {
                    if call.id.is_empty() {
                        errors.push(format!("message {idx}: tool call without id"));
                        continue;
                    }
                    if open_calls.insert(call.id.as_str(), 0).is_some() {
                        errors.push(format!("message {idx}: duplicate tool call id {}", call.id));
                    } else {
                        call_order.push(call.id.as_str());
                    }
                }
            }
            Role::Tool => {
                let Some(call_id) = msg.tool_call_id.as_deref().filter(|s| !s.is_empty()) else {
                    errors.push(format!("message {idx}: tool message without tool_call_id"));
                    continue;
                };
                if msg.name.as_deref().map_or(true, str::is_empty) {
                    errors.push(format!("message {idx}: tool message {call_id} without name"));
                }
                // Answers to calls made in an earlier, already durable batch
                // are legal when the assistant message is not re-sent.
                if let Some(count) = open_calls.get_mut(call_id) {
                    *count += 1;
                    if *count > 1 {
                        errors.push(format!("message {idx}: tool call {call_id} answered more than once"));
                    }
                }
            }
            Role::System | Role::User => {}
        }
    }

    for call_id in call_order {
        if open_calls.get(call_id) == Some(&0) {
            errors.push(format!("tool call {call_id} has no tool message"));
        }
    }

    errors
}
