/// Structured deltas decoded from a streamed model response.
///
/// Ordering contract per stream: (Content | ToolCall)* → Finish?, with
/// ProviderError possible at any point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamDelta {
    Content(String),
    ToolCall(ToolCallDelta),
    Finish(String),
    ProviderError(String),
}

/// A fragment of one tool call. Every field except `index` may be absent on
/// any given fragment; `arguments` holds the next slice of the JSON text.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}
