pub mod batch;
pub mod broadcast;
pub mod ids;
pub mod messages;
pub mod stream;
pub mod tools;

pub use batch::{BatchCommit, BatchOutcome, SessionSnapshot};
pub use broadcast::{BroadcastError, ChunkPosition, ChunkType, Publisher, StreamChunk, TokenSink};
pub use ids::{ClientId, MessageId, OperationId};
pub use messages::{ConversationMessage, Role};
pub use stream::{StreamDelta, ToolCallDelta};
pub use tools::{
    AppliedOp, DocumentMutation, OpKind, TextRange, ToolCall, ToolError, ToolExecution,
    ToolExecutor, ToolResult, ToolResultPayload,
};
