//! Reading streamed model responses: event decoding, tool call reassembly,
//! token batching and the safety timeout.

pub mod accumulator;
pub mod buffer;
pub mod error;
pub mod sse;

pub use accumulator::{AccumulatedCalls, MalformedCall, ToolArgumentError, ToolCallAccumulator};
pub use buffer::{read_response, StreamConfig, StreamSummary, TokenBuffer};
pub use error::LlmError;
pub use sse::{decode_payload, ParsedEvent, SseDecoder};
