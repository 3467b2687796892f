use std::time::Duration;

use crate::buffer::StreamSummary;

/// Errors from reading one streamed model response.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// A payload that could not be parsed yet. Buffered and retried with the
    /// next line; never returned from the read loop.
    #[error("stream parse error: {0}")]
    StreamParse(String),

    /// The safety timeout fired. Everything read so far is carried along so
    /// the caller can deliver it.
    #[error("stream timed out after {after:?}")]
    Timeout {
        after: Duration,
        partial: Box<StreamSummary>,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider error: {0}")]
    Provider(String),
}

impl LlmError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Content and tool calls read before a timeout, if any.
    pub fn partial(&self) -> Option<&StreamSummary> {
        match self {
            Self::Timeout { partial, .. } => Some(partial),
            _ => None,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::StreamParse(_) => "stream_parse",
            Self::Timeout { .. } => "timeout",
            Self::Transport(_) => "transport",
            Self::Provider(_) => "provider",
        }
    }
}
