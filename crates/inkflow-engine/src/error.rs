use std::time::Duration;

use inkflow_llm::LlmError;

/// Failure of the per-resource save queue itself (not of the guarded body).
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("operation on {resource_id} timed out after {after:?}")]
    Timeout { resource_id: String, after: Duration },
}

/// Errors from persisting one round.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// The batch was rejected before any network call, or by the server (422).
    #[error("invalid batch: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("conflict persisted after {retries} refetch retries")]
    Conflict { retries: u32 },

    #[error("network error after {attempts} attempts: {message}")]
    Network { attempts: u32, message: String },

    #[error("save timed out after {0:?}")]
    Timeout(Duration),

    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl PersistError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict { .. } => "conflict",
            Self::Network { .. } => "network",
            Self::Timeout(_) => "timeout",
            Self::Rejected { .. } => "rejected",
            Self::Transport(_) => "transport",
        }
    }
}

impl From<QueueError> for PersistError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Timeout { after, .. } => Self::Timeout(after),
        }
    }
}

/// Why a round ended in [`crate::round::RoundOutcome::Failed`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Stream(#[from] LlmError),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl EngineError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Stream(e) => e.error_kind(),
            Self::Persist(e) => e.error_kind(),
        }
    }
}
