#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid batch: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("conflict: expected updated_at {expected}, found {actual}")]
    Conflict { expected: String, actual: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl StoreError {
    /// Short classification string, also used as the API error code.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Database(_) => "database_error",
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation_failed",
            Self::Conflict { .. } => "conflict",
            Self::Serialization(_) => "serialization_error",
            Self::Io(_) => "io_error",
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
