//! Transports for the batch message protocol: HTTP against the message API,
//! or in-process against a [`MessageStore`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::task;
use tracing::debug;

use inkflow_core::batch::{
    ApiEnvelope, BatchCommit, BatchOutcome, BatchResponseData, SessionResponseData, SessionSnapshot,
    IDEMPOTENCY_KEY_HEADER, RELANCE_INDEX_HEADER,
};
use inkflow_store::{MessageStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("could not decode response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Connection, DNS and timeout failures. Only these are retried with backoff.
    pub fn is_network_class(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Commits message batches for a resource.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    async fn commit(&self, resource_id: &str, commit: &BatchCommit) -> Result<BatchOutcome, TransportError>;

    /// Current session stamp, used to refresh the concurrency guard after a conflict.
    async fn fetch_session(&self, resource_id: &str) -> Result<SessionSnapshot, TransportError>;
}

/// Asks whether an operation id has already been applied.
#[async_trait]
pub trait DuplicateCheck: Send + Sync {
    async fn is_applied(&self, resource_id: &str, operation_id: &str) -> Result<bool, TransportError>;
}

/// Client for the message API over HTTP.
#[derive(Clone)]
pub struct HttpBatchTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBatchTransport {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Network(format!("build client: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn session_url(&self, resource_id: &str) -> String {
        format!("{}/sessions/{}", self.base_url, resource_id)
    }
}

fn map_request_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() {
        TransportError::Network(e.to_string())
    } else if e.is_decode() {
        TransportError::Decode(e.to_string())
    } else {
        TransportError::Network(e.to_string())
    }
}

/// Map a non-success status to a transport error, reading the error envelope
/// when there is one.
async fn error_from_response(response: reqwest::Response) -> TransportError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let envelope: Option<ApiEnvelope<serde_json::Value>> = serde_json::from_str(&body).ok();
    let error = envelope.and_then(|e| e.error);

    match status {
        StatusCode::CONFLICT => {
            TransportError::Conflict(error.map(|e| e.message).unwrap_or(body))
        }
        StatusCode::UNPROCESSABLE_ENTITY => {
            let details = match error {
                Some(e) if !e.details.is_empty() => e.details,
                Some(e) => vec![e.message],
                None => vec![body],
            };
            TransportError::Validation(details)
        }
        StatusCode::NOT_FOUND => TransportError::NotFound(error.map(|e| e.message).unwrap_or(body)),
        _ => TransportError::Rejected {
            status: status.as_u16(),
            body,
        },
    }
}

async fn decode_data<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, TransportError> {
    let envelope: ApiEnvelope<T> = response.json().await.map_err(map_request_error)?;
    match envelope.data {
        Some(data) if envelope.success => Ok(data),
        _ => Err(TransportError::Decode("success response without data".into())),
    }
}

#[async_trait]
impl BatchTransport for HttpBatchTransport {
    async fn commit(&self, resource_id: &str, commit: &BatchCommit) -> Result<BatchOutcome, TransportError> {
        let url = format!("{}/batch-messages", self.session_url(resource_id));
        debug!(url = %url, operation_id = %commit.operation_id, "posting batch");

        let response = self
            .client
            .post(&url)
            .header(IDEMPOTENCY_KEY_HEADER, &commit.operation_id)
            .header(RELANCE_INDEX_HEADER, commit.relance_index.to_string())
            .json(commit)
            .send()
            .await
            .map_err(map_request_error)?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let data: BatchResponseData = decode_data(response).await?;
        Ok(data.into())
    }

    async fn fetch_session(&self, resource_id: &str) -> Result<SessionSnapshot, TransportError> {
        let response = self
            .client
            .get(self.session_url(resource_id))
            .send()
            .await
            .map_err(map_request_error)?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let data: SessionResponseData = decode_data(response).await?;
        Ok(data.session)
    }
}

#[async_trait]
impl DuplicateCheck for HttpBatchTransport {
    async fn is_applied(&self, resource_id: &str, operation_id: &str) -> Result<bool, TransportError> {
        let url = format!("{}/operations/{}", self.session_url(resource_id), operation_id);
        let response = self.client.get(&url).send().await.map_err(map_request_error)?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(error_from_response(response).await),
        }
    }
}

/// Commits directly into a local [`MessageStore`].
#[derive(Clone)]
pub struct StoreBatchTransport {
    store: MessageStore,
}

impl StoreBatchTransport {
    pub fn new(store: MessageStore) -> Self {
        Self { store }
    }

    /// Run a store call on the blocking pool; SQLite access is synchronous.
    async fn blocking<T, F>(&self, f: F) -> Result<T, TransportError>
    where
        F: FnOnce(&MessageStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        let result = task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| TransportError::Rejected {
                status: 500,
                body: format!("store task failed: {e}"),
            })?;
        Ok(result?)
    }
}

impl From<StoreError> for TransportError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Validation(details) => Self::Validation(details),
            StoreError::Conflict { .. } => Self::Conflict(e.to_string()),
            StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::Rejected {
                status: 500,
                body: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl BatchTransport for StoreBatchTransport {
    async fn commit(&self, resource_id: &str, commit: &BatchCommit) -> Result<BatchOutcome, TransportError> {
        let resource_id = resource_id.to_string();
        let commit = commit.clone();
        self.blocking(move |store| store.apply_batch(&resource_id, &commit)).await
    }

    async fn fetch_session(&self, resource_id: &str) -> Result<SessionSnapshot, TransportError> {
        let resource_id = resource_id.to_string();
        self.blocking(move |store| store.get_session(&resource_id)).await
    }
}

#[async_trait]
impl DuplicateCheck for StoreBatchTransport {
    async fn is_applied(&self, resource_id: &str, operation_id: &str) -> Result<bool, TransportError> {
        let resource_id = resource_id.to_string();
        let operation_id = operation_id.to_string();
        self.blocking(move |store| store.operation_applied(&resource_id, &operation_id))
            .await
    }
}
