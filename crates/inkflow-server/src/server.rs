use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use inkflow_core::batch::{
    ApiEnvelope, ApiErrorBody, BatchCommit, BatchResponseData, SessionResponseData, IDEMPOTENCY_KEY_HEADER,
    RELANCE_INDEX_HEADER,
};
use inkflow_core::messages::ConversationMessage;
use inkflow_store::{Database, MessageStore, StoreError};

use crate::registry::{self, SubscriberRegistry};

/// Server configuration.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9410,
            max_send_queue: 256,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: MessageStore,
    pub registry: Arc<SubscriberRegistry>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/sessions/{id}", get(session_handler))
        .route("/sessions/{id}/batch-messages", post(batch_handler))
        .route("/sessions/{id}/messages", get(messages_handler))
        .route("/sessions/{id}/operations/{operation_id}", get(operation_handler))
        .route("/ws/{resource_id}", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server.
pub async fn start(config: ServerConfig, db: Database) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(SubscriberRegistry::new(config.max_send_queue));
    let state = AppState {
        store: MessageStore::new(db),
        registry: Arc::clone(&registry),
    };

    let router = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(host = %config.host, port = local_addr.port(), "inkflow server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        registry,
        _server: server,
    })
}

/// Handle returned by `start()`. Dropping it does not stop the server.
pub struct ServerHandle {
    pub port: u16,
    /// Publisher for live chunks to WebSocket viewers.
    pub registry: Arc<SubscriberRegistry>,
    _server: tokio::task::JoinHandle<()>,
}

/// Error response in the API envelope.
pub struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ApiErrorBody {
                code: code.to_string(),
                message: message.into(),
                details: Vec::new(),
            },
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::Conflict { .. } => StatusCode::CONFLICT,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let details = match &e {
            StoreError::Validation(problems) => problems.clone(),
            _ => Vec::new(),
        };
        Self {
            status,
            body: ApiErrorBody {
                code: e.error_kind().to_string(),
                message: e.to_string(),
                details,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(code = %self.body.code, message = %self.body.message, "request failed");
        }
        (self.status, Json(ApiEnvelope::<()>::err(self.body))).into_response()
    }
}

/// Run a store call on the blocking pool; SQLite access is synchronous.
async fn with_store<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&MessageStore) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = state.store.clone();
    let result = tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", format!("store task failed: {e}")))?;
    Ok(result?)
}

/// One entry of `GET /sessions/{id}/messages`.
#[derive(Serialize)]
struct MessageView {
    sequence: i64,
    operation_id: String,
    #[serde(flatten)]
    message: ConversationMessage,
}

async fn batch_handler(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<BatchCommit>, JsonRejection>,
) -> Result<Json<ApiEnvelope<BatchResponseData>>, ApiError> {
    let Json(mut commit) = body.map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "bad_request", e.body_text()))?;

    let header_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    match header_key {
        Some(key) if commit.operation_id.is_empty() => commit.operation_id = key,
        Some(key) if key != commit.operation_id => {
            return Err(ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "validation_failed",
                format!("{IDEMPOTENCY_KEY_HEADER} {key} does not match operation_id {}", commit.operation_id),
            ));
        }
        _ => {}
    }

    let relance = headers.get(RELANCE_INDEX_HEADER).and_then(|v| v.to_str().ok());
    debug!(
        session_id = %session_id,
        operation_id = %commit.operation_id,
        relance = relance.unwrap_or("-"),
        messages = commit.messages.len(),
        "batch received"
    );

    let outcome = with_store(&state, move |store| store.apply_batch(&session_id, &commit)).await?;

    Ok(Json(ApiEnvelope::ok(outcome.into())))
}

async fn session_handler(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ApiEnvelope<SessionResponseData>>, ApiError> {
    let session = with_store(&state, move |store| store.get_session(&session_id)).await?;
    Ok(Json(ApiEnvelope::ok(SessionResponseData { session })))
}

async fn messages_handler(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ApiEnvelope<Vec<MessageView>>>, ApiError> {
    let messages = with_store(&state, move |store| store.list_messages(&session_id))
        .await?
        .into_iter()
        .map(|stored| MessageView {
            sequence: stored.sequence,
            operation_id: stored.operation_id,
            message: stored.message,
        })
        .collect();
    Ok(Json(ApiEnvelope::ok(messages)))
}

async fn operation_handler(
    Path((session_id, operation_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    let (session, operation) = (session_id.clone(), operation_id.clone());
    if with_store(&state, move |store| store.operation_applied(&session, &operation)).await? {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("operation {operation_id} not applied to {session_id}"),
        ))
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    Path(resource_id): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, resource_id, state))
}

async fn handle_socket(socket: WebSocket, resource_id: String, state: AppState) {
    let (client_id, rx) = state.registry.register(&resource_id);
    info!(client_id = %client_id, resource_id = %resource_id, "viewer connected");
    registry::handle_ws_connection(socket, resource_id, client_id, rx, state.registry).await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "resources": state.registry.resource_count(),
        "subscribers": state.registry.total_subscribers(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        ServerConfig {
            port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = start(config(), Database::in_memory().unwrap()).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["subscribers"], 0);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found_envelope() {
        let handle = start(config(), Database::in_memory().unwrap()).await.unwrap();
        let url = format!("http://127.0.0.1:{}/sessions/nope", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 404);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let handle = start(config(), Database::in_memory().unwrap()).await.unwrap();
        let url = format!("http://127.0.0.1:{}/sessions/s1/batch-messages", handle.port);
        let resp = reqwest::Client::new()
            .post(&url)
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn mismatched_idempotency_key_is_rejected() {
        let handle = start(config(), Database::in_memory().unwrap()).await.unwrap();
        let url = format!("http://127.0.0.1:{}/sessions/s1/batch-messages", handle.port);
        let commit = BatchCommit {
            messages: vec![ConversationMessage::user("hi", 0)],
            operation_id: "op_body".into(),
            relance_index: 0,
            expected_updated_at: None,
        };
        let resp = reqwest::Client::new()
            .post(&url)
            .header(IDEMPOTENCY_KEY_HEADER, "op_header")
            .json(&commit)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 422);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn busy_store_does_not_stall_other_requests() {
        let db = Database::in_memory().unwrap();
        let handle = start(config(), db.clone()).await.unwrap();
        let base = format!("http://127.0.0.1:{}", handle.port);

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            db.with_conn(|_| {
                locked_tx.send(()).unwrap();
                std::thread::sleep(std::time::Duration::from_millis(600));
                Ok(())
            })
            .unwrap()
        });
        locked_rx.recv().unwrap();

        let waiting = tokio::spawn(reqwest::get(format!("{base}/sessions/s1")));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        let health = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(health.status(), 200);
        assert!(started.elapsed() < std::time::Duration::from_millis(400));

        assert_eq!(waiting.await.unwrap().unwrap().status(), 404);
        holder.join().unwrap();
    }

    #[tokio::test]
    async fn messages_listing_is_ordered() {
        let db = Database::in_memory().unwrap();
        let store = MessageStore::new(db.clone());
        store
            .apply_batch(
                "s1",
                &BatchCommit {
                    messages: vec![ConversationMessage::user("first", 0), ConversationMessage::user("second", 0)],
                    operation_id: "op_1".into(),
                    relance_index: 0,
                    expected_updated_at: None,
                },
            )
            .unwrap();

        let handle = start(config(), db).await.unwrap();
        let url = format!("http://127.0.0.1:{}/sessions/s1/messages", handle.port);
        let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0]["content"], "first");
        assert_eq!(data[1]["content"], "second");
        assert_eq!(data[0]["operation_id"], "op_1");
    }

    #[test]
    fn build_router_creates_routes() {
        let state = AppState {
            store: MessageStore::new(Database::in_memory().unwrap()),
            registry: Arc::new(SubscriberRegistry::new(32)),
        };
        let _router = build_router(state);
    }

    #[test]
    fn store_errors_map_to_statuses() {
        let cases = [
            (StoreError::Validation(vec!["x".into()]), StatusCode::UNPROCESSABLE_ENTITY),
            (
                StoreError::Conflict {
                    expected: "a".into(),
                    actual: "b".into(),
                },
                StatusCode::CONFLICT,
            ),
            (StoreError::NotFound("s".into()), StatusCode::NOT_FOUND),
            (StoreError::Database("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }
}
