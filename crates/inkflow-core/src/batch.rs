//! Wire types of the batch message protocol, shared by the persistence client
//! and the message API.

use serde::{Deserialize, Serialize};

use crate::messages::ConversationMessage;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
pub const RELANCE_INDEX_HEADER: &str = "X-Relance-Index";

/// Body of `POST /sessions/{id}/batch-messages`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchCommit {
    pub messages: Vec<ConversationMessage>,
    pub operation_id: String,
    pub relance_index: u32,
    /// Optimistic concurrency guard: the session `updated_at` the client last saw.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_updated_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub applied: bool,
    /// The operation id had already been applied; nothing was written.
    pub duplicate: bool,
    pub messages_persisted: usize,
    pub updated_at: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub updated_at: String,
    pub message_count: u64,
    pub version: u64,
}

/// `{"success": true, "data": ...}` / `{"success": false, "error": ...}` envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: ApiErrorBody) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

/// `data` of a successful batch response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponseData {
    pub session: SessionStamp,
    pub applied: bool,
    pub duplicate: bool,
    pub messages_persisted: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStamp {
    pub updated_at: String,
}

impl From<BatchOutcome> for BatchResponseData {
    fn from(outcome: BatchOutcome) -> Self {
        Self {
            session: SessionStamp {
                updated_at: outcome.updated_at,
            },
            applied: outcome.applied,
            duplicate: outcome.duplicate,
            messages_persisted: outcome.messages_persisted,
        }
    }
}

impl From<BatchResponseData> for BatchOutcome {
    fn from(data: BatchResponseData) -> Self {
        Self {
            applied: data.applied,
            duplicate: data.duplicate,
            messages_persisted: data.messages_persisted,
            updated_at: data.session.updated_at,
        }
    }
}

/// `data` of `GET /sessions/{id}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResponseData {
    pub session: SessionSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_updated_at_is_optional_on_the_wire() {
        let commit = BatchCommit {
            messages: vec![ConversationMessage::user("hi", 0)],
            operation_id: "op_1".into(),
            relance_index: 0,
            expected_updated_at: None,
        };
        let json = serde_json::to_value(&commit).unwrap();
        assert!(json.get("expected_updated_at").is_none());
        assert_eq!(json["operation_id"], "op_1");
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn success_envelope_shape() {
        let data = BatchResponseData::from(BatchOutcome {
            applied: true,
            duplicate: false,
            messages_persisted: 3,
            updated_at: "2026-01-01T00:00:00.001Z".into(),
        });
        let json = serde_json::to_value(ApiEnvelope::ok(data)).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["session"]["updated_at"], "2026-01-01T00:00:00.001Z");
        assert_eq!(json["data"]["messages_persisted"], 3);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn error_envelope_parses() {
        let raw = r#"{"success":false,"error":{"code":"validation_failed","message":"invalid batch","details":["a","b"]}}"#;
        let env: ApiEnvelope<BatchResponseData> = serde_json::from_str(raw).unwrap();
        assert!(!env.success);
        assert!(env.data.is_none());
        assert_eq!(env.error.unwrap().details, vec!["a", "b"]);
    }

    fn parse_envelope<T: serde::de::DeserializeOwned>(raw: &str) -> ApiEnvelope<T> {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn envelope_decodes_for_any_deserializable_payload() {
        let raw = r#"{"success":true,"data":{"session":{"id":"s1","updated_at":"2026-01-01T00:00:00.000Z","message_count":2,"version":1}}}"#;
        let env: ApiEnvelope<SessionResponseData> = parse_envelope(raw);
        assert_eq!(env.data.unwrap().session.message_count, 2);
        assert!(env.error.is_none());

        let env: ApiEnvelope<SessionSnapshot> = parse_envelope(r#"{"success":false}"#);
        assert!(env.data.is_none());
    }
}
