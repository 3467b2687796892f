//! Atomic batch persistence of one round: the assistant message (optional) and
//! one tool message per call, committed as a single idempotent batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use inkflow_core::batch::BatchCommit;
use inkflow_core::messages::ConversationMessage;
use inkflow_core::tools::{ToolCall, ToolResult};

use crate::error::PersistError;
use crate::retry::{CommitState, FailReason, RetryPolicy};
use crate::transport::{BatchTransport, TransportError};

#[derive(Clone, Debug)]
pub struct PersistRequest {
    pub resource_id: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    /// Stable across retries of the same round; the server deduplicates on it.
    pub operation_id: String,
    pub relance_index: u32,
    /// Send the assistant message in this batch. Off when an earlier batch of
    /// the same round already stored it.
    pub include_assistant_message: bool,
    pub assistant_message: Option<ConversationMessage>,
    pub expected_updated_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistOutcome {
    pub applied: bool,
    pub duplicate: bool,
    pub messages_persisted: usize,
    pub updated_at: Option<String>,
    /// Network attempts used, including the successful one.
    pub attempts: u32,
}

/// Check a request before anything is sent. Returns one line per problem.
pub fn validate(request: &PersistRequest) -> Vec<String> {
    let mut problems = Vec::new();
    let calls = &request.tool_calls;
    let results = &request.tool_results;

    if request.resource_id.is_empty() {
        problems.push("resource id is empty".to_string());
    }
    if calls.len() != results.len() {
        problems.push(format!(
            "{} tool calls but {} tool results",
            calls.len(),
            results.len()
        ));
    }

    let mut call_ids = HashSet::new();
    for (i, call) in calls.iter().enumerate() {
        if call.id.is_empty() {
            problems.push(format!("tool call {i}: missing id"));
        } else if !call_ids.insert(call.id.as_str()) {
            problems.push(format!("tool call {i}: duplicate id {}", call.id));
        }
        if call.function_name.is_empty() {
            problems.push(format!("tool call {i}: missing function name"));
        }
        if let Err(e) = call.parsed_arguments() {
            problems.push(format!("tool call {i}: arguments are not valid JSON: {e}"));
        }
    }

    let mut result_ids = HashSet::new();
    for (i, result) in results.iter().enumerate() {
        if result.tool_call_id.is_empty() {
            problems.push(format!("tool result {i}: missing tool_call_id"));
        } else {
            if !result_ids.insert(result.tool_call_id.as_str()) {
                problems.push(format!("tool result {i}: duplicate tool_call_id {}", result.tool_call_id));
            }
            if !call_ids.contains(result.tool_call_id.as_str()) {
                problems.push(format!("tool result {i}: no tool call with id {}", result.tool_call_id));
            }
        }
        if result.name.is_empty() {
            problems.push(format!("tool result {i}: missing name"));
        }
        if !result.result.is_defined() {
            problems.push(format!("tool result {i}: result is null"));
        }
    }
    for id in &call_ids {
        if !result_ids.contains(id) {
            problems.push(format!("tool call {id} has no result"));
        }
    }

    if calls.is_empty() && !request.include_assistant_message {
        problems.push("nothing to persist".to_string());
    }
    problems
}

/// Build the batch in persisted order: assistant message first (when
/// included), then tool messages in call order.
pub fn build_messages(request: &PersistRequest) -> Vec<ConversationMessage> {
    let mut messages = Vec::with_capacity(request.tool_calls.len() + 1);

    if request.include_assistant_message {
        let mut assistant = request
            .assistant_message
            .clone()
            .unwrap_or_else(|| ConversationMessage::assistant(None, Vec::new(), request.relance_index));
        assistant.tool_calls = request.tool_calls.clone();
        assistant.relance_index = request.relance_index;
        messages.push(assistant);
    }

    let by_id: HashMap<&str, &ToolResult> = request
        .tool_results
        .iter()
        .map(|r| (r.tool_call_id.as_str(), r))
        .collect();
    for call in &request.tool_calls {
        if let Some(result) = by_id.get(call.id.as_str()) {
            messages.push(ConversationMessage::tool(
                call,
                result.result.to_persisted_string(),
                request.relance_index,
            ));
        }
    }
    messages
}

/// Persists rounds through a [`BatchTransport`], retrying conflicts and
/// network failures according to a [`RetryPolicy`].
#[derive(Clone)]
pub struct BatchPersister {
    transport: Arc<dyn BatchTransport>,
    policy: RetryPolicy,
}

impl BatchPersister {
    pub fn new(transport: Arc<dyn BatchTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[instrument(
        skip(self, request),
        fields(resource_id = %request.resource_id, operation_id = %request.operation_id)
    )]
    pub async fn persist(&self, request: &PersistRequest) -> Result<PersistOutcome, PersistError> {
        let problems = validate(request);
        if !problems.is_empty() {
            warn!(problems = problems.len(), first = %problems[0], "batch failed validation");
            return Err(PersistError::Validation(problems));
        }

        let mut commit = BatchCommit {
            messages: build_messages(request),
            operation_id: request.operation_id.clone(),
            relance_index: request.relance_index,
            expected_updated_at: request.expected_updated_at.clone(),
        };
        let resource_id = request.resource_id.as_str();

        let mut state = CommitState::start();
        let mut outcome = None;
        let mut last_error: Option<TransportError> = None;

        while !state.is_terminal() {
            state = match &state {
                CommitState::Attempting { attempt, .. } => {
                    match self.transport.commit(resource_id, &commit).await {
                        Ok(o) => {
                            info!(
                                attempt,
                                applied = o.applied,
                                duplicate = o.duplicate,
                                messages = o.messages_persisted,
                                "batch persisted"
                            );
                            outcome = Some(PersistOutcome {
                                applied: o.applied,
                                duplicate: o.duplicate,
                                messages_persisted: o.messages_persisted,
                                updated_at: Some(o.updated_at),
                                attempts: *attempt,
                            });
                            state.on_success()
                        }
                        Err(e) => {
                            let next = state.on_error(&e, &self.policy);
                            last_error = Some(e);
                            next
                        }
                    }
                }
                CommitState::Conflict { conflicts, .. } => {
                    // Same messages and operation id; only the guard is refreshed.
                    match self.transport.fetch_session(resource_id).await {
                        Ok(session) => commit.expected_updated_at = Some(session.updated_at),
                        Err(TransportError::NotFound(_)) => commit.expected_updated_at = None,
                        Err(e) => warn!(error = %e, "refetch after conflict failed, keeping guard"),
                    }
                    warn!(conflicts, "conflict on commit, retrying with refreshed session stamp");
                    state.resume()
                }
                CommitState::BackoffWait { attempt, delay, .. } => {
                    let error = last_error.as_ref().map(ToString::to_string).unwrap_or_default();
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after error"
                    );
                    tokio::time::sleep(*delay).await;
                    state.resume()
                }
                CommitState::Succeeded | CommitState::Failed { .. } => state.clone(),
            };
        }

        match (state, outcome) {
            (CommitState::Succeeded, Some(outcome)) => Ok(outcome),
            (CommitState::Failed { attempt, reason }, _) => {
                let err = self.failure(reason, attempt, last_error);
                warn!(error = %err, kind = err.error_kind(), "batch persistence failed");
                Err(err)
            }
            _ => Err(PersistError::Transport("commit finished without an outcome".into())),
        }
    }

    fn failure(&self, reason: FailReason, attempt: u32, last_error: Option<TransportError>) -> PersistError {
        match (reason, last_error) {
            (FailReason::ConflictsExhausted, _) => PersistError::Conflict {
                retries: self.policy.max_conflict_retries,
            },
            (FailReason::Validation, Some(TransportError::Validation(details))) => PersistError::Validation(details),
            (FailReason::AttemptsExhausted, e) => PersistError::Network {
                attempts: attempt,
                message: e.map(|e| e.to_string()).unwrap_or_default(),
            },
            (_, Some(TransportError::Rejected { status, body })) => PersistError::Rejected { status, body },
            (_, Some(TransportError::NotFound(body))) => PersistError::Rejected { status: 404, body },
            (_, Some(e)) => PersistError::Transport(e.to_string()),
            (_, None) => PersistError::Transport("commit failed".into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use inkflow_core::batch::{BatchOutcome, SessionSnapshot};
    use inkflow_core::messages::Role;
    use inkflow_core::tools::ToolResultPayload;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Replays scripted commit results and records every commit it sees.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        pub responses: Mutex<VecDeque<Result<BatchOutcome, TransportError>>>,
        pub commits: Mutex<Vec<BatchCommit>>,
        pub fetches: Mutex<u32>,
    }

    impl ScriptedTransport {
        pub fn new(responses: Vec<Result<BatchOutcome, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            })
        }
    }

    pub(crate) fn applied(messages: usize) -> BatchOutcome {
        BatchOutcome {
            applied: true,
            duplicate: false,
            messages_persisted: messages,
            updated_at: "2026-03-01T10:00:00.000Z".into(),
        }
    }

    #[async_trait]
    impl BatchTransport for ScriptedTransport {
        async fn commit(&self, _resource_id: &str, commit: &BatchCommit) -> Result<BatchOutcome, TransportError> {
            self.commits.lock().push(commit.clone());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(applied(commit.messages.len())))
        }

        async fn fetch_session(&self, resource_id: &str) -> Result<SessionSnapshot, TransportError> {
            let mut fetches = self.fetches.lock();
            *fetches += 1;
            let n = *fetches;
            Ok(SessionSnapshot {
                id: resource_id.to_string(),
                updated_at: format!("refetched-{n}"),
                message_count: 4,
                version: 2,
            })
        }
    }

    fn calls() -> Vec<ToolCall> {
        vec![
            ToolCall::new("call_a", "search", r#"{"q":"notes"}"#),
            ToolCall::new("call_b", "edit_document", r#"{"text":"hi"}"#),
        ]
    }

    fn results_reversed() -> Vec<ToolResult> {
        let c = calls();
        vec![
            ToolResult::succeeded(&c[1], json!({"ok": true}), Duration::from_millis(5)),
            ToolResult::succeeded(&c[0], ToolResultPayload::text("3 hits"), Duration::from_millis(9)),
        ]
    }

    fn request() -> PersistRequest {
        PersistRequest {
            resource_id: "session-1".into(),
            tool_calls: calls(),
            tool_results: results_reversed(),
            operation_id: "op_round_1".into(),
            relance_index: 1,
            include_assistant_message: true,
            assistant_message: Some(ConversationMessage::assistant(Some("Let me check.".into()), vec![], 1)),
            expected_updated_at: Some("2026-03-01T09:00:00.000Z".into()),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_unit: Duration::from_millis(100),
            max_conflict_retries: 2,
        }
    }

    #[test]
    fn valid_request_has_no_problems() {
        assert!(validate(&request()).is_empty());
    }

    #[test]
    fn validation_is_itemised() {
        let mut req = request();
        req.tool_calls[0].arguments = "{\"q\":".into();
        req.tool_calls[1].function_name = String::new();
        req.tool_results[0].result = ToolResultPayload(serde_json::Value::Null);
        req.tool_results[1].tool_call_id = "call_zzz".into();

        let problems = validate(&req);
        assert!(problems.iter().any(|p| p.contains("tool call 0: arguments are not valid JSON")));
        assert!(problems.iter().any(|p| p.contains("tool call 1: missing function name")));
        assert!(problems.iter().any(|p| p.contains("tool result 0: result is null")));
        assert!(problems.iter().any(|p| p.contains("no tool call with id call_zzz")));
        assert!(problems.iter().any(|p| p.contains("tool call call_a has no result")));
    }

    #[test]
    fn length_mismatch_and_duplicates() {
        let mut req = request();
        req.tool_results.pop();
        assert!(validate(&req).iter().any(|p| p == "2 tool calls but 1 tool results"));

        let mut req = request();
        req.tool_calls[1].id = "call_a".into();
        assert!(validate(&req).iter().any(|p| p.contains("duplicate id call_a")));
    }

    #[test]
    fn empty_request_without_assistant_is_rejected() {
        let mut req = request();
        req.tool_calls.clear();
        req.tool_results.clear();
        req.include_assistant_message = false;
        assert_eq!(validate(&req), vec!["nothing to persist"]);
    }

    #[test]
    fn messages_follow_call_order_not_result_order() {
        let messages = build_messages(&request());
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].content.as_deref(), Some("Let me check."));
        assert_eq!(messages[0].tool_calls, calls());
        assert_eq!(messages[1].tool_call_id.as_deref(), Some("call_a"));
        assert_eq!(messages[1].content.as_deref(), Some("3 hits"));
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("call_b"));
        assert_eq!(messages[2].content.as_deref(), Some(r#"{"ok":true}"#));
        assert!(messages.iter().all(|m| m.relance_index == 1));
        assert!(inkflow_core::messages::pairing_violations(&messages).is_empty());
    }

    #[test]
    fn assistant_message_can_be_left_out() {
        let mut req = request();
        req.include_assistant_message = false;
        let messages = build_messages(&req);
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.role == Role::Tool));
    }

    #[tokio::test]
    async fn invalid_request_never_reaches_transport() {
        let transport = ScriptedTransport::new(vec![]);
        let persister = BatchPersister::new(transport.clone(), fast_policy());
        let mut req = request();
        req.tool_results.pop();

        let err = persister.persist(&req).await.unwrap_err();
        assert!(matches!(err, PersistError::Validation(_)));
        assert!(transport.commits.lock().is_empty());
    }

    #[tokio::test]
    async fn conflict_refetches_and_retries_same_batch() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Conflict("stale".into()))]);
        let persister = BatchPersister::new(transport.clone(), fast_policy());

        let outcome = persister.persist(&request()).await.unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.attempts, 1);

        let commits = transport.commits.lock();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].operation_id, commits[1].operation_id);
        assert_eq!(commits[0].messages, commits[1].messages);
        assert_eq!(commits[1].expected_updated_at.as_deref(), Some("refetched-1"));
    }

    #[tokio::test]
    async fn conflicts_exhausted() {
        let conflict = || Err(TransportError::Conflict("stale".into()));
        let transport = ScriptedTransport::new(vec![conflict(), conflict(), conflict()]);
        let persister = BatchPersister::new(transport.clone(), fast_policy());

        let err = persister.persist(&request()).await.unwrap_err();
        assert!(matches!(err, PersistError::Conflict { retries: 2 }));
        assert_eq!(transport.commits.lock().len(), 3);
    }

    #[tokio::test]
    async fn network_errors_back_off_then_succeed() {
        tokio::time::pause();
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Network("refused".into())),
            Err(TransportError::Timeout("slow".into())),
        ]);
        let persister = BatchPersister::new(transport.clone(), fast_policy());

        let started = tokio::time::Instant::now();
        let outcome = persister.persist(&request()).await.unwrap();
        assert_eq!(outcome.attempts, 3);
        // 1 unit after the first failure, 2 after the second.
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(transport.commits.lock().len(), 3);
    }

    #[tokio::test]
    async fn network_errors_exhaust_attempts() {
        tokio::time::pause();
        let network = || Err(TransportError::Network("refused".into()));
        let transport = ScriptedTransport::new(vec![network(), network(), network()]);
        let persister = BatchPersister::new(transport.clone(), fast_policy());

        let err = persister.persist(&request()).await.unwrap_err();
        assert!(matches!(err, PersistError::Network { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn server_validation_is_not_retried() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Validation(vec!["bad pairing".into()]))]);
        let persister = BatchPersister::new(transport.clone(), fast_policy());

        let err = persister.persist(&request()).await.unwrap_err();
        assert!(matches!(err, PersistError::Validation(ref d) if d == &vec!["bad pairing".to_string()]));
        assert_eq!(transport.commits.lock().len(), 1);
    }

    #[tokio::test]
    async fn rejected_status_is_surfaced() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Rejected {
            status: 503,
            body: "maintenance".into(),
        })]);
        let persister = BatchPersister::new(transport, fast_policy());

        let err = persister.persist(&request()).await.unwrap_err();
        assert!(matches!(err, PersistError::Rejected { status: 503, .. }));
    }
}
