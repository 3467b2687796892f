//! Full rounds against an in-memory message store.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};

use inkflow_core::batch::{BatchCommit, BatchOutcome, SessionSnapshot};
use inkflow_core::broadcast::{BroadcastError, Publisher, StreamChunk};
use inkflow_core::ids::OperationId;
use inkflow_core::messages::{pairing_violations, ConversationMessage, Role};
use inkflow_core::tools::{ToolCall, ToolError, ToolExecution, ToolExecutor, ToolResult};
use inkflow_engine::{
    BatchPersister, BatchTransport, ChunkedBroadcaster, PersistRequest, RetryPolicy, RoundConfig, RoundInput,
    RoundOutcome, RoundRunner, SaveQueue, StoreBatchTransport, TransportError,
};
use inkflow_llm::StreamConfig;
use inkflow_store::{Database, MessageStore};

struct EchoTools;

#[async_trait]
impl ToolExecutor for EchoTools {
    async fn execute(&self, call: &ToolCall, arguments: Value) -> Result<ToolExecution, ToolError> {
        let delay = arguments["delay_ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(ToolResult::succeeded(call, json!({"echo": arguments}), Duration::ZERO).into())
    }
}

struct NullPublisher;

#[async_trait]
impl Publisher for NullPublisher {
    async fn publish(&self, _resource_id: &str, _chunk: StreamChunk) -> Result<(), BroadcastError> {
        Ok(())
    }

    fn subscriber_count(&self, _resource_id: &str) -> usize {
        0
    }
}

/// Commits to the store, then loses the response of the first `lost` commits.
struct LossyTransport {
    inner: StoreBatchTransport,
    lost: AtomicUsize,
}

#[async_trait]
impl BatchTransport for LossyTransport {
    async fn commit(&self, resource_id: &str, commit: &BatchCommit) -> Result<BatchOutcome, TransportError> {
        let outcome = self.inner.commit(resource_id, commit).await?;
        let remaining = self.lost.load(Ordering::SeqCst);
        if remaining > 0 {
            self.lost.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Timeout("response lost".into()));
        }
        Ok(outcome)
    }

    async fn fetch_session(&self, resource_id: &str) -> Result<SessionSnapshot, TransportError> {
        self.inner.fetch_session(resource_id).await
    }
}

fn store() -> MessageStore {
    MessageStore::new(Database::in_memory().unwrap())
}

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff_unit: Duration::from_millis(20),
        max_conflict_retries: 3,
    }
}

fn runner(transport: Arc<dyn BatchTransport>, queue: Arc<SaveQueue>) -> RoundRunner {
    RoundRunner::new(
        Arc::new(EchoTools),
        BatchPersister::new(transport, policy()),
        queue,
        ChunkedBroadcaster::new(Arc::new(NullPublisher), 80, Duration::ZERO),
        RoundConfig {
            stream: StreamConfig {
                safety_timeout: Duration::from_secs(2),
                token_batch_size: 4,
            },
            tool_timeout: Duration::from_secs(5),
        },
    )
}

fn sse(payload: Value) -> String {
    format!("event: message\ndata: {payload}\n\n")
}

fn tool_response(calls: &[(&str, &str)]) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    let mut text = sse(json!({"choices": [{"delta": {"content": "Working on it."}}]}));
    for (index, (id, args)) in calls.iter().enumerate() {
        text.push_str(&sse(json!({"choices": [{"delta": {"tool_calls": [
            {"index": index, "id": id, "function": {"name": "echo", "arguments": args}}
        ]}}]})));
    }
    text.push_str(&sse(json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]})));
    text.push_str("data: [DONE]\n\n");

    // Deliver in small pieces to exercise reassembly across reads.
    let pieces: Vec<Result<Bytes, Infallible>> = text
        .into_bytes()
        .chunks(7)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    futures::stream::iter(pieces)
}

fn round<S>(session: &str, stream: S) -> RoundInput<S> {
    RoundInput {
        session_id: session.into(),
        operation_id: OperationId::new(),
        relance_index: 0,
        assistant_already_persisted: false,
        expected_updated_at: None,
        stream,
    }
}

#[tokio::test]
async fn tool_round_is_one_ordered_batch() {
    tokio::time::pause();
    let store = store();
    let runner = runner(Arc::new(StoreBatchTransport::new(store.clone())), Arc::new(SaveQueue::default()));

    let stream = tool_response(&[("call_1", r#"{"delay_ms": 40}"#), ("call_2", r#"{"delay_ms": 5}"#)]);
    let outcome = runner.run_round(round("session-a", stream)).await;
    assert!(outcome.needs_relance(), "unexpected outcome: {outcome:?}");

    let stored = store.list_messages("session-a").unwrap();
    let roles: Vec<Role> = stored.iter().map(|m| m.message.role).collect();
    assert_eq!(roles, vec![Role::Assistant, Role::Tool, Role::Tool]);
    assert_eq!(stored[1].message.tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(stored[2].message.tool_call_id.as_deref(), Some("call_2"));
    assert!(stored.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert!(stored.iter().all(|m| m.operation_id == stored[0].operation_id));

    let messages: Vec<ConversationMessage> = stored.into_iter().map(|m| m.message).collect();
    assert!(pairing_violations(&messages).is_empty());
    assert_eq!(store.get_session("session-a").unwrap().message_count, 3);
}

#[tokio::test]
async fn stale_guard_is_refetched_and_retried() {
    let store = store();
    store
        .apply_batch(
            "session-b",
            &BatchCommit {
                messages: vec![ConversationMessage::user("Summarise my notes", 0)],
                operation_id: "op_user".into(),
                relance_index: 0,
                expected_updated_at: None,
            },
        )
        .unwrap();

    let runner = runner(Arc::new(StoreBatchTransport::new(store.clone())), Arc::new(SaveQueue::default()));
    let mut input = round("session-b", tool_response(&[("call_1", "{}")]));
    input.expected_updated_at = Some("2000-01-01T00:00:00.000Z".into());

    let outcome = runner.run_round(input).await;
    assert!(outcome.needs_relance(), "unexpected outcome: {outcome:?}");
    assert_eq!(store.list_messages("session-b").unwrap().len(), 3);
}

#[tokio::test]
async fn lost_response_retry_does_not_duplicate() {
    tokio::time::pause();
    let store = store();
    let transport = Arc::new(LossyTransport {
        inner: StoreBatchTransport::new(store.clone()),
        lost: AtomicUsize::new(1),
    });
    let persister = BatchPersister::new(transport, policy());

    let call = ToolCall::new("call_1", "echo", "{}");
    let request = PersistRequest {
        resource_id: "session-c".into(),
        tool_calls: vec![call.clone()],
        tool_results: vec![ToolResult::succeeded(&call, json!("ok"), Duration::ZERO)],
        operation_id: "op_round_c".into(),
        relance_index: 0,
        include_assistant_message: true,
        assistant_message: None,
        expected_updated_at: None,
    };

    let outcome = persister.persist(&request).await.unwrap();
    assert_eq!(outcome.attempts, 2);
    assert!(outcome.duplicate);
    assert_eq!(store.list_messages("session-c").unwrap().len(), 2);

    // A later replay of the same operation is a no-op as well.
    let again = persister.persist(&request).await.unwrap();
    assert!(again.duplicate);
    assert_eq!(store.list_messages("session-c").unwrap().len(), 2);
}

#[tokio::test]
async fn concurrent_rounds_keep_batches_contiguous() {
    let store = store();
    let queue = Arc::new(SaveQueue::default());
    let transport: Arc<dyn BatchTransport> = Arc::new(StoreBatchTransport::new(store.clone()));
    let runner = Arc::new(runner(transport, queue));

    let mut handles = Vec::new();
    for n in 0..4 {
        let runner = Arc::clone(&runner);
        handles.push(tokio::spawn(async move {
            let args = format!(r#"{{"delay_ms": {}}}"#, 5 * (4 - n));
            let calls = [("call_x", args.as_str()), ("call_y", "{}")];
            let stream = tool_response(&calls);
            runner.run_round(round("session-d", stream)).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().needs_relance());
    }

    let stored = store.list_messages("session-d").unwrap();
    assert_eq!(stored.len(), 12);
    for batch in stored.chunks(3) {
        assert!(batch.iter().all(|m| m.operation_id == batch[0].operation_id));
        assert_eq!(batch[0].message.role, Role::Assistant);
    }
}

#[tokio::test]
async fn timed_out_response_is_stored_partially() {
    tokio::time::pause();
    let store = store();
    let runner = runner(Arc::new(StoreBatchTransport::new(store.clone())), Arc::new(SaveQueue::default()));

    let head = sse(json!({"choices": [{"delta": {"content": "The first half of an ans"}}]}));
    let stream = futures::stream::iter(vec![Ok::<_, Infallible>(Bytes::from(head))]).chain(futures::stream::pending());
    let outcome = runner.run_round(round("session-e", stream)).await;

    match outcome {
        RoundOutcome::CompletedWithContent { content, degraded, persisted } => {
            assert!(degraded);
            assert_eq!(content, "The first half of an ans");
            assert!(persisted.unwrap().applied);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    let stored = store.list_messages("session-e").unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].message.content.as_deref(), Some("The first half of an ans"));
}

#[tokio::test]
async fn retried_round_with_same_key_persists_once() {
    tokio::time::pause();
    let store = store();
    let local = Arc::new(StoreBatchTransport::new(store.clone()));
    // Every response of the first round is lost although its batch lands.
    let lossy = Arc::new(LossyTransport {
        inner: StoreBatchTransport::new(store.clone()),
        lost: AtomicUsize::new(3),
    });
    let runner = runner(lossy, Arc::new(SaveQueue::default())).with_duplicate_check(local);

    let first = runner
        .run_round(round("session-f", tool_response(&[("call_1", "{}"), ("call_2", "{}")])))
        .await;
    let operation_id = match first {
        RoundOutcome::Failed { operation_id, .. } => operation_id,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(store.list_messages("session-f").unwrap().len(), 3);

    let mut retry = round("session-f", tool_response(&[("call_1", "{}"), ("call_2", "{}")]));
    retry.operation_id = operation_id.clone();
    let second = runner.run_round(retry).await;
    assert!(second.needs_relance(), "unexpected outcome: {second:?}");
    assert!(second.persisted().is_none());

    let stored = store.list_messages("session-f").unwrap();
    assert_eq!(stored.len(), 3);
    assert!(stored.iter().all(|m| m.operation_id == operation_id.as_str()));
}

#[tokio::test]
async fn conflicting_replay_of_applied_operation_is_duplicate() {
    let store = store();
    let transport = StoreBatchTransport::new(store.clone());
    let commit = |expected: Option<String>| BatchCommit {
        messages: vec![ConversationMessage::user("Tighten the intro", 0)],
        operation_id: "op_intro".into(),
        relance_index: 0,
        expected_updated_at: expected,
    };

    let first = transport.commit("session-g", &commit(None)).await.unwrap();
    assert!(first.applied && !first.duplicate);

    // A different writer moves the session on; the replay carries a stale guard.
    transport
        .commit(
            "session-g",
            &BatchCommit {
                messages: vec![ConversationMessage::user("Also fix typos", 0)],
                operation_id: "op_other".into(),
                relance_index: 0,
                expected_updated_at: None,
            },
        )
        .await
        .unwrap();
    let replay = transport.commit("session-g", &commit(Some(first.updated_at.clone()))).await.unwrap();
    assert!(replay.duplicate);
    assert_eq!(replay.updated_at, first.updated_at);

    let persister = BatchPersister::new(Arc::new(StoreBatchTransport::new(store.clone())), policy());
    let call = ToolCall::new("call_9", "echo", "{}");
    let request = PersistRequest {
        resource_id: "session-g".into(),
        tool_calls: vec![call.clone()],
        tool_results: vec![ToolResult::succeeded(&call, json!("ok"), Duration::ZERO)],
        operation_id: "op_tools".into(),
        relance_index: 1,
        include_assistant_message: true,
        assistant_message: None,
        expected_updated_at: Some("2000-01-01T00:00:00.000Z".into()),
    };
    let applied = persister.persist(&request).await.unwrap();
    assert!(applied.applied && !applied.duplicate);
    let again = persister.persist(&request).await.unwrap();
    assert!(again.duplicate);

    let stored = store.list_messages("session-g").unwrap();
    assert_eq!(stored.iter().filter(|m| m.operation_id == "op_intro").count(), 1);
    assert_eq!(stored.iter().filter(|m| m.operation_id == "op_tools").count(), 2);
    assert_eq!(stored.len(), 4);
}
