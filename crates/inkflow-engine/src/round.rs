//! One round of the agent loop: read the model response, run its tool calls,
//! persist the round atomically and re-stream document changes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{FutureExt, Stream};
use tracing::{debug, error, info, instrument, warn};

use inkflow_core::ids::OperationId;
use inkflow_core::messages::ConversationMessage;
use inkflow_core::tools::{DocumentMutation, ToolCall, ToolError, ToolExecutor, ToolResult};
use inkflow_llm::{read_response, LlmError, MalformedCall, StreamConfig, StreamSummary};

use crate::broadcaster::ChunkedBroadcaster;
use crate::diff::extract_added;
use crate::error::{EngineError, PersistError};
use crate::persistence::{BatchPersister, PersistOutcome, PersistRequest};
use crate::save_queue::SaveQueue;
use crate::transport::DuplicateCheck;

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct RoundConfig {
    pub stream: StreamConfig,
    /// Upper bound for a single tool call.
    pub tool_timeout: Duration,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }
}

pub struct RoundInput<S> {
    pub session_id: String,
    /// Idempotency key of the round's batch. A retry of a failed round must
    /// reuse it so an already applied batch is not written twice.
    pub operation_id: OperationId,
    pub relance_index: u32,
    /// The assistant message of this round was stored by an earlier batch.
    pub assistant_already_persisted: bool,
    pub expected_updated_at: Option<String>,
    /// Raw bytes of the streamed model response.
    pub stream: S,
}

#[derive(Debug)]
pub enum RoundOutcome {
    /// The model answered with text only. `degraded` is set when the stream
    /// hit the safety timeout and only partial content was kept.
    CompletedWithContent {
        content: String,
        persisted: Option<PersistOutcome>,
        degraded: bool,
    },
    /// Tools ran and the round was persisted. The caller must relance.
    CompletedWithToolCalls {
        tool_calls: Vec<ToolCall>,
        results: Vec<ToolResult>,
        persisted: Option<PersistOutcome>,
    },
    /// Retry with the returned `operation_id` as the round's key.
    Failed {
        error: EngineError,
        partial_content: Option<String>,
        operation_id: OperationId,
    },
}

impl RoundOutcome {
    pub fn needs_relance(&self) -> bool {
        matches!(self, Self::CompletedWithToolCalls { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn persisted(&self) -> Option<&PersistOutcome> {
        match self {
            Self::CompletedWithContent { persisted, .. } | Self::CompletedWithToolCalls { persisted, .. } => {
                persisted.as_ref()
            }
            Self::Failed { .. } => None,
        }
    }
}

/// Identity of the round being run, shared by its persistence steps.
struct RoundContext {
    session_id: String,
    relance_index: u32,
    operation_id: OperationId,
    assistant_already_persisted: bool,
    expected_updated_at: Option<String>,
}

/// A call as it will be recorded, with the work needed to answer it.
enum PlannedCall {
    Run(ToolCall),
    Reject(MalformedCall),
}

impl PlannedCall {
    /// The call as stored on the assistant message. Unparseable arguments are
    /// replaced so the stored history stays valid JSON.
    fn recorded_call(&self) -> ToolCall {
        match self {
            Self::Run(call) => call.clone(),
            Self::Reject(m) => ToolCall::new(m.call.id.clone(), m.call.function_name.clone(), "{}"),
        }
    }
}

pub struct RoundRunner {
    executor: Arc<dyn ToolExecutor>,
    persister: BatchPersister,
    queue: Arc<SaveQueue>,
    duplicate_check: Option<Arc<dyn DuplicateCheck>>,
    broadcaster: ChunkedBroadcaster,
    config: RoundConfig,
}

impl RoundRunner {
    pub fn new(
        executor: Arc<dyn ToolExecutor>,
        persister: BatchPersister,
        queue: Arc<SaveQueue>,
        broadcaster: ChunkedBroadcaster,
        config: RoundConfig,
    ) -> Self {
        Self {
            executor,
            persister,
            queue,
            duplicate_check: None,
            broadcaster,
            config,
        }
    }

    /// Skip persistence when the server already applied the round's operation.
    pub fn with_duplicate_check(mut self, check: Arc<dyn DuplicateCheck>) -> Self {
        self.duplicate_check = Some(check);
        self
    }

    #[instrument(
        skip(self, input),
        fields(session_id = %input.session_id, operation_id = %input.operation_id, relance_index = input.relance_index)
    )]
    pub async fn run_round<S, E>(&self, input: RoundInput<S>) -> RoundOutcome
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: fmt::Display + Send,
    {
        let RoundInput {
            session_id,
            operation_id,
            relance_index,
            assistant_already_persisted,
            expected_updated_at,
            stream,
        } = input;

        let live = self.broadcaster.live(session_id.clone());
        let read = read_response(stream, &live, &self.config.stream).await;
        if live.chunks_sent() > 0 {
            live.finish().await;
        }

        let ctx = RoundContext {
            session_id,
            relance_index,
            operation_id,
            assistant_already_persisted,
            expected_updated_at,
        };

        match read {
            Ok(summary) if summary.has_tool_calls() => self.complete_with_tools(&ctx, summary).await,
            Ok(summary) => self.complete_with_content(&ctx, summary.content, false).await,
            Err(LlmError::Timeout { after, partial }) => {
                if partial.content.is_empty() {
                    return RoundOutcome::Failed {
                        error: LlmError::Timeout { after, partial }.into(),
                        partial_content: None,
                        operation_id: ctx.operation_id,
                    };
                }
                if partial.has_tool_calls() {
                    warn!(dropped = partial.call_order.len(), "dropping tool calls of a timed-out response");
                }
                self.complete_with_content(&ctx, partial.content, true).await
            }
            Err(e) => RoundOutcome::Failed {
                error: e.into(),
                partial_content: None,
                operation_id: ctx.operation_id,
            },
        }
    }

    async fn complete_with_content(&self, ctx: &RoundContext, content: String, degraded: bool) -> RoundOutcome {
        if content.is_empty() || ctx.assistant_already_persisted {
            debug!(empty = content.is_empty(), "no assistant message to persist");
            return RoundOutcome::CompletedWithContent {
                content,
                persisted: None,
                degraded,
            };
        }

        let request = PersistRequest {
            resource_id: ctx.session_id.clone(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            operation_id: ctx.operation_id.to_string(),
            relance_index: ctx.relance_index,
            include_assistant_message: true,
            assistant_message: Some(ConversationMessage::assistant(
                Some(content.clone()),
                Vec::new(),
                ctx.relance_index,
            )),
            expected_updated_at: ctx.expected_updated_at.clone(),
        };

        match self.persist_exclusive(&request).await {
            Ok(persisted) => RoundOutcome::CompletedWithContent {
                content,
                persisted,
                degraded,
            },
            Err(e) => RoundOutcome::Failed {
                error: e.into(),
                partial_content: Some(content),
                operation_id: ctx.operation_id.clone(),
            },
        }
    }

    async fn complete_with_tools(&self, ctx: &RoundContext, summary: StreamSummary) -> RoundOutcome {
        let plan = plan_calls(&summary);
        if plan.is_empty() {
            return self.complete_with_content(ctx, summary.content, false).await;
        }

        let runnable: Vec<&ToolCall> = plan
            .iter()
            .filter_map(|p| match p {
                PlannedCall::Run(call) => Some(call),
                PlannedCall::Reject(_) => None,
            })
            .collect();
        info!(tools = runnable.len(), rejected = plan.len() - runnable.len(), "executing tool calls");

        let executed = futures::future::join_all(runnable.iter().map(|call| self.execute_tool(call))).await;
        let mut by_id: HashMap<String, (ToolResult, Option<DocumentMutation>)> = runnable
            .iter()
            .map(|call| call.id.clone())
            .zip(executed)
            .collect();

        let mut tool_calls = Vec::with_capacity(plan.len());
        let mut results = Vec::with_capacity(plan.len());
        let mut mutations = Vec::new();
        for planned in &plan {
            let call = planned.recorded_call();
            let result = match planned {
                PlannedCall::Run(_) => match by_id.remove(&call.id) {
                    Some((result, mutation)) => {
                        mutations.extend(mutation);
                        result
                    }
                    None => ToolResult::failed(&call, "tool produced no result", Duration::ZERO),
                },
                PlannedCall::Reject(m) => ToolResult::failed(&call, m.error.to_string(), Duration::ZERO),
            };
            tool_calls.push(call);
            results.push(result);
        }

        let request = PersistRequest {
            resource_id: ctx.session_id.clone(),
            tool_calls: tool_calls.clone(),
            tool_results: results.clone(),
            operation_id: ctx.operation_id.to_string(),
            relance_index: ctx.relance_index,
            include_assistant_message: !ctx.assistant_already_persisted,
            assistant_message: Some(ConversationMessage::assistant(
                summary.content_or_none(),
                Vec::new(),
                ctx.relance_index,
            )),
            expected_updated_at: ctx.expected_updated_at.clone(),
        };

        let persisted = match self.persist_exclusive(&request).await {
            Ok(persisted) => persisted,
            Err(e) => {
                return RoundOutcome::Failed {
                    error: e.into(),
                    partial_content: summary.content_or_none(),
                    operation_id: ctx.operation_id.clone(),
                }
            }
        };

        for mutation in &mutations {
            self.stream_mutation(mutation).await;
        }

        RoundOutcome::CompletedWithToolCalls {
            tool_calls,
            results,
            persisted,
        }
    }

    async fn persist_exclusive(&self, request: &PersistRequest) -> Result<Option<PersistOutcome>, PersistError> {
        let persist = self.persister.persist(request);
        match &self.duplicate_check {
            Some(check) => self
                .queue
                .run_exclusive_once(&request.resource_id, &request.operation_id, check.as_ref(), persist)
                .await?
                .transpose(),
            None => self.queue.run_exclusive(&request.resource_id, persist).await?.map(Some),
        }
    }

    /// Run one call under the tool timeout, turning errors, panics and
    /// timeouts into failed results.
    async fn execute_tool(&self, call: &ToolCall) -> (ToolResult, Option<DocumentMutation>) {
        let start = Instant::now();
        let arguments = match call.parsed_arguments() {
            Ok(arguments) => arguments,
            Err(e) => return (ToolResult::failed(call, e.to_string(), start.elapsed()), None),
        };

        let timeout = self.config.tool_timeout;
        let outcome = tokio::time::timeout(
            timeout,
            std::panic::AssertUnwindSafe(self.executor.execute(call, arguments)).catch_unwind(),
        )
        .await;
        let duration = start.elapsed();

        match outcome {
            Ok(Ok(Ok(execution))) => {
                let mut result = execution.result;
                if !result.result.is_defined() {
                    warn!(tool = %call.function_name, "tool returned an empty result");
                    return (ToolResult::failed(call, "tool returned no result", duration), None);
                }
                result.tool_call_id = call.id.clone();
                result.name = call.function_name.clone();
                result.duration_ms = duration.as_millis() as u64;
                (result, execution.mutation)
            }
            Ok(Ok(Err(e))) => {
                warn!(tool = %call.function_name, error = %e, "tool failed");
                (ToolResult::failed(call, e.to_string(), duration), None)
            }
            Ok(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(tool = %call.function_name, panic = %msg, "tool panicked during execution");
                (ToolResult::failed(call, "Internal error: tool crashed", duration), None)
            }
            Err(_) => {
                warn!(tool = %call.function_name, timeout_secs = timeout.as_secs(), "tool timed out");
                (ToolResult::failed(call, ToolError::Timeout(timeout).to_string(), duration), None)
            }
        }
    }

    async fn stream_mutation(&self, mutation: &DocumentMutation) {
        let added = extract_added(&mutation.old_content, &mutation.new_content, &mutation.applied_ops, &[]);
        if added.is_empty() {
            debug!(document_id = %mutation.document_id, "mutation added no text");
            return;
        }
        let report = self
            .broadcaster
            .broadcast_text(&mutation.document_id, &added, mutation.position)
            .await;
        if let Some(e) = report.error {
            warn!(document_id = %mutation.document_id, error = %e, "document stream incomplete");
        }
    }
}

/// Order every streamed call as the model emitted it. Calls without a name
/// cannot be answered by a tool message and are dropped.
fn plan_calls(summary: &StreamSummary) -> Vec<PlannedCall> {
    let mut ready: HashMap<&str, &ToolCall> = summary.tool_calls.iter().map(|c| (c.id.as_str(), c)).collect();
    let mut malformed: HashMap<&str, &MalformedCall> =
        summary.malformed.iter().map(|m| (m.call.id.as_str(), m)).collect();

    let mut plan = Vec::with_capacity(summary.call_order.len());
    for id in &summary.call_order {
        if let Some(call) = ready.remove(id.as_str()) {
            plan.push(PlannedCall::Run(call.clone()));
        } else if let Some(m) = malformed.remove(id.as_str()) {
            if m.call.function_name.is_empty() {
                warn!(call_id = %id, "dropping tool call without a name");
                continue;
            }
            warn!(call_id = %id, error = %m.error, "tool call arguments rejected");
            plan.push(PlannedCall::Reject(m.clone()));
        }
    }
    plan
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
