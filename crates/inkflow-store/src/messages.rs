use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, instrument, warn};

use inkflow_core::batch::{BatchCommit, BatchOutcome, SessionSnapshot};
use inkflow_core::ids::MessageId;
use inkflow_core::messages::{pairing_violations, ConversationMessage, Role};
use inkflow_core::tools::ToolCall;

use crate::database::Database;
use crate::error::StoreError;

/// A persisted message with its position in the session.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredMessage {
    pub sequence: i64,
    pub operation_id: String,
    pub message: ConversationMessage,
}

/// Durable side of the batch message protocol.
///
/// Every batch is applied all-or-nothing. An operation id is applied at most
/// once per session; replays return the recorded outcome.
#[derive(Clone)]
pub struct MessageStore {
    db: Database,
}

impl MessageStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Apply a batch: idempotency check, validation, optimistic concurrency
    /// check, then a single transaction. Sessions are created on first write.
    #[instrument(skip(self, commit), fields(operation_id = %commit.operation_id, messages = commit.messages.len()))]
    pub fn apply_batch(&self, session_id: &str, commit: &BatchCommit) -> Result<BatchOutcome, StoreError> {
        self.db.with_conn(|conn| {
            if let Some(previous) = find_operation(conn, session_id, &commit.operation_id)? {
                debug!("operation already applied, returning recorded outcome");
                return Ok(previous);
            }

            let problems = validate_batch(session_id, commit);
            if !problems.is_empty() {
                warn!(problems = problems.len(), "batch rejected");
                return Err(StoreError::Validation(problems));
            }

            let current = load_session(conn, session_id)?;
            if let Some(expected) = commit.expected_updated_at.as_deref() {
                let actual = current.as_ref().map(|s| s.updated_at.as_str()).unwrap_or_default();
                if actual != expected {
                    return Err(StoreError::Conflict {
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    });
                }
            }

            let updated_at = next_stamp(current.as_ref().map(|s| s.updated_at.as_str()));
            let persisted = commit.messages.len();

            let tx = conn.unchecked_transaction()?;
            if current.is_none() {
                tx.execute(
                    "INSERT INTO sessions (id, version, message_count, created_at, updated_at)
                     VALUES (?1, 0, 0, ?2, ?2)",
                    rusqlite::params![session_id, updated_at],
                )?;
            }

            let mut sequence: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), -1) FROM messages WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )?;
            for msg in &commit.messages {
                sequence += 1;
                let tool_calls = if msg.tool_calls.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&msg.tool_calls)?)
                };
                tx.execute(
                    "INSERT INTO messages (id, session_id, sequence, role, content, tool_calls, tool_call_id,
                                           name, relance_index, timestamp, operation_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        msg.id.as_str(),
                        session_id,
                        sequence,
                        msg.role.as_str(),
                        msg.content,
                        tool_calls,
                        msg.tool_call_id,
                        msg.name,
                        msg.relance_index,
                        msg.timestamp,
                        commit.operation_id,
                    ],
                )?;
            }

            tx.execute(
                "UPDATE sessions SET version = version + 1, message_count = message_count + ?2, updated_at = ?3
                 WHERE id = ?1",
                rusqlite::params![session_id, persisted as i64, updated_at],
            )?;
            tx.execute(
                "INSERT INTO operations (session_id, operation_id, relance_index, messages_persisted, updated_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    session_id,
                    commit.operation_id,
                    commit.relance_index,
                    persisted as i64,
                    updated_at,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            tx.commit()?;

            info!(persisted, updated_at = %updated_at, "batch applied");
            Ok(BatchOutcome {
                applied: true,
                duplicate: false,
                messages_persisted: persisted,
                updated_at,
            })
        })
    }

    /// Current session stamp, used by clients to refetch after a conflict.
    #[instrument(skip(self))]
    pub fn get_session(&self, session_id: &str) -> Result<SessionSnapshot, StoreError> {
        self.db
            .with_conn(|conn| load_session(conn, session_id))?
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))
    }

    pub fn operation_applied(&self, session_id: &str, operation_id: &str) -> Result<bool, StoreError> {
        self.db
            .with_conn(|conn| Ok(find_operation(conn, session_id, operation_id)?.is_some()))
    }

    /// All messages of a session in persisted order.
    #[instrument(skip(self))]
    pub fn list_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sequence, role, content, tool_calls, tool_call_id, name, relance_index, timestamp, operation_id
                 FROM messages WHERE session_id = ?1 ORDER BY sequence ASC",
            )?;
            let mut rows = stmt.query([session_id])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_message(row)?);
            }
            Ok(out)
        })
    }
}

fn find_operation(conn: &Connection, session_id: &str, operation_id: &str) -> Result<Option<BatchOutcome>, StoreError> {
    let row = conn
        .query_row(
            "SELECT messages_persisted, updated_at FROM operations WHERE session_id = ?1 AND operation_id = ?2",
            [session_id, operation_id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    Ok(row.map(|(persisted, updated_at)| BatchOutcome {
        applied: true,
        duplicate: true,
        messages_persisted: persisted as usize,
        updated_at,
    }))
}

fn load_session(conn: &Connection, session_id: &str) -> Result<Option<SessionSnapshot>, StoreError> {
    let snapshot = conn
        .query_row(
            "SELECT id, updated_at, message_count, version FROM sessions WHERE id = ?1",
            [session_id],
            |row| {
                Ok(SessionSnapshot {
                    id: row.get(0)?,
                    updated_at: row.get(1)?,
                    message_count: row.get::<_, i64>(2)? as u64,
                    version: row.get::<_, i64>(3)? as u64,
                })
            },
        )
        .optional()?;
    Ok(snapshot)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<StoredMessage, StoreError> {
    let role_raw: String = row.get(2)?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| StoreError::Serialization(format!("unknown role: {role_raw}")))?;
    let tool_calls: Option<String> = row.get(4)?;
    let tool_calls: Vec<ToolCall> = match tool_calls {
        Some(raw) => serde_json::from_str(&raw)?,
        None => Vec::new(),
    };

    Ok(StoredMessage {
        sequence: row.get(1)?,
        operation_id: row.get(9)?,
        message: ConversationMessage {
            id: MessageId::from_raw(row.get::<_, String>(0)?),
            role,
            content: row.get(3)?,
            tool_calls,
            tool_call_id: row.get(5)?,
            name: row.get(6)?,
            timestamp: row.get(8)?,
            relance_index: row.get(7)?,
        },
    })
}

/// Itemised problems with a batch. Empty means the batch can be written.
pub fn validate_batch(session_id: &str, commit: &BatchCommit) -> Vec<String> {
    let mut problems = Vec::new();
    if session_id.trim().is_empty() {
        problems.push("session id is empty".to_string());
    }
    if commit.operation_id.trim().is_empty() {
        problems.push("operation_id is empty".to_string());
    }
    if commit.messages.is_empty() {
        problems.push("batch has no messages".to_string());
    }

    for (idx, msg) in commit.messages.iter().enumerate() {
        for call in &msg.tool_calls {
            if call.function_name.is_empty() {
                problems.push(format!("message {idx}: tool call {} has no function name", call.id));
            }
            if call.parsed_arguments().is_err() {
                problems.push(format!("message {idx}: tool call {} arguments are not valid JSON", call.id));
            }
        }
        if msg.role == Role::Tool && msg.content.is_none() {
            problems.push(format!("message {idx}: tool message without content"));
        }
    }
    problems.extend(pairing_violations(&commit.messages));
    problems
}

/// Next `updated_at` for a session: now, but always strictly later than the
/// previous stamp at millisecond precision.
fn next_stamp(previous: Option<&str>) -> String {
    let now_ms = Utc::now().timestamp_millis();
    let previous_ms = previous
        .and_then(|p| DateTime::parse_from_rfc3339(p).ok())
        .map(|p| p.timestamp_millis());
    let ms = match previous_ms {
        Some(prev) if prev >= now_ms => prev + 1,
        _ => now_ms,
    };
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
