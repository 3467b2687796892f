use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde_json::Value;

use inkflow_core::ids::OperationId;
use inkflow_core::tools::{ToolCall, ToolError, ToolExecution, ToolExecutor};
use inkflow_engine::{EngineConfig, RoundInput, RoundOutcome};
use inkflow_server::{ServerConfig, SubscriberRegistry};
use inkflow_settings::{InkflowSettings, LoggingSettings};
use inkflow_store::{Database, MessageStore};
use inkflow_telemetry::{init_telemetry, parse_level, TelemetryConfig, TelemetryGuard};

#[derive(Parser)]
#[command(name = "inkflow", about = "Agent round execution and batch message store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the message API and live chunk WebSocket server.
    Serve {
        /// Override the configured listen port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one round from a recorded SSE response into the local store.
    Replay {
        /// Session the round belongs to.
        #[arg(long)]
        session: String,
        /// File holding the raw `text/event-stream` body.
        file: PathBuf,
        /// Idempotency key of the round. Reuse it to retry a failed replay.
        #[arg(long)]
        operation_id: Option<String>,
        #[arg(long, default_value_t = 0)]
        relance_index: u32,
    },
}

/// Tools are not available offline; every call is answered with a failure.
struct OfflineTools;

#[async_trait]
impl ToolExecutor for OfflineTools {
    async fn execute(&self, call: &ToolCall, _arguments: Value) -> Result<ToolExecution, ToolError> {
        Err(ToolError::UnknownTool(call.function_name.clone()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = inkflow_settings::get_settings();
    let _telemetry = init_logging(&settings.logging)?;

    match cli.command {
        Command::Serve { port } => serve(settings, port).await,
        Command::Replay {
            session,
            file,
            operation_id,
            relance_index,
        } => {
            let operation_id = operation_id.map_or_else(OperationId::new, OperationId::from_raw);
            replay(settings, session, file, operation_id, relance_index).await
        }
    }
}

fn init_logging(logging: &LoggingSettings) -> anyhow::Result<TelemetryGuard> {
    let config = TelemetryConfig {
        log_level: parse_level(&logging.level).unwrap_or(tracing::Level::INFO),
        module_levels: logging
            .modules
            .iter()
            .filter_map(|(module, level)| parse_level(level).map(|l| (module.clone(), l)))
            .collect(),
        json: logging.json,
    };
    init_telemetry(config).context("failed to initialise logging")
}

fn open_store(settings: &InkflowSettings) -> anyhow::Result<Database> {
    let path = inkflow_settings::resolve_path(&settings.server.db_path);
    Database::open(&path).with_context(|| format!("failed to open database at {}", path.display()))
}

async fn serve(settings: &InkflowSettings, port: Option<u16>) -> anyhow::Result<()> {
    let db = open_store(settings)?;
    let db_path = db.path().display().to_string();
    let config = ServerConfig {
        host: settings.server.host.clone(),
        port: port.unwrap_or(settings.server.port),
        max_send_queue: settings.server.max_send_queue,
    };
    let handle = inkflow_server::start(config, db).await.context("failed to start server")?;
    tracing::info!(port = handle.port, db = %db_path, "inkflow server ready");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");
    Ok(())
}

async fn replay(
    settings: &InkflowSettings,
    session: String,
    file: PathBuf,
    operation_id: OperationId,
    relance_index: u32,
) -> anyhow::Result<()> {
    let body = tokio::fs::read(&file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let store = MessageStore::new(open_store(settings)?);
    let expected_updated_at = store.get_session(&session).ok().map(|s| s.updated_at);

    // Rounds always commit into the local store here, whatever the configured API.
    let mut engine = EngineConfig::from_settings(settings);
    engine.base_url = None;
    let publisher = Arc::new(SubscriberRegistry::new(settings.server.max_send_queue));
    let runner = engine
        .build_runner(Arc::new(OfflineTools), publisher, Some(store))
        .context("failed to build round runner")?;

    let stream = futures::stream::iter([Ok::<_, std::io::Error>(Bytes::from(body))]);
    let outcome = runner
        .run_round(RoundInput {
            session_id: session.clone(),
            operation_id,
            relance_index,
            assistant_already_persisted: false,
            expected_updated_at,
            stream,
        })
        .await;

    match outcome {
        RoundOutcome::CompletedWithContent {
            content,
            persisted,
            degraded,
        } => {
            tracing::info!(
                session = %session,
                chars = content.chars().count(),
                degraded,
                persisted = persisted.is_some(),
                "round completed with content"
            );
            Ok(())
        }
        RoundOutcome::CompletedWithToolCalls { tool_calls, persisted, .. } => {
            tracing::info!(
                session = %session,
                tool_calls = tool_calls.len(),
                persisted = persisted.is_some(),
                "round completed with tool calls"
            );
            Ok(())
        }
        RoundOutcome::Failed { error, operation_id, .. } => {
            Err(error).with_context(|| format!("round failed, retry with --operation-id {operation_id}"))
        }
    }
}
