//! Runtime configuration of the engine, derived from [`InkflowSettings`].

use std::sync::Arc;
use std::time::Duration;

use inkflow_core::broadcast::Publisher;
use inkflow_core::tools::ToolExecutor;
use inkflow_llm::StreamConfig;
use inkflow_settings::InkflowSettings;
use inkflow_store::MessageStore;

use crate::broadcaster::ChunkedBroadcaster;
use crate::persistence::BatchPersister;
use crate::retry::RetryPolicy;
use crate::round::{RoundConfig, RoundRunner};
use crate::save_queue::SaveQueue;
use crate::transport::{HttpBatchTransport, StoreBatchTransport, TransportError};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub round: RoundConfig,
    pub retry: RetryPolicy,
    pub operation_timeout: Duration,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    /// Message API to commit to. `None` commits into a local store.
    pub base_url: Option<String>,
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&InkflowSettings::default())
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &InkflowSettings) -> Self {
        Self {
            round: RoundConfig {
                stream: StreamConfig {
                    safety_timeout: Duration::from_millis(settings.stream.safety_timeout_ms),
                    token_batch_size: settings.stream.token_batch_size,
                },
                tool_timeout: Duration::from_millis(settings.tools.timeout_ms),
            },
            retry: RetryPolicy {
                max_attempts: settings.persistence.max_attempts,
                backoff_unit: Duration::from_millis(settings.persistence.backoff_unit_ms),
                max_conflict_retries: settings.persistence.max_conflict_retries,
            },
            operation_timeout: Duration::from_millis(settings.queue.operation_timeout_ms),
            chunk_size: settings.broadcast.chunk_size,
            chunk_delay: Duration::from_millis(settings.broadcast.chunk_delay_ms),
            base_url: settings.persistence.base_url.clone(),
            request_timeout: Duration::from_millis(settings.persistence.request_timeout_ms),
        }
    }

    /// Assemble a round runner. Rounds commit over HTTP when `base_url` is
    /// set, otherwise into `store`.
    pub fn build_runner(
        &self,
        executor: Arc<dyn ToolExecutor>,
        publisher: Arc<dyn Publisher>,
        store: Option<MessageStore>,
    ) -> Result<RoundRunner, TransportError> {
        let broadcaster = ChunkedBroadcaster::new(publisher, self.chunk_size, self.chunk_delay);
        let queue = Arc::new(SaveQueue::new(self.operation_timeout));

        let runner = match (&self.base_url, store) {
            (Some(url), _) => {
                let http = Arc::new(HttpBatchTransport::new(url.clone(), self.request_timeout)?);
                let persister = BatchPersister::new(http.clone(), self.retry.clone());
                RoundRunner::new(executor, persister, queue, broadcaster, self.round.clone()).with_duplicate_check(http)
            }
            (None, Some(store)) => {
                let local = Arc::new(StoreBatchTransport::new(store));
                let persister = BatchPersister::new(local.clone(), self.retry.clone());
                RoundRunner::new(executor, persister, queue, broadcaster, self.round.clone()).with_duplicate_check(local)
            }
            (None, None) => {
                return Err(TransportError::Network(
                    "no message API url and no local store configured".into(),
                ))
            }
        };
        Ok(runner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_flow_into_components() {
        let mut settings = InkflowSettings::default();
        settings.stream.safety_timeout_ms = 12_000;
        settings.persistence.backoff_unit_ms = 250;
        settings.tools.timeout_ms = 5_000;
        settings.broadcast.chunk_size = 40;

        let config = EngineConfig::from_settings(&settings);
        assert_eq!(config.round.stream.safety_timeout, Duration::from_secs(12));
        assert_eq!(config.round.tool_timeout, Duration::from_secs(5));
        assert_eq!(config.retry.backoff_unit, Duration::from_millis(250));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.chunk_size, 40);
        assert!(config.base_url.is_none());
    }

    #[test]
    fn defaults_match_component_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.operation_timeout, crate::save_queue::DEFAULT_OPERATION_TIMEOUT);
        assert_eq!(config.chunk_size, crate::broadcaster::DEFAULT_CHUNK_SIZE);
        assert_eq!(config.chunk_delay, crate::broadcaster::DEFAULT_CHUNK_DELAY);
        assert_eq!(config.round.tool_timeout, crate::round::DEFAULT_TOOL_TIMEOUT);
    }
}
