//! Round execution: tool calls, atomic persistence of the round, per-resource
//! save ordering and re-streaming of document changes.

pub mod broadcaster;
pub mod config;
pub mod diff;
pub mod error;
pub mod persistence;
pub mod retry;
pub mod round;
pub mod save_queue;
pub mod transport;

pub use broadcaster::{chunk_text, BroadcastReport, ChunkedBroadcaster, LiveTyping};
pub use config::EngineConfig;
pub use diff::extract_added;
pub use error::{EngineError, PersistError, QueueError};
pub use persistence::{BatchPersister, PersistOutcome, PersistRequest};
pub use retry::{CommitState, FailReason, RetryPolicy};
pub use round::{RoundConfig, RoundInput, RoundOutcome, RoundRunner};
pub use save_queue::SaveQueue;
pub use transport::{BatchTransport, DuplicateCheck, HttpBatchTransport, StoreBatchTransport, TransportError};
