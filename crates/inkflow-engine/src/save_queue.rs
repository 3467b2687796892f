//! Per-resource exclusive execution of mutating operations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::transport::DuplicateCheck;

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    /// Holders plus waiters. The entry is removed when this drops to zero.
    users: usize,
}

/// Serializes operations per resource id.
///
/// Waiters are served in arrival order. An operation that exceeds the timeout
/// fails on its own; the next one proceeds either way.
pub struct SaveQueue {
    entries: Mutex<HashMap<String, Slot>>,
    operation_timeout: Duration,
}

/// Releases one use of a slot, also when the owning future is dropped mid-wait.
struct SlotUse<'a> {
    queue: &'a SaveQueue,
    resource_id: &'a str,
}

impl Drop for SlotUse<'_> {
    fn drop(&mut self) {
        let mut entries = self.queue.entries.lock();
        if let Some(slot) = entries.get_mut(self.resource_id) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                let _ = entries.remove(self.resource_id);
            }
        }
    }
}

impl Default for SaveQueue {
    fn default() -> Self {
        Self::new(DEFAULT_OPERATION_TIMEOUT)
    }
}

impl SaveQueue {
    pub fn new(operation_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            operation_timeout,
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    fn enter<'a>(&'a self, resource_id: &'a str) -> (Arc<tokio::sync::Mutex<()>>, SlotUse<'a>) {
        let mut entries = self.entries.lock();
        let slot = entries.entry(resource_id.to_string()).or_insert_with(|| Slot {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            users: 0,
        });
        slot.users += 1;
        let lock = Arc::clone(&slot.lock);
        (
            lock,
            SlotUse {
                queue: self,
                resource_id,
            },
        )
    }

    /// Run `op` once every earlier operation on `resource_id` has finished.
    pub async fn run_exclusive<F, T>(&self, resource_id: &str, op: F) -> Result<T, QueueError>
    where
        F: Future<Output = T>,
    {
        let (lock, _use) = self.enter(resource_id);
        let _held = lock.lock_owned().await;
        debug!(resource_id, "save slot acquired");

        match tokio::time::timeout(self.operation_timeout, op).await {
            Ok(value) => Ok(value),
            Err(_) => {
                warn!(
                    resource_id,
                    timeout_ms = self.operation_timeout.as_millis() as u64,
                    "queued operation timed out"
                );
                Err(QueueError::Timeout {
                    resource_id: resource_id.to_string(),
                    after: self.operation_timeout,
                })
            }
        }
    }

    /// Like [`run_exclusive`](Self::run_exclusive), but first asks `checker`
    /// whether `operation_id` was already applied. Returns `None` when the
    /// body was skipped. A failing check is logged and the body runs.
    pub async fn run_exclusive_once<F, T>(
        &self,
        resource_id: &str,
        operation_id: &str,
        checker: &dyn DuplicateCheck,
        op: F,
    ) -> Result<Option<T>, QueueError>
    where
        F: Future<Output = T>,
    {
        self.run_exclusive(resource_id, async move {
            match checker.is_applied(resource_id, operation_id).await {
                Ok(true) => {
                    info!(resource_id, operation_id, "operation already applied, skipping");
                    None
                }
                Ok(false) => Some(op.await),
                Err(e) => {
                    warn!(resource_id, operation_id, error = %e, "duplicate check failed, running anyway");
                    Some(op.await)
                }
            }
        })
        .await
    }

    /// Number of resources with a running or waiting operation.
    pub fn active_resources(&self) -> usize {
        self.entries.lock().len()
    }
}
