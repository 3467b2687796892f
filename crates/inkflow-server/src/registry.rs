use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use inkflow_core::broadcast::{BroadcastError, Publisher, StreamChunk};
use inkflow_core::ids::ClientId;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

struct Subscriber {
    id: ClientId,
    tx: mpsc::Sender<String>,
}

/// Live viewers per resource id.
///
/// Each subscriber has a bounded outbound queue; when it is full the message
/// is dropped for that subscriber only.
pub struct SubscriberRegistry {
    resources: DashMap<String, Vec<Subscriber>>,
    max_send_queue: usize,
}

impl SubscriberRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            resources: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Add a viewer of `resource_id` and return its id and outbound queue.
    pub fn register(&self, resource_id: &str) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.resources
            .entry(resource_id.to_string())
            .or_default()
            .push(Subscriber { id: id.clone(), tx });
        (id, rx)
    }

    pub fn unregister(&self, resource_id: &str, client_id: &ClientId) {
        let now_empty = match self.resources.get_mut(resource_id) {
            Some(mut subs) => {
                subs.retain(|s| &s.id != client_id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            let _ = self.resources.remove_if(resource_id, |_, subs| subs.is_empty());
        }
    }

    /// Queue `message` for every viewer of `resource_id`. Returns how many
    /// viewers accepted it.
    pub fn send_to_resource(&self, resource_id: &str, message: &str) -> usize {
        let Some(mut subs) = self.resources.get_mut(resource_id) else {
            return 0;
        };
        let mut delivered = 0;
        subs.retain(|sub| match sub.tx.try_send(message.to_string()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(
                    client_id = %sub.id,
                    msg_len = msg.len(),
                    "send queue full, dropping message"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        delivered
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn total_subscribers(&self) -> usize {
        self.resources.iter().map(|entry| entry.value().len()).sum()
    }
}

#[async_trait]
impl Publisher for SubscriberRegistry {
    async fn publish(&self, resource_id: &str, chunk: StreamChunk) -> Result<(), BroadcastError> {
        let json = serde_json::to_string(&chunk).map_err(|e| BroadcastError::Serialization(e.to_string()))?;
        let delivered = self.send_to_resource(resource_id, &json);
        trace!(resource_id, delivered, "chunk published");
        Ok(())
    }

    fn subscriber_count(&self, resource_id: &str) -> usize {
        self.resources.get(resource_id).map_or(0, |subs| subs.len())
    }
}

/// Serve one viewer: forward queued chunks to the socket with a periodic
/// ping, until either side closes.
pub async fn handle_ws_connection(
    socket: WebSocket,
    resource_id: String,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<SubscriberRegistry>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = client_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    trace!(client_id = %writer_cid, "sent ping");
                }
            }
        }
    });

    let reader_cid = client_id.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Close(_) => break,
                WsMessage::Text(text) => {
                    debug!(client_id = %reader_cid, len = text.as_str().len(), "ignoring message from viewer");
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.unregister(&resource_id, &client_id);
    info!(client_id = %client_id, resource_id = %resource_id, "viewer disconnected");
}
