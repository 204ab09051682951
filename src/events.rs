use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

pub const FOLDER_COUNTS_UPDATED: &str = "folders.counts_updated";
pub const SYNC_COMPLETED: &str = "sync.completed";
pub const SYNC_FAILED: &str = "sync.failed";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEvent {
    pub tenant_id: Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

/// Fire-and-forget notifications to connected clients. Delivery failures are
/// the emitter's problem and never reach the caller.
pub trait RealtimeEventEmitter: Send + Sync {
    fn emit(&self, tenant_id: Uuid, kind: &str, payload: serde_json::Value);
}

/// In-process fan-out over a broadcast channel.
#[derive(Clone)]
pub struct BroadcastEmitter {
    sender: broadcast::Sender<RealtimeEvent>,
}

impl BroadcastEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.sender.subscribe()
    }
}

impl RealtimeEventEmitter for BroadcastEmitter {
    fn emit(&self, tenant_id: Uuid, kind: &str, payload: serde_json::Value) {
        let event = RealtimeEvent {
            tenant_id,
            kind: kind.to_string(),
            payload,
            emitted_at: Utc::now(),
        };
        if self.sender.send(event).is_err() {
            tracing::debug!(%tenant_id, kind, "No realtime subscribers, event dropped");
        }
    }
}
