/// Realtime push channel: wire types, the channel contract, and the listener
/// that feeds remote-origin events into a `BoardStore`.
///
/// Events travel as JSON objects:
///   { "eventType": "moved", "entityKind": "card", "entityId": "c1",
///     "payload": { "parentId": "l2", "position": 0, ... }, "origin": "client-a" }
///
/// Delivery is at-most-once with no acknowledgment. Duplicates are harmless
/// because every event is applied as an upsert or removal by id.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::store::BoardStore;
use crate::types::EntityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Created,
    Updated,
    Moved,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEvent {
    pub event_type: EventType,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    #[serde(default)]
    pub payload: Value,
    /// Client id of the sender, used to skip echoes of our own emits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// New position for one sibling, carried by `moved` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiblingPosition {
    pub id: String,
    pub position: f64,
}

/// The recognised parts of a created/updated/moved payload.
///
/// Every part is optional: an `updated` event may carry just a field diff.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
    /// Re-ranked siblings of a move, so receivers never see duplicate positions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub siblings: Vec<SiblingPosition>,
}

impl EntityPatch {
    /// Parse a payload, treating anything unrecognisable as an empty patch.
    pub fn from_payload(payload: &Value) -> Self {
        serde_json::from_value(payload.clone()).unwrap_or_else(|e| {
            log::warn!("[corkboard.realtime.parse] Ignoring malformed payload: {}", e);
            EntityPatch::default()
        })
    }

    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Realtime channel closed")]
    Closed,

    #[error("Realtime send failed: {0}")]
    Send(String),
}

/// Push channel scoped to one board.
pub trait RealtimeChannel: Send + Sync {
    /// Stream of events for `board_id`. The stream ends when the channel shuts down.
    fn subscribe(&self, board_id: &str) -> mpsc::UnboundedReceiver<RealtimeEvent>;

    /// Broadcast a locally originated change. Must not block.
    fn emit(&self, event: RealtimeEvent) -> Result<(), ChannelError>;
}

/// Applies every event from a subscription to the store, in delivery order.
pub async fn listen(store: Arc<BoardStore>, mut rx: mpsc::UnboundedReceiver<RealtimeEvent>) {
    while let Some(event) = rx.recv().await {
        store.apply_remote(&event);
    }
    log::info!(
        "[corkboard.realtime.listen] Subscription for board {} ended",
        store.board_id()
    );
}

/// Background task running [`listen`] for the store's board.
pub struct RealtimeListener {
    task: JoinHandle<()>,
}

impl RealtimeListener {
    pub fn spawn(store: Arc<BoardStore>, channel: &dyn RealtimeChannel) -> Self {
        let rx = channel.subscribe(store.board_id());
        log::info!(
            "[corkboard.realtime.listen] Subscribed to board {}",
            store.board_id()
        );
        Self {
            task: tokio::spawn(listen(store, rx)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(self) {
        self.task.abort();
    }
}
