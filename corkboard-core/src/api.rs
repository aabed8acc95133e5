/// Request/response contract of the authoritative document store.
///
/// Every call either returns the authoritative record (server-assigned id and
/// timestamps) or a classified error. The classification drives what the
/// coordinator does with its optimistic state: `Rejected` rolls back,
/// `Unreachable` keeps it and queues the write.
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::types::{Entity, EntityKind};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    /// The store refused the write (validation, authorization, not found).
    #[error("Rejected by server ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The store could not be reached (connection failure, timeout, gateway).
    #[error("Server unreachable: {0}")]
    Unreachable(String),
}

impl ApiError {
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        ApiError::Rejected {
            status,
            message: message.into(),
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, ApiError::Unreachable(_))
    }
}

#[async_trait]
pub trait BoardApi: Send + Sync {
    /// All entities of `kind` under `parent_id`.
    async fn list(&self, kind: EntityKind, parent_id: &str) -> Result<Vec<Entity>, ApiError>;

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Entity, ApiError>;

    async fn create(
        &self,
        kind: EntityKind,
        parent_id: Option<&str>,
        payload: &Value,
    ) -> Result<Entity, ApiError>;

    async fn update(&self, kind: EntityKind, id: &str, payload: &Value)
        -> Result<Entity, ApiError>;

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), ApiError>;

    /// Re-parent and re-position an entity. Shaped as an update by default.
    async fn move_entity(
        &self,
        kind: EntityKind,
        id: &str,
        parent_id: &str,
        position: f64,
    ) -> Result<Entity, ApiError> {
        self.update(kind, id, &move_payload(parent_id, position)).await
    }

    /// Cheap reachability check used by the connectivity probe.
    async fn ping(&self) -> Result<(), ApiError> {
        Ok(())
    }
}

/// Payload of a move expressed as an update.
pub fn move_payload(parent_id: &str, position: f64) -> Value {
    json!({ "parentId": parent_id, "position": position })
}
