use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// The three record kinds that make up a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Board,
    List,
    Card,
}

impl EntityKind {
    /// Plural resource segment used in paths (`boards`, `lists`, `cards`).
    pub fn collection(self) -> &'static str {
        match self {
            EntityKind::Board => "boards",
            EntityKind::List => "lists",
            EntityKind::Card => "cards",
        }
    }

    /// The kind of the collection this kind lives in, if any.
    pub fn parent_kind(self) -> Option<EntityKind> {
        match self {
            EntityKind::Board => None,
            EntityKind::List => Some(EntityKind::Board),
            EntityKind::Card => Some(EntityKind::List),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Board => "board",
            EntityKind::List => "list",
            EntityKind::Card => "card",
        })
    }
}

/// A board, list or card record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub position: f64,
    /// Set by the authoritative store; `None` while the record is only optimistic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Entity {
    pub fn new(kind: EntityKind, id: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            parent_id,
            position: 0.0,
            updated_at: None,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn with_position(mut self, position: f64) -> Self {
        self.position = position;
        self
    }

    pub fn title(&self) -> Option<&str> {
        self.fields.get("title").and_then(Value::as_str)
    }

    /// Shallow key-by-key merge of a field diff. `null` values are stored as-is.
    pub fn apply_fields(&mut self, diff: &Map<String, Value>) {
        for (key, value) in diff {
            self.fields.insert(key.clone(), value.clone());
        }
    }

    /// Overwrite local placeholders with the authoritative record.
    ///
    /// Identity, parent, position and timestamp always come from the server.
    /// Fields the server did not return are kept.
    pub fn merge_authoritative(&mut self, server: &Entity) {
        self.id = server.id.clone();
        self.kind = server.kind;
        if server.parent_id.is_some() {
            self.parent_id = server.parent_id.clone();
        }
        self.position = server.position;
        self.updated_at = server.updated_at;
        self.apply_fields(&server.fields);
    }
}

/// In-memory state for the board currently being viewed.
///
/// Entities are kept in insertion order; display order of a collection is
/// always derived from `position` via [`BoardState::children`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardState {
    pub board_id: String,
    pub entities: Vec<Entity>,
}

impl BoardState {
    pub fn new(board_id: impl Into<String>) -> Self {
        Self {
            board_id: board_id.into(),
            entities: Vec::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Entity> {
        self.entities.iter_mut().find(|e| e.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Insert or replace by id.
    pub fn upsert(&mut self, entity: Entity) {
        match self.get_mut(&entity.id) {
            Some(existing) => *existing = entity,
            None => self.entities.push(entity),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Entity> {
        let idx = self.entities.iter().position(|e| e.id == id)?;
        Some(self.entities.remove(idx))
    }

    /// Remove an entity and everything below it (a list's cards, a board's lists).
    pub fn remove_tree(&mut self, id: &str) -> Vec<Entity> {
        let mut removed = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            let child_ids: Vec<String> = self
                .entities
                .iter()
                .filter(|e| e.parent_id.as_deref() == Some(current.as_str()))
                .map(|e| e.id.clone())
                .collect();
            stack.extend(child_ids);
            if let Some(entity) = self.remove(&current) {
                removed.push(entity);
            }
        }
        removed
    }

    /// Siblings under `parent_id` sorted by position, id as tie-breaker.
    pub fn children(&self, parent_id: &str) -> Vec<&Entity> {
        let mut children: Vec<&Entity> = self
            .entities
            .iter()
            .filter(|e| e.parent_id.as_deref() == Some(parent_id))
            .collect();
        children.sort_by(|a, b| {
            a.position
                .total_cmp(&b.position)
                .then_with(|| a.id.cmp(&b.id))
        });
        children
    }

    pub fn lists(&self) -> Vec<&Entity> {
        self.children(&self.board_id)
    }

    pub fn cards_in(&self, list_id: &str) -> Vec<&Entity> {
        self.children(list_id)
    }

    /// Whether an entity with this kind/parent belongs on the board being viewed.
    pub fn is_in_view(&self, kind: EntityKind, id: &str, parent_id: Option<&str>) -> bool {
        match kind {
            EntityKind::Board => id == self.board_id,
            EntityKind::List => parent_id == Some(self.board_id.as_str()),
            EntityKind::Card => parent_id
                .and_then(|p| self.get(p))
                .map_or(false, |list| list.kind == EntityKind::List),
        }
    }

    /// Rewrite a temporary id to its authoritative id, re-parenting children.
    pub fn replace_id(&mut self, old_id: &str, new_id: &str) {
        if old_id == new_id {
            return;
        }
        for entity in &mut self.entities {
            if entity.id == old_id {
                entity.id = new_id.to_string();
            }
            if entity.parent_id.as_deref() == Some(old_id) {
                entity.parent_id = Some(new_id.to_string());
            }
        }
    }
}

/// Resource path a queued write is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Target {
    pub fn entity(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: Some(id.into()),
            parent_id: None,
        }
    }

    pub fn collection(kind: EntityKind, parent_id: Option<String>) -> Self {
        Self {
            kind,
            id: None,
            parent_id,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.id, &self.parent_id) {
            (Some(id), _) => write!(f, "{}/{}", self.kind.collection(), id),
            (None, Some(parent)) => match self.kind.parent_kind() {
                Some(parent_kind) => write!(
                    f,
                    "{}/{}/{}",
                    parent_kind.collection(),
                    parent,
                    self.kind.collection()
                ),
                None => write!(f, "{}/{}", parent, self.kind.collection()),
            },
            (None, None) => f.write_str(self.kind.collection()),
        }
    }
}

/// A change requested by the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Create {
        kind: EntityKind,
        parent_id: Option<String>,
        fields: Map<String, Value>,
    },
    Update {
        id: String,
        fields: Map<String, Value>,
    },
    Delete {
        id: String,
    },
}
