/// Optimistic board state container.
///
/// Every local change goes through `apply_and_commit` or `move_entity`:
/// 1. snapshot the entities the change touches
/// 2. apply it to in-memory state and notify observers (no await before this)
/// 3. issue exactly one remote write
/// 4. confirmed -> merge the authoritative record
///    rejected  -> restore the snapshot, report the error
///    unreachable -> keep the optimistic state, hand the write to the queue
///
/// Remote events from the realtime listener land in the same state through
/// `apply_remote`. They win until an in-flight local write confirms, at which
/// point the confirmation overwrites them (last writer wins, no merge).
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch, Notify};

use crate::api::{move_payload, ApiError, BoardApi};
use crate::config::{board_cache_key, SyncConfig};
use crate::ids;
use crate::position::{self, MovePlan, PositionError};
use crate::queue::{ActionKind, DrainReport, MutationQueue, QueueError, QueuedAction, Replay};
use crate::realtime::{EntityPatch, EventType, RealtimeChannel, RealtimeEvent, SiblingPosition};
use crate::storage::{self, KeyValueStore, StorageError};
use crate::types::{BoardState, Entity, EntityKind, Mutation, Target};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{0}")]
    Rejected(ApiError),

    #[error("{0}")]
    Unreachable(ApiError),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Invalid move: {0}")]
    InvalidMove(String),

    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    #[error(transparent)]
    Position(#[from] PositionError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<ApiError> for SyncError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Unreachable(_) => SyncError::Unreachable(error),
            ApiError::Rejected { .. } => SyncError::Rejected(error),
        }
    }
}

/// Result of a mutation that was not rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// The server accepted the write. Holds the authoritative record (None for deletes).
    Confirmed(Option<Entity>),
    /// The server was unreachable; the write is durably queued and the
    /// optimistic state stays visible.
    Queued(QueuedAction),
}

impl CommitOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, CommitOutcome::Queued(_))
    }
}

/// Where the current state came from on `load()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Remote,
    Cache,
}

/// Why observers are being told about a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Confirmed,
    RolledBack,
    Remote,
    Replayed,
    Loaded,
}

/// Notifications for views and for user-facing error surfaces.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Changed {
        origin: ChangeOrigin,
        ids: Vec<String>,
    },
    /// A write was refused by the server (or depended on a create that was)
    /// and its optimistic change undone.
    Rejected { entity_id: String, error: ApiError },
    /// A queued write reached the server during a drain.
    Replayed {
        action: QueuedAction,
        entity: Option<Entity>,
    },
    /// A queued write was dropped after exhausting its retries. Local state
    /// still shows the edit, which the server never received. When the lost
    /// write is a create, `discarded` holds the queued writes that named it.
    WriteLost {
        action: QueuedAction,
        error: ApiError,
        discarded: Vec<QueuedAction>,
    },
}

/// Prior values of every entity a mutation touches. `None` = was absent.
#[derive(Debug, Clone, Default)]
struct Snapshot {
    entries: Vec<(String, Option<Entity>)>,
}

impl Snapshot {
    fn capture<'a>(state: &BoardState, ids: impl IntoIterator<Item = &'a str>) -> Self {
        let mut entries: Vec<(String, Option<Entity>)> = Vec::new();
        for id in ids {
            if entries.iter().all(|(existing, _)| existing != id) {
                entries.push((id.to_string(), state.get(id).cloned()));
            }
        }
        Self { entries }
    }

    fn absent(id: &str) -> Self {
        Self {
            entries: vec![(id.to_string(), None)],
        }
    }

    /// Restore entries, skipping placeholders (and their children) that a
    /// refused create has already removed.
    fn restore_surviving(&self, state: &mut BoardState) -> Vec<String> {
        let vanished = |id: &str| ids::is_temp_id(id) && !state.contains(id);
        let kept: Vec<&(String, Option<Entity>)> = self
            .entries
            .iter()
            .filter(|(id, prior)| {
                !vanished(id)
                    && prior
                        .as_ref()
                        .and_then(|e| e.parent_id.as_deref())
                        .map_or(true, |parent| !vanished(parent))
            })
            .collect();
        for (id, prior) in &kept {
            match prior {
                Some(entity) => state.upsert(entity.clone()),
                None => {
                    state.remove_tree(id);
                }
            }
        }
        kept.into_iter().map(|(id, _)| id.clone()).collect()
    }

    fn restore(&self, state: &mut BoardState) -> Vec<String> {
        for (id, prior) in &self.entries {
            match prior {
                Some(entity) => state.upsert(entity.clone()),
                None => {
                    state.remove_tree(id);
                }
            }
        }
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }
}

/// The single remote write a mutation issues.
#[derive(Debug, Clone)]
enum RemoteWrite {
    Create {
        kind: EntityKind,
        temp_id: String,
        parent_id: Option<String>,
        payload: Value,
    },
    Update {
        kind: EntityKind,
        id: String,
        payload: Value,
    },
    Delete {
        kind: EntityKind,
        id: String,
    },
    Move {
        kind: EntityKind,
        id: String,
        parent_id: String,
        position: f64,
    },
}

impl RemoteWrite {
    fn entity_id(&self) -> &str {
        match self {
            RemoteWrite::Create { temp_id, .. } => temp_id,
            RemoteWrite::Update { id, .. }
            | RemoteWrite::Delete { id, .. }
            | RemoteWrite::Move { id, .. } => id,
        }
    }

    /// Temporary ids the write names, including the one it creates.
    fn temp_ids(&self) -> Vec<String> {
        let named: Vec<&str> = match self {
            RemoteWrite::Create {
                temp_id, parent_id, ..
            } => std::iter::once(temp_id.as_str())
                .chain(parent_id.as_deref())
                .collect(),
            RemoteWrite::Move { id, parent_id, .. } => vec![id.as_str(), parent_id.as_str()],
            RemoteWrite::Update { id, .. } | RemoteWrite::Delete { id, .. } => vec![id.as_str()],
        };
        named
            .into_iter()
            .filter(|id| ids::is_temp_id(id))
            .map(str::to_string)
            .collect()
    }

    /// Point references to `temp_id` at the id the server assigned.
    fn resolve(&mut self, temp_id: &str, server_id: &str) {
        let swap = |slot: &mut String| {
            if *slot == temp_id {
                *slot = server_id.to_string();
            }
        };
        match self {
            RemoteWrite::Create { parent_id, .. } => {
                if let Some(parent) = parent_id {
                    swap(parent);
                }
            }
            RemoteWrite::Update { id, .. } | RemoteWrite::Delete { id, .. } => swap(id),
            RemoteWrite::Move { id, parent_id, .. } => {
                swap(id);
                swap(parent_id);
            }
        }
    }

    /// Whether the write names an entity the server has not assigned an id to yet.
    fn awaits_server_id(&self) -> bool {
        match self {
            RemoteWrite::Create { parent_id, .. } => {
                parent_id.as_deref().map_or(false, ids::is_temp_id)
            }
            RemoteWrite::Move { id, parent_id, .. } => {
                ids::is_temp_id(id) || ids::is_temp_id(parent_id)
            }
            RemoteWrite::Update { id, .. } | RemoteWrite::Delete { id, .. } => {
                ids::is_temp_id(id)
            }
        }
    }

    /// The same write expressed as a queued action.
    fn to_queued(&self) -> (ActionKind, Target, Value) {
        match self {
            RemoteWrite::Create {
                kind,
                temp_id,
                parent_id,
                payload,
            } => {
                let mut target = Target::collection(*kind, parent_id.clone());
                target.id = Some(temp_id.clone());
                (ActionKind::Create, target, payload.clone())
            }
            RemoteWrite::Update { kind, id, payload } => {
                (ActionKind::Update, Target::entity(*kind, id), payload.clone())
            }
            RemoteWrite::Delete { kind, id } => {
                (ActionKind::Delete, Target::entity(*kind, id), Value::Null)
            }
            RemoteWrite::Move {
                kind,
                id,
                parent_id,
                position,
            } => (
                ActionKind::Update,
                Target::entity(*kind, id),
                move_payload(parent_id, *position),
            ),
        }
    }
}

struct PendingWrite {
    snapshot: Snapshot,
    write: RemoteWrite,
}

/// How the latest write naming a temporary id ended.
#[derive(Debug, Clone)]
enum Settled {
    Pending,
    /// The server knows the entity under this id.
    Resolved(String),
    /// The write went to the durable queue; later writes must queue behind it.
    Queued,
    /// The create was refused and its placeholder removed.
    Dropped(ApiError),
}

/// A write's place behind earlier unsettled writes naming the same temporary id.
struct ChainSlot {
    temp_id: String,
    seq: u64,
    tx: watch::Sender<Settled>,
    ahead: Option<watch::Receiver<Settled>>,
}

pub struct BoardStore {
    board_id: String,
    client_id: String,
    state: RwLock<BoardState>,
    /// entity id -> number of unconfirmed local writes
    in_flight: Mutex<HashMap<String, usize>>,
    /// temp id -> the last unsettled write naming it
    chains: Mutex<HashMap<String, (u64, watch::Receiver<Settled>)>>,
    next_seq: AtomicU64,
    replay: Notify,
    api: Arc<dyn BoardApi>,
    queue: Arc<MutationQueue>,
    storage: Arc<dyn KeyValueStore>,
    channel: Option<Arc<dyn RealtimeChannel>>,
    event_tx: broadcast::Sender<StoreEvent>,
}

impl BoardStore {
    pub fn new(
        board_id: impl Into<String>,
        api: Arc<dyn BoardApi>,
        queue: Arc<MutationQueue>,
        storage: Arc<dyn KeyValueStore>,
        config: &SyncConfig,
    ) -> Self {
        let board_id = board_id.into();
        let (event_tx, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            state: RwLock::new(BoardState::new(board_id.clone())),
            board_id,
            client_id: uuid::Uuid::new_v4().to_string(),
            in_flight: Mutex::new(HashMap::new()),
            chains: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            replay: Notify::new(),
            api,
            queue,
            storage,
            channel: None,
            event_tx,
        }
    }

    /// Emit move notifications on this channel and skip its echoes.
    pub fn with_channel(mut self, channel: Arc<dyn RealtimeChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    /// Copy of the current state.
    pub fn state(&self) -> BoardState {
        self.state.read().unwrap().clone()
    }

    pub fn entity(&self, id: &str) -> Option<Entity> {
        self.state.read().unwrap().get(id).cloned()
    }

    /// Lists of the board in display order.
    pub fn lists(&self) -> Vec<Entity> {
        self.state
            .read()
            .unwrap()
            .lists()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Cards of a list in display order.
    pub fn cards_in(&self, list_id: &str) -> Vec<Entity> {
        self.state
            .read()
            .unwrap()
            .cards_in(list_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.event_tx.subscribe()
    }

    /// Whether a local write for this entity is still awaiting the server.
    pub fn has_pending_write(&self, id: &str) -> bool {
        self.in_flight.lock().unwrap().contains_key(id)
    }

    /// Ask the replay task to drain the queue. Does not wait for it.
    pub fn request_drain(&self) {
        self.replay.notify_one();
    }

    /// Completes once `request_drain` has been called since the last wait.
    pub async fn drain_requested(&self) {
        self.replay.notified().await;
    }

    fn notify(&self, origin: ChangeOrigin, ids: Vec<String>) {
        let _ = self.event_tx.send(StoreEvent::Changed { origin, ids });
    }

    // ── Loading ──────────────────────────────────────────────────────────────

    /// Replace state with the server's copy of the board, falling back to the
    /// offline cache when the server cannot be reached. Writes still waiting
    /// in the queue are re-applied on top so local edits stay visible.
    pub async fn load(&self) -> Result<LoadSource, SyncError> {
        let cache_key = board_cache_key(&self.board_id);
        let (mut loaded, source) = match self.fetch_remote().await {
            Ok(state) => {
                storage::save_json(self.storage.as_ref(), &cache_key, &state)?;
                (state, LoadSource::Remote)
            }
            Err(error @ ApiError::Unreachable(_)) => {
                match storage::load_json::<BoardState>(self.storage.as_ref(), &cache_key) {
                    Ok(Some(cached)) => {
                        log::info!(
                            "[corkboard.store.load] Server unreachable, using cached board {}",
                            self.board_id
                        );
                        (cached, LoadSource::Cache)
                    }
                    Ok(None) => return Err(SyncError::Unreachable(error)),
                    Err(e) => {
                        log::warn!("[corkboard.store.load] Cache unreadable: {}", e);
                        return Err(SyncError::Unreachable(error));
                    }
                }
            }
            Err(error) => return Err(SyncError::Rejected(error)),
        };

        let pending = self.queue.pending()?;
        overlay_pending(&mut loaded, &pending);

        let loaded_ids = loaded.entities.iter().map(|e| e.id.clone()).collect();
        *self.state.write().unwrap() = loaded;
        log::info!(
            "[corkboard.store.load] Loaded board {} from {:?} ({} queued writes overlaid)",
            self.board_id,
            source,
            pending.len()
        );
        self.notify(ChangeOrigin::Loaded, loaded_ids);
        Ok(source)
    }

    async fn fetch_remote(&self) -> Result<BoardState, ApiError> {
        let mut state = BoardState::new(self.board_id.clone());
        state.upsert(self.api.get(EntityKind::Board, &self.board_id).await?);
        let lists = self.api.list(EntityKind::List, &self.board_id).await?;
        for list in lists {
            let cards = self.api.list(EntityKind::Card, &list.id).await?;
            state.upsert(list);
            for card in cards {
                state.upsert(card);
            }
        }
        Ok(state)
    }

    /// Persist the current state as the offline cache.
    pub fn save_cache(&self) -> Result<(), SyncError> {
        let state = self.state();
        storage::save_json(self.storage.as_ref(), &board_cache_key(&self.board_id), &state)?;
        Ok(())
    }

    // ── Local mutations ──────────────────────────────────────────────────────

    /// Apply a change locally, then commit it to the server.
    pub async fn apply_and_commit(&self, mutation: Mutation) -> Result<CommitOutcome, SyncError> {
        let pending = self.apply_local(mutation)?;
        self.commit(pending).await
    }

    fn apply_local(&self, mutation: Mutation) -> Result<PendingWrite, SyncError> {
        let mut state = self.state.write().unwrap();
        let (pending, touched) = match mutation {
            Mutation::Create {
                kind,
                parent_id,
                fields,
            } => {
                let parent_id = match kind {
                    EntityKind::Board => {
                        return Err(SyncError::InvalidMutation(
                            "boards cannot be created inside a board view".into(),
                        ))
                    }
                    EntityKind::List => parent_id.unwrap_or_else(|| self.board_id.clone()),
                    EntityKind::Card => parent_id.ok_or_else(|| {
                        SyncError::InvalidMutation("a card needs a parent list".into())
                    })?,
                };
                self.check_parent(&state, kind, &parent_id)?;

                let temp_id = ids::temp_id();
                let position = position::append_position(&state.children(&parent_id));
                let mut entity = Entity::new(kind, temp_id.clone(), Some(parent_id.clone()))
                    .with_position(position);
                entity.apply_fields(&fields);
                state.upsert(entity);

                let mut payload = fields;
                payload.insert("position".into(), Value::from(position));
                let write = RemoteWrite::Create {
                    kind,
                    temp_id: temp_id.clone(),
                    parent_id: Some(parent_id),
                    payload: Value::Object(payload),
                };
                (
                    PendingWrite {
                        snapshot: Snapshot::absent(&temp_id),
                        write,
                    },
                    vec![temp_id],
                )
            }
            Mutation::Update { id, fields } => {
                let snapshot = Snapshot::capture(&state, [id.as_str()]);
                let entity = state
                    .get_mut(&id)
                    .ok_or_else(|| SyncError::EntityNotFound(id.clone()))?;
                entity.apply_fields(&fields);
                let write = RemoteWrite::Update {
                    kind: entity.kind,
                    id: id.clone(),
                    payload: Value::Object(fields),
                };
                (PendingWrite { snapshot, write }, vec![id])
            }
            Mutation::Delete { id } => {
                let kind = state
                    .get(&id)
                    .map(|e| e.kind)
                    .ok_or_else(|| SyncError::EntityNotFound(id.clone()))?;
                let removed = state.remove_tree(&id);
                let snapshot = Snapshot {
                    entries: removed
                        .iter()
                        .map(|e| (e.id.clone(), Some(e.clone())))
                        .collect(),
                };
                let touched = removed.into_iter().map(|e| e.id).collect();
                (
                    PendingWrite {
                        snapshot,
                        write: RemoteWrite::Delete { kind, id },
                    },
                    touched,
                )
            }
        };
        drop(state);

        self.begin_write(pending.write.entity_id());
        self.notify(ChangeOrigin::Local, touched);
        Ok(pending)
    }

    /// Move an entity to `destination_index` in `to`, re-ranking every
    /// sibling in the collections involved.
    pub async fn move_entity(
        &self,
        id: &str,
        from: &str,
        to: &str,
        destination_index: usize,
    ) -> Result<CommitOutcome, SyncError> {
        let (pending, plan, kind) = {
            let mut state = self.state.write().unwrap();
            let entity = state
                .get(id)
                .ok_or_else(|| SyncError::EntityNotFound(id.to_string()))?;
            let kind = entity.kind;
            if entity.parent_id.as_deref() != Some(from) {
                return Err(SyncError::InvalidMove(format!(
                    "{} is not in {}",
                    id, from
                )));
            }
            self.check_parent(&state, kind, to)?;

            let source = state.children(from);
            let source_index = source
                .iter()
                .position(|e| e.id == id)
                .ok_or_else(|| SyncError::EntityNotFound(id.to_string()))?;
            let plan = if from == to {
                position::compute_positions(&source, source_index, destination_index)?
            } else {
                let destination = state.children(to);
                position::compute_transfer(&source, &destination, source_index, destination_index)?
            };

            let snapshot = Snapshot::capture(&state, plan.updates().map(|u| u.id.as_str()));
            for update in plan.updates() {
                if let Some(sibling) = state.get_mut(&update.id) {
                    sibling.position = update.position;
                }
            }
            if let Some(moved) = state.get_mut(id) {
                moved.parent_id = Some(to.to_string());
            }

            let write = RemoteWrite::Move {
                kind,
                id: id.to_string(),
                parent_id: to.to_string(),
                position: plan.position,
            };
            (PendingWrite { snapshot, write }, plan, kind)
        };

        self.begin_write(id);
        self.notify(
            ChangeOrigin::Local,
            plan.updates().map(|u| u.id.clone()).collect(),
        );
        self.emit_move(kind, to, &plan);
        self.commit(pending).await
    }

    /// Lists go under the board, cards under a list that exists locally.
    fn check_parent(
        &self,
        state: &BoardState,
        kind: EntityKind,
        parent_id: &str,
    ) -> Result<(), SyncError> {
        let valid = match kind {
            EntityKind::Board => false,
            EntityKind::List => parent_id == self.board_id,
            EntityKind::Card => state
                .get(parent_id)
                .map_or(false, |p| p.kind == EntityKind::List),
        };
        if valid {
            Ok(())
        } else {
            Err(SyncError::EntityNotFound(format!(
                "{} parent {}",
                kind, parent_id
            )))
        }
    }

    /// Tell collaborators about a move as soon as it is applied locally.
    fn emit_move(&self, kind: EntityKind, to: &str, plan: &MovePlan) {
        let Some(channel) = &self.channel else {
            return;
        };
        let patch = EntityPatch {
            parent_id: Some(to.to_string()),
            position: Some(plan.position),
            siblings: plan
                .updates()
                .map(|u| SiblingPosition {
                    id: u.id.clone(),
                    position: u.position,
                })
                .collect(),
            ..EntityPatch::default()
        };
        let event = RealtimeEvent {
            event_type: EventType::Moved,
            entity_kind: kind,
            entity_id: plan.moved_id.clone(),
            payload: patch.to_payload(),
            origin: Some(self.client_id.clone()),
        };
        if let Err(e) = channel.emit(event) {
            log::warn!("[corkboard.store.move] Move notification not sent: {}", e);
        }
    }

    fn begin_write(&self, id: &str) {
        *self.in_flight.lock().unwrap().entry(id.to_string()).or_insert(0) += 1;
    }

    fn end_write(&self, id: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(count) = in_flight.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(id);
            }
        }
    }

    // ── Commit ───────────────────────────────────────────────────────────────

    async fn commit(&self, pending: PendingWrite) -> Result<CommitOutcome, SyncError> {
        let PendingWrite {
            snapshot,
            mut write,
        } = pending;
        let entity_id = write.entity_id().to_string();

        // A write naming a placeholder goes out only after every earlier
        // write naming it has settled, so the create always leads.
        let mut slots = self.join_chains(&write);
        let mut ahead = Vec::with_capacity(slots.len());
        for slot in &mut slots {
            let settled = match slot.ahead.as_mut() {
                Some(rx) => Some(
                    match rx.wait_for(|s| !matches!(s, Settled::Pending)).await {
                        Ok(settled) => Settled::clone(&settled),
                        Err(_) => Settled::Queued,
                    },
                ),
                None => None,
            };
            if let Some(Settled::Resolved(server_id)) = &settled {
                write.resolve(&slot.temp_id, server_id);
            }
            ahead.push(settled);
        }

        let refused = ahead.iter().find_map(|settled| match settled {
            Some(Settled::Dropped(error)) => Some(error.clone()),
            _ => None,
        });
        let result = match refused {
            Some(error) => self.abandon(&snapshot, &entity_id, error),
            None => self.deliver(&snapshot, &write, &entity_id).await,
        };
        self.settle(slots, ahead, &write, &result);
        result
    }

    /// Queue behind the last unsettled write for each temporary id `write` names.
    fn join_chains(&self, write: &RemoteWrite) -> Vec<ChainSlot> {
        let mut chains = self.chains.lock().unwrap();
        write
            .temp_ids()
            .into_iter()
            .map(|temp_id| {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(Settled::Pending);
                let ahead = chains.insert(temp_id.clone(), (seq, rx)).map(|(_, rx)| rx);
                ChainSlot {
                    temp_id,
                    seq,
                    tx,
                    ahead,
                }
            })
            .collect()
    }

    /// Tell the writes behind this one how it ended.
    fn settle(
        &self,
        slots: Vec<ChainSlot>,
        ahead: Vec<Option<Settled>>,
        write: &RemoteWrite,
        result: &Result<CommitOutcome, SyncError>,
    ) {
        let created = match write {
            RemoteWrite::Create { temp_id, .. } => Some(temp_id.as_str()),
            _ => None,
        };
        let mut chains = self.chains.lock().unwrap();
        for (slot, ahead) in slots.into_iter().zip(ahead) {
            let settled = if created == Some(slot.temp_id.as_str()) {
                match result {
                    Ok(CommitOutcome::Confirmed(Some(server))) => {
                        Settled::Resolved(server.id.clone())
                    }
                    Err(SyncError::Rejected(error)) => Settled::Dropped(error.clone()),
                    _ => Settled::Queued,
                }
            } else {
                match (ahead, result) {
                    (Some(dropped @ Settled::Dropped(_)), _) => dropped,
                    (_, Ok(CommitOutcome::Queued(_))) => Settled::Queued,
                    (Some(resolved @ Settled::Resolved(_)), _) => resolved,
                    _ => Settled::Queued,
                }
            };
            if chains.get(&slot.temp_id).map_or(false, |(seq, _)| *seq == slot.seq) {
                chains.remove(&slot.temp_id);
            }
            slot.tx.send_replace(settled);
        }
    }

    /// Undo a write whose placeholder's create was refused. The placeholder
    /// is already gone; everything else it touched gets its prior value back.
    fn abandon(
        &self,
        snapshot: &Snapshot,
        entity_id: &str,
        error: ApiError,
    ) -> Result<CommitOutcome, SyncError> {
        self.end_write(entity_id);
        log::warn!(
            "[corkboard.store.commit] {} depends on a refused create, rolling back: {}",
            entity_id,
            error
        );
        let restored = {
            let mut state = self.state.write().unwrap();
            snapshot.restore_surviving(&mut state)
        };
        self.notify(ChangeOrigin::RolledBack, restored);
        let _ = self.event_tx.send(StoreEvent::Rejected {
            entity_id: entity_id.to_string(),
            error: error.clone(),
        });
        Err(SyncError::Rejected(error))
    }

    async fn deliver(
        &self,
        snapshot: &Snapshot,
        write: &RemoteWrite,
        entity_id: &str,
    ) -> Result<CommitOutcome, SyncError> {
        // Writes still naming a temporary id wait in the queue until the
        // create that introduces it has been replayed.
        let result = if write.awaits_server_id() {
            Err(ApiError::Unreachable(format!(
                "{} depends on an unconfirmed create",
                entity_id
            )))
        } else {
            self.send(write).await
        };
        self.end_write(entity_id);

        match result {
            Ok(confirmed) => {
                self.confirm(write, confirmed.as_ref())?;
                Ok(CommitOutcome::Confirmed(confirmed))
            }
            Err(error @ ApiError::Unreachable(_)) => {
                log::info!(
                    "[corkboard.store.commit] {} unreachable ({}), keeping local change",
                    entity_id,
                    error
                );
                let (kind, target, payload) = write.to_queued();
                let action = self.queue.enqueue(kind, target, payload)?;
                Ok(CommitOutcome::Queued(action))
            }
            Err(error) => {
                log::warn!(
                    "[corkboard.store.commit] {} rejected, rolling back: {}",
                    entity_id,
                    error
                );
                let restored = {
                    let mut state = self.state.write().unwrap();
                    snapshot.restore(&mut state)
                };
                if let RemoteWrite::Create { temp_id, .. } = write {
                    self.queue.discard_referencing(temp_id)?;
                }
                self.notify(ChangeOrigin::RolledBack, restored);
                let _ = self.event_tx.send(StoreEvent::Rejected {
                    entity_id: entity_id.to_string(),
                    error: error.clone(),
                });
                Err(SyncError::Rejected(error))
            }
        }
    }

    async fn send(&self, write: &RemoteWrite) -> Result<Option<Entity>, ApiError> {
        match write {
            RemoteWrite::Create {
                kind,
                parent_id,
                payload,
                ..
            } => self
                .api
                .create(*kind, parent_id.as_deref(), payload)
                .await
                .map(Some),
            RemoteWrite::Update { kind, id, payload } => {
                self.api.update(*kind, id, payload).await.map(Some)
            }
            RemoteWrite::Delete { kind, id } => self.api.delete(*kind, id).await.map(|_| None),
            RemoteWrite::Move {
                kind,
                id,
                parent_id,
                position,
            } => self
                .api
                .move_entity(*kind, id, parent_id, *position)
                .await
                .map(Some),
        }
    }

    /// Merge a confirmed write. A confirmed create also points queued writes
    /// at the server id and asks for a replay.
    fn confirm(&self, write: &RemoteWrite, server: Option<&Entity>) -> Result<(), SyncError> {
        let Some(server) = server else {
            self.notify(ChangeOrigin::Confirmed, vec![write.entity_id().to_string()]);
            return Ok(());
        };
        let local_id = write.entity_id().to_string();
        self.merge_server_entity(&local_id, server, ChangeOrigin::Confirmed);

        if local_id != server.id && self.queue.rewrite_ids(&local_id, &server.id)? > 0 {
            log::debug!(
                "[corkboard.store.commit] Queued writes now name {}, requesting replay",
                server.id
            );
            self.request_drain();
        }
        Ok(())
    }

    /// Overwrite the local record for `local_id` with the server's. Records
    /// removed locally in the meantime are not resurrected.
    fn merge_server_entity(&self, local_id: &str, server: &Entity, origin: ChangeOrigin) {
        let mut state = self.state.write().unwrap();
        let Some(local) = state.get_mut(local_id) else {
            log::debug!(
                "[corkboard.store.merge] {} no longer present, ignoring server copy",
                local_id
            );
            return;
        };
        local.merge_authoritative(server);
        let parent = local.parent_id.clone();
        state.replace_id(local_id, &server.id);
        if let Some(parent) = parent {
            repair_order(&mut state, &parent, &server.id);
        }
        drop(state);

        let mut changed = vec![server.id.clone()];
        if local_id != server.id {
            changed.push(local_id.to_string());
        }
        self.notify(origin, changed);
    }

    // ── Offline replay ───────────────────────────────────────────────────────

    /// Replay the durable queue, merging each server response into state.
    pub async fn drain(&self) -> Result<DrainReport, SyncError> {
        let report = self
            .queue
            .drain(self.api.as_ref(), |action, replay| {
                self.on_replayed(action, replay)
            })
            .await?;
        if !report.skipped {
            log::info!(
                "[corkboard.store.drain] Delivered {}, lost {}, remaining {}",
                report.delivered,
                report.lost,
                report.remaining
            );
        }
        Ok(report)
    }

    fn on_replayed(&self, action: &QueuedAction, replay: Replay<'_>) {
        match replay {
            Replay::Delivered(entity) => {
                if let Some(server) = entity {
                    let local_id = action.target.id.as_deref().unwrap_or(&server.id);
                    self.merge_server_entity(local_id, server, ChangeOrigin::Replayed);
                }
                let _ = self.event_tx.send(StoreEvent::Replayed {
                    action: action.clone(),
                    entity: entity.cloned(),
                });
            }
            Replay::Lost { error, discarded } => {
                let _ = self.event_tx.send(StoreEvent::WriteLost {
                    action: action.clone(),
                    error: error.clone(),
                    discarded: discarded.to_vec(),
                });
            }
        }
    }

    // ── Remote events ────────────────────────────────────────────────────────

    /// Merge an event pushed by another collaborator.
    pub fn apply_remote(&self, event: &RealtimeEvent) {
        if event.origin.as_deref() == Some(self.client_id.as_str()) {
            return;
        }

        let mut state = self.state.write().unwrap();
        let id = event.entity_id.as_str();

        if event.event_type == EventType::Deleted {
            let removed = state.remove_tree(id);
            drop(state);
            if !removed.is_empty() {
                self.notify(
                    ChangeOrigin::Remote,
                    removed.into_iter().map(|e| e.id).collect(),
                );
            }
            return;
        }

        let patch = EntityPatch::from_payload(&event.payload);
        let parent = patch
            .parent_id
            .clone()
            .or_else(|| state.get(id).and_then(|e| e.parent_id.clone()));
        if !state.contains(id) && !state.is_in_view(event.entity_kind, id, parent.as_deref()) {
            return;
        }
        if self.has_pending_write(id) {
            log::debug!(
                "[corkboard.store.remote] {} has an unconfirmed local write, applying remote change for now",
                id
            );
        }

        let mut entity = state
            .get(id)
            .cloned()
            .unwrap_or_else(|| Entity::new(event.entity_kind, id, parent.clone()));
        if let Some(parent) = &patch.parent_id {
            entity.parent_id = Some(parent.clone());
        }
        if let Some(position) = patch.position {
            entity.position = position;
        }
        if patch.updated_at.is_some() {
            entity.updated_at = patch.updated_at;
        }
        entity.apply_fields(&patch.fields);
        state.upsert(entity);

        let mut touched = vec![id.to_string()];
        for sibling in &patch.siblings {
            if let Some(local) = state.get_mut(&sibling.id) {
                local.position = sibling.position;
                touched.push(sibling.id.clone());
            }
        }
        if let Some(parent) = &parent {
            repair_order(&mut state, parent, id);
        }
        drop(state);
        self.notify(ChangeOrigin::Remote, touched);
    }
}

/// Re-rank a collection if two siblings share a position. At a tie the
/// entity that just changed keeps the contested slot.
fn repair_order(state: &mut BoardState, parent_id: &str, changed_id: &str) {
    let mut siblings: Vec<(String, f64)> = state
        .children(parent_id)
        .iter()
        .map(|e| (e.id.clone(), e.position))
        .collect();
    let positions: Vec<f64> = siblings.iter().map(|(_, p)| *p).collect();
    if position::has_distinct_order(&positions) {
        return;
    }

    siblings.sort_by(|a, b| {
        a.1.total_cmp(&b.1)
            .then_with(|| (a.0 != changed_id).cmp(&(b.0 != changed_id)))
            .then_with(|| a.0.cmp(&b.0))
    });
    for (rank, (id, _)) in siblings.iter().enumerate() {
        if let Some(entity) = state.get_mut(id) {
            entity.position = rank as f64;
        }
    }
    log::debug!(
        "[corkboard.store.order] Re-ranked {} siblings under {}",
        siblings.len(),
        parent_id
    );
}

/// Re-apply queued writes to freshly loaded state.
fn overlay_pending(state: &mut BoardState, pending: &[QueuedAction]) {
    for action in pending {
        let target = &action.target;
        match action.kind {
            ActionKind::Create => {
                let Some(id) = &target.id else { continue };
                let mut entity = Entity::new(target.kind, id.clone(), target.parent_id.clone());
                if let Some(fields) = action.payload.as_object() {
                    apply_payload(&mut entity, fields);
                }
                state.upsert(entity);
            }
            ActionKind::Update => {
                let Some(id) = target.id.as_deref() else {
                    continue;
                };
                let Some(entity) = state.get_mut(id) else {
                    continue;
                };
                if let Some(fields) = action.payload.as_object() {
                    apply_payload(entity, fields);
                }
            }
            ActionKind::Delete => {
                if let Some(id) = &target.id {
                    state.remove_tree(id);
                }
            }
        }
    }
}

/// Apply a write payload: `parentId`/`position` are structural, the rest are fields.
fn apply_payload(entity: &mut Entity, payload: &Map<String, Value>) {
    for (key, value) in payload {
        match key.as_str() {
            "parentId" => {
                if let Some(parent) = value.as_str() {
                    entity.parent_id = Some(parent.to_string());
                }
            }
            "position" => {
                if let Some(position) = value.as_f64() {
                    entity.position = position;
                }
            }
            _ => {
                entity.fields.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::testing::{FakeApi, FakeChannel};
    use serde_json::json;

    struct Harness {
        api: Arc<FakeApi>,
        channel: Arc<FakeChannel>,
        store: BoardStore,
    }

    fn fields(title: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("title".into(), json!(title));
        map
    }

    /// Board b1 with list l1 holding cards A, B, C at positions 0, 1, 2 and an empty list l2.
    async fn harness() -> Harness {
        let api = Arc::new(FakeApi::new());
        api.seed(Entity::new(EntityKind::Board, "b1", None).with_field("title", "Board"));
        api.seed(Entity::new(EntityKind::List, "l1", Some("b1".into())).with_position(0.0));
        api.seed(Entity::new(EntityKind::List, "l2", Some("b1".into())).with_position(1.0));
        for (i, title) in ["A", "B", "C"].iter().enumerate() {
            api.seed(
                Entity::new(EntityKind::Card, *title, Some("l1".into()))
                    .with_position(i as f64)
                    .with_field("title", *title),
            );
        }

        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = SyncConfig {
            retry_delay_ms: 0,
            ..SyncConfig::default()
        };
        let queue = Arc::new(MutationQueue::new(storage.clone(), config.clone()));
        let channel = Arc::new(FakeChannel::new());
        let store = BoardStore::new("b1", api.clone(), queue, storage, &config)
            .with_channel(channel.clone())
            .with_client_id("me");
        store.load().await.unwrap();
        Harness {
            api,
            channel,
            store,
        }
    }

    fn titles(store: &BoardStore, list: &str) -> Vec<String> {
        store
            .cards_in(list)
            .iter()
            .map(|c| c.title().unwrap_or_default().to_string())
            .collect()
    }

    fn positions(store: &BoardStore, list: &str) -> Vec<f64> {
        store.cards_in(list).iter().map(|c| c.position).collect()
    }

    #[tokio::test]
    async fn test_load_fetches_board_lists_and_cards() {
        let h = harness().await;
        assert_eq!(h.store.lists().len(), 2);
        assert_eq!(titles(&h.store, "l1"), vec!["A", "B", "C"]);
        assert!(h.store.entity("b1").is_some());
    }

    #[tokio::test]
    async fn test_update_confirms_and_merges_server_timestamp() {
        let h = harness().await;
        let outcome = h
            .store
            .apply_and_commit(Mutation::Update {
                id: "A".into(),
                fields: fields("A2"),
            })
            .await
            .unwrap();

        assert!(matches!(outcome, CommitOutcome::Confirmed(Some(_))));
        let card = h.store.entity("A").unwrap();
        assert_eq!(card.title(), Some("A2"));
        assert!(card.updated_at.is_some());
        assert!(!h.store.has_pending_write("A"));
    }

    #[tokio::test]
    async fn test_rejected_update_restores_snapshot() {
        let h = harness().await;
        let before = h.store.state();
        let mut events = h.store.subscribe();
        h.api.script_err(ApiError::rejected(422, "title too long"));

        let result = h
            .store
            .apply_and_commit(Mutation::Update {
                id: "B".into(),
                fields: fields("way too long"),
            })
            .await;

        assert!(matches!(result, Err(SyncError::Rejected(_))));
        assert_eq!(h.store.state(), before);
        assert!(h.store.queue().is_empty().unwrap());

        let mut rejected = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, StoreEvent::Rejected { .. }) {
                rejected += 1;
            }
        }
        assert_eq!(rejected, 1);
    }

    #[tokio::test]
    async fn test_rejected_delete_restores_whole_subtree() {
        let h = harness().await;
        let before = h.store.state();
        h.api.script_err(ApiError::rejected(403, "forbidden"));

        let result = h
            .store
            .apply_and_commit(Mutation::Delete { id: "l1".into() })
            .await;

        assert!(result.is_err());
        let mut after = h.store.state();
        let mut expected = before.clone();
        after.entities.sort_by(|a, b| a.id.cmp(&b.id));
        expected.entities.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(after, expected);
    }

    #[tokio::test]
    async fn test_unreachable_update_keeps_optimistic_state_and_queues_once() {
        let h = harness().await;
        h.api.set_unreachable(true);

        let outcome = h
            .store
            .apply_and_commit(Mutation::Update {
                id: "C".into(),
                fields: fields("offline edit"),
            })
            .await
            .unwrap();

        assert!(outcome.is_queued());
        assert_eq!(h.store.entity("C").unwrap().title(), Some("offline edit"));
        let pending = h.store.queue().pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target, Target::entity(EntityKind::Card, "C"));
    }

    #[tokio::test]
    async fn test_create_replaces_temp_id_in_place() {
        let h = harness().await;
        let outcome = h
            .store
            .apply_and_commit(Mutation::Create {
                kind: EntityKind::Card,
                parent_id: Some("l2".into()),
                fields: fields("New"),
            })
            .await
            .unwrap();

        let CommitOutcome::Confirmed(Some(server)) = outcome else {
            panic!("expected confirmation");
        };
        assert!(!ids::is_temp_id(&server.id));
        let cards = h.store.cards_in("l2");
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].id, server.id);
        assert_eq!(cards[0].position, 0.0);
        assert!(cards[0].updated_at.is_some());
    }

    #[tokio::test]
    async fn test_create_appends_after_last_sibling() {
        let h = harness().await;
        h.api.set_unreachable(true);
        h.store
            .apply_and_commit(Mutation::Create {
                kind: EntityKind::Card,
                parent_id: Some("l1".into()),
                fields: fields("D"),
            })
            .await
            .unwrap();
        assert_eq!(titles(&h.store, "l1"), vec!["A", "B", "C", "D"]);
        assert_eq!(positions(&h.store, "l1"), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_rejected_create_removes_placeholder() {
        let h = harness().await;
        h.api.script_err(ApiError::rejected(422, "title required"));
        let result = h
            .store
            .apply_and_commit(Mutation::Create {
                kind: EntityKind::Card,
                parent_id: Some("l2".into()),
                fields: Map::new(),
            })
            .await;
        assert!(result.is_err());
        assert!(h.store.cards_in("l2").is_empty());
    }

    #[tokio::test]
    async fn test_create_under_unknown_parent_fails_without_write() {
        let h = harness().await;
        let calls_before = h.api.calls().len();
        let result = h
            .store
            .apply_and_commit(Mutation::Create {
                kind: EntityKind::Card,
                parent_id: Some("nope".into()),
                fields: fields("X"),
            })
            .await;
        assert!(matches!(result, Err(SyncError::EntityNotFound(_))));
        assert_eq!(h.api.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_update_unknown_entity() {
        let h = harness().await;
        let result = h
            .store
            .apply_and_commit(Mutation::Update {
                id: "ghost".into(),
                fields: fields("X"),
            })
            .await;
        assert!(matches!(result, Err(SyncError::EntityNotFound(_))));
    }

    #[tokio::test]
    async fn test_move_last_card_to_front_while_offline() {
        let h = harness().await;
        h.api.set_unreachable(true);

        let outcome = h.store.move_entity("C", "l1", "l1", 0).await.unwrap();

        assert!(outcome.is_queued());
        assert_eq!(titles(&h.store, "l1"), vec!["C", "A", "B"]);
        assert!(position::has_distinct_order(&positions(&h.store, "l1")));

        let pending = h.store.queue().pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, ActionKind::Update);
        assert_eq!(pending[0].payload, move_payload("l1", 0.0));
    }

    #[tokio::test]
    async fn test_move_emits_notification_before_confirmation() {
        let h = harness().await;
        h.api.set_unreachable(true);
        h.store.move_entity("A", "l1", "l2", 0).await.unwrap();

        let emitted = h.channel.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].event_type, EventType::Moved);
        assert_eq!(emitted[0].entity_id, "A");
        assert_eq!(emitted[0].origin.as_deref(), Some("me"));

        assert_eq!(titles(&h.store, "l1"), vec!["B", "C"]);
        assert_eq!(positions(&h.store, "l1"), vec![0.0, 1.0]);
        assert_eq!(titles(&h.store, "l2"), vec!["A"]);
    }

    #[tokio::test]
    async fn test_rejected_move_restores_both_collections() {
        let h = harness().await;
        let before = h.store.state();
        h.api.script_err(ApiError::rejected(409, "list archived"));

        let result = h.store.move_entity("B", "l1", "l2", 0).await;

        assert!(result.is_err());
        assert_eq!(titles(&h.store, "l1"), vec!["A", "B", "C"]);
        assert!(h.store.cards_in("l2").is_empty());
        assert_eq!(h.store.entity("B"), before.get("B").cloned());
    }

    #[tokio::test]
    async fn test_move_from_wrong_collection() {
        let h = harness().await;
        let result = h.store.move_entity("A", "l2", "l1", 0).await;
        assert!(matches!(result, Err(SyncError::InvalidMove(_))));
    }

    #[tokio::test]
    async fn test_same_index_move_succeeds() {
        let h = harness().await;
        let outcome = h.store.move_entity("B", "l1", "l1", 1).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Confirmed(_)));
        assert_eq!(titles(&h.store, "l1"), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_sequential_updates_apply_in_call_order() {
        let h = harness().await;
        h.api.set_unreachable(true);
        let first = h.store.apply_and_commit(Mutation::Update {
            id: "A".into(),
            fields: fields("first"),
        });
        let second = h.store.apply_and_commit(Mutation::Update {
            id: "A".into(),
            fields: fields("second"),
        });
        let (a, b) = tokio::join!(first, second);
        a.unwrap();
        b.unwrap();

        assert_eq!(h.store.entity("A").unwrap().title(), Some("second"));
        let pending = h.store.queue().pending().unwrap();
        assert_eq!(pending[0].payload["title"], "first");
        assert_eq!(pending[1].payload["title"], "second");
    }

    #[tokio::test]
    async fn test_offline_create_then_update_replays_with_server_id() {
        let h = harness().await;
        h.api.set_unreachable(true);
        let created = h
            .store
            .apply_and_commit(Mutation::Create {
                kind: EntityKind::Card,
                parent_id: Some("l2".into()),
                fields: fields("draft"),
            })
            .await
            .unwrap();
        let CommitOutcome::Queued(action) = created else {
            panic!("expected queued create");
        };
        let temp_id = action.target.id.clone().unwrap();
        h.store
            .apply_and_commit(Mutation::Update {
                id: temp_id.clone(),
                fields: fields("final"),
            })
            .await
            .unwrap();

        h.api.set_unreachable(false);
        let report = h.store.drain().await.unwrap();
        assert_eq!(report.delivered, 2);

        let cards = h.store.cards_in("l2");
        assert_eq!(cards.len(), 1);
        assert!(!ids::is_temp_id(&cards[0].id));
        assert_eq!(cards[0].title(), Some("final"));
        assert_eq!(
            h.api.record(&cards[0].id).unwrap().title(),
            Some("final")
        );
    }

    #[tokio::test]
    async fn test_card_under_unconfirmed_list_waits_for_list() {
        let h = harness().await;
        h.api.set_unreachable(true);
        let CommitOutcome::Queued(list_action) = h
            .store
            .apply_and_commit(Mutation::Create {
                kind: EntityKind::List,
                parent_id: None,
                fields: fields("Later"),
            })
            .await
            .unwrap()
        else {
            panic!("expected queued list");
        };
        let temp_list = list_action.target.id.clone().unwrap();

        // Reachable again, but the list has no server id yet.
        h.api.set_unreachable(false);
        let outcome = h
            .store
            .apply_and_commit(Mutation::Create {
                kind: EntityKind::Card,
                parent_id: Some(temp_list.clone()),
                fields: fields("Child"),
            })
            .await
            .unwrap();
        assert!(outcome.is_queued());
        assert!(!h.api.calls().iter().any(|c| c == "create cards"));

        h.store.drain().await.unwrap();
        let lists = h.store.lists();
        assert_eq!(lists.len(), 3);
        let list = &lists[2];
        assert!(!ids::is_temp_id(&list.id));
        let cards = h.store.cards_in(&list.id);
        assert_eq!(cards.len(), 1);
        assert!(!ids::is_temp_id(&cards[0].id));
        assert_eq!(
            h.api.record(&cards[0].id).unwrap().parent_id.as_deref(),
            Some(list.id.as_str())
        );
    }

    /// Wait until the optimistic placeholder for a create shows up in `list`.
    async fn placeholder_in(store: &BoardStore, list: &str) -> String {
        loop {
            if let Some(card) = store.cards_in(list).first() {
                return card.id.clone();
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_edit_during_create_queues_behind_it() {
        let h = harness().await;
        let store = &h.store;
        h.api.hold();
        let create = store.apply_and_commit(Mutation::Create {
            kind: EntityKind::Card,
            parent_id: Some("l2".into()),
            fields: fields("draft"),
        });
        let edit = async {
            let temp_id = placeholder_in(store, "l2").await;
            h.api.set_unreachable(true);
            h.api.release();
            store
                .apply_and_commit(Mutation::Update {
                    id: temp_id,
                    fields: fields("final"),
                })
                .await
        };
        let (created, edited) = tokio::join!(create, edit);
        assert!(created.unwrap().is_queued());
        assert!(edited.unwrap().is_queued());

        let kinds: Vec<ActionKind> = store
            .queue()
            .pending()
            .unwrap()
            .iter()
            .map(|a| a.kind)
            .collect();
        assert_eq!(kinds, vec![ActionKind::Create, ActionKind::Update]);

        h.api.set_unreachable(false);
        let report = store.drain().await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.lost, 0);

        let cards = store.cards_in("l2");
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].title(), Some("final"));
        assert_eq!(h.api.record(&cards[0].id).unwrap().title(), Some("final"));
    }

    #[tokio::test]
    async fn test_edit_during_create_is_sent_with_server_id() {
        let h = harness().await;
        let store = &h.store;
        h.api.hold();
        let create = store.apply_and_commit(Mutation::Create {
            kind: EntityKind::Card,
            parent_id: Some("l2".into()),
            fields: fields("draft"),
        });
        let edit = async {
            let temp_id = placeholder_in(store, "l2").await;
            h.api.release();
            store
                .apply_and_commit(Mutation::Update {
                    id: temp_id,
                    fields: fields("final"),
                })
                .await
        };
        let (created, edited) = tokio::join!(create, edit);
        let CommitOutcome::Confirmed(Some(server)) = created.unwrap() else {
            panic!("expected confirmed create");
        };
        assert!(matches!(edited.unwrap(), CommitOutcome::Confirmed(Some(_))));

        assert!(store.queue().is_empty().unwrap());
        assert!(h
            .api
            .calls()
            .contains(&format!("update cards/{}", server.id)));
        assert_eq!(store.entity(&server.id).unwrap().title(), Some("final"));
        assert_eq!(h.api.record(&server.id).unwrap().title(), Some("final"));
    }

    #[tokio::test]
    async fn test_edit_during_refused_create_is_rolled_back() {
        let h = harness().await;
        let store = &h.store;
        h.api.hold();
        h.api.script_err(ApiError::rejected(422, "title required"));
        let create = store.apply_and_commit(Mutation::Create {
            kind: EntityKind::Card,
            parent_id: Some("l2".into()),
            fields: fields("draft"),
        });
        let edit = async {
            let temp_id = placeholder_in(store, "l2").await;
            h.api.release();
            store
                .apply_and_commit(Mutation::Update {
                    id: temp_id,
                    fields: fields("final"),
                })
                .await
        };
        let (created, edited) = tokio::join!(create, edit);
        assert!(matches!(created, Err(SyncError::Rejected(_))));
        assert!(matches!(edited, Err(SyncError::Rejected(_))));

        assert!(store.cards_in("l2").is_empty());
        assert!(store.queue().is_empty().unwrap());
        assert!(!h.api.calls().iter().any(|c| c.starts_with("update")));
    }

    #[tokio::test]
    async fn test_move_into_refused_list_restores_card() {
        let h = harness().await;
        let store = &h.store;
        h.api.hold();
        h.api.script_err(ApiError::rejected(422, "too many lists"));
        let create = store.apply_and_commit(Mutation::Create {
            kind: EntityKind::List,
            parent_id: None,
            fields: fields("Doomed"),
        });
        let mv = async {
            let temp_list = loop {
                if let Some(list) = store.lists().into_iter().find(|l| ids::is_temp_id(&l.id)) {
                    break list.id;
                }
                tokio::task::yield_now().await;
            };
            h.api.release();
            store.move_entity("B", "l1", &temp_list, 0).await
        };
        let (created, moved) = tokio::join!(create, mv);
        assert!(created.is_err());
        assert!(matches!(moved, Err(SyncError::Rejected(_))));

        assert_eq!(store.lists().len(), 2);
        assert_eq!(titles(store, "l1"), vec!["A", "B", "C"]);
        assert_eq!(positions(store, "l1"), vec![0.0, 1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_confirmed_create_requests_replay_without_running_it() {
        let h = harness().await;
        let store = &h.store;
        h.api.set_unreachable(true);
        store
            .apply_and_commit(Mutation::Update {
                id: "A".into(),
                fields: fields("offline"),
            })
            .await
            .unwrap();
        h.api.set_unreachable(false);
        let calls_before = h.api.calls().len();

        h.api.hold();
        let create = store.apply_and_commit(Mutation::Create {
            kind: EntityKind::Card,
            parent_id: Some("l2".into()),
            fields: fields("New"),
        });
        let queue_behind = async {
            let temp_id = placeholder_in(store, "l2").await;
            store
                .queue()
                .enqueue(
                    ActionKind::Update,
                    Target::entity(EntityKind::Card, &temp_id),
                    json!({ "title": "Renamed" }),
                )
                .unwrap();
            h.api.release();
        };
        let (created, _) = tokio::join!(create, queue_behind);
        let CommitOutcome::Confirmed(Some(server)) = created.unwrap() else {
            panic!("expected confirmed create");
        };

        // Only the create went out; replay is left to the background task.
        assert_eq!(h.api.calls().len(), calls_before + 1);
        let pending = store.queue().pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].target.id.as_deref(), Some(server.id.as_str()));
        tokio::time::timeout(std::time::Duration::from_secs(1), store.drain_requested())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lost_create_reports_dependents_once() {
        let h = harness().await;
        h.api.set_unreachable(true);
        let CommitOutcome::Queued(action) = h
            .store
            .apply_and_commit(Mutation::Create {
                kind: EntityKind::Card,
                parent_id: Some("l2".into()),
                fields: fields("draft"),
            })
            .await
            .unwrap()
        else {
            panic!("expected queued create");
        };
        let temp_id = action.target.id.clone().unwrap();
        h.store
            .apply_and_commit(Mutation::Update {
                id: temp_id,
                fields: fields("final"),
            })
            .await
            .unwrap();

        h.api.set_unreachable(false);
        let mut events = h.store.subscribe();
        for _ in 0..3 {
            h.api.script_err(ApiError::rejected(422, "title required"));
        }
        let report = h.store.drain().await.unwrap();
        assert_eq!(report.lost, 1);
        assert_eq!(report.remaining, 0);
        assert!(!h
            .api
            .calls()
            .iter()
            .any(|c| c.starts_with("update cards/tmp-")));

        let mut lost = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let StoreEvent::WriteLost { discarded, .. } = event {
                lost.push(discarded);
            }
        }
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].len(), 1);
        assert_eq!(lost[0][0].kind, ActionKind::Update);
    }

    #[tokio::test]
    async fn test_lost_write_keeps_local_edit_and_notifies_once() {
        let h = harness().await;
        let mut events = h.store.subscribe();
        h.api.set_unreachable(true);
        h.store
            .apply_and_commit(Mutation::Update {
                id: "A".into(),
                fields: fields("unsynced"),
            })
            .await
            .unwrap();

        let report = h.store.drain().await.unwrap();
        assert_eq!(report.lost, 1);
        assert_eq!(h.store.entity("A").unwrap().title(), Some("unsynced"));

        let mut lost = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, StoreEvent::WriteLost { .. }) {
                lost += 1;
            }
        }
        assert_eq!(lost, 1);
    }

    #[tokio::test]
    async fn test_load_overlays_queued_writes() {
        let h = harness().await;
        h.api.set_unreachable(true);
        h.store
            .apply_and_commit(Mutation::Update {
                id: "B".into(),
                fields: fields("pending"),
            })
            .await
            .unwrap();

        // Reload from the offline cache, as after a restart.
        let source = h.store.load().await.unwrap();
        assert_eq!(source, LoadSource::Cache);
        assert_eq!(h.store.entity("B").unwrap().title(), Some("pending"));
    }

    #[tokio::test]
    async fn test_load_without_cache_while_unreachable() {
        let api = Arc::new(FakeApi::new());
        api.set_unreachable(true);
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = SyncConfig::default();
        let queue = Arc::new(MutationQueue::new(storage.clone(), config.clone()));
        let store = BoardStore::new("b1", api, queue, storage, &config);

        assert!(matches!(store.load().await, Err(SyncError::Unreachable(_))));
    }

    fn remote(event_type: EventType, kind: EntityKind, id: &str, payload: Value) -> RealtimeEvent {
        RealtimeEvent {
            event_type,
            entity_kind: kind,
            entity_id: id.into(),
            payload,
            origin: Some("someone-else".into()),
        }
    }

    #[tokio::test]
    async fn test_remote_update_is_idempotent() {
        let h = harness().await;
        let event = remote(
            EventType::Updated,
            EntityKind::Card,
            "A",
            json!({ "fields": { "title": "remote" } }),
        );

        h.store.apply_remote(&event);
        let once = h.store.state();
        h.store.apply_remote(&event);
        assert_eq!(h.store.state(), once);
        assert_eq!(h.store.entity("A").unwrap().title(), Some("remote"));
    }

    #[tokio::test]
    async fn test_remote_create_in_view_is_inserted() {
        let h = harness().await;
        h.store.apply_remote(&remote(
            EventType::Created,
            EntityKind::Card,
            "Z",
            json!({ "parentId": "l2", "position": 0.0, "fields": { "title": "Z" } }),
        ));
        assert_eq!(titles(&h.store, "l2"), vec!["Z"]);
    }

    #[tokio::test]
    async fn test_remote_event_outside_view_is_ignored() {
        let h = harness().await;
        let before = h.store.state();
        h.store.apply_remote(&remote(
            EventType::Created,
            EntityKind::Card,
            "elsewhere",
            json!({ "parentId": "other-list", "position": 0.0 }),
        ));
        h.store.apply_remote(&remote(
            EventType::Deleted,
            EntityKind::Card,
            "unknown",
            Value::Null,
        ));
        assert_eq!(h.store.state(), before);
    }

    #[tokio::test]
    async fn test_remote_delete_removes_list_and_cards() {
        let h = harness().await;
        h.store.apply_remote(&remote(
            EventType::Deleted,
            EntityKind::List,
            "l1",
            Value::Null,
        ));
        assert!(h.store.entity("l1").is_none());
        assert!(h.store.entity("A").is_none());
        assert_eq!(h.store.lists().len(), 1);
    }

    #[tokio::test]
    async fn test_own_echo_is_skipped() {
        let h = harness().await;
        let mut event = remote(
            EventType::Updated,
            EntityKind::Card,
            "A",
            json!({ "fields": { "title": "echo" } }),
        );
        event.origin = Some("me".into());
        h.store.apply_remote(&event);
        assert_eq!(h.store.entity("A").unwrap().title(), Some("A"));
    }

    #[tokio::test]
    async fn test_remote_move_without_siblings_keeps_positions_distinct() {
        let h = harness().await;
        h.store.apply_remote(&remote(
            EventType::Moved,
            EntityKind::Card,
            "C",
            json!({ "parentId": "l1", "position": 0.0 }),
        ));
        assert_eq!(titles(&h.store, "l1"), vec!["C", "A", "B"]);
        assert!(position::has_distinct_order(&positions(&h.store, "l1")));
    }

    #[tokio::test]
    async fn test_remote_move_with_sibling_ranks() {
        let h = harness().await;
        h.store.apply_remote(&remote(
            EventType::Moved,
            EntityKind::Card,
            "A",
            json!({
                "parentId": "l1",
                "position": 2.0,
                "siblings": [
                    { "id": "B", "position": 0.0 },
                    { "id": "C", "position": 1.0 },
                    { "id": "A", "position": 2.0 }
                ]
            }),
        ));
        assert_eq!(titles(&h.store, "l1"), vec!["B", "C", "A"]);
    }

    #[tokio::test]
    async fn test_confirmation_overrides_interim_remote_change() {
        let h = harness().await;
        let store = &h.store;
        h.api.hold();
        let commit = store.apply_and_commit(Mutation::Update {
            id: "A".into(),
            fields: fields("mine"),
        });
        let interfere = async {
            while !store.has_pending_write("A") {
                tokio::task::yield_now().await;
            }
            store.apply_remote(&remote(
                EventType::Updated,
                EntityKind::Card,
                "A",
                json!({ "fields": { "title": "theirs" } }),
            ));
            assert_eq!(store.entity("A").unwrap().title(), Some("theirs"));
            h.api.release();
        };
        let (result, _) = tokio::join!(commit, interfere);
        result.unwrap();
        assert_eq!(store.entity("A").unwrap().title(), Some("mine"));
    }
}
