/// Durable queue of writes that could not reach the server.
///
/// Actions are persisted as a JSON array under a single storage key and
/// replayed strictly in enqueue order. A failing action blocks the ones
/// behind it until it either succeeds or exhausts its attempts; exhausted
/// actions are dropped and surfaced as `QueueEvent::WriteLost`.
///
/// Retries wait a fixed delay between attempts, not an exponential one.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::api::{ApiError, BoardApi};
use crate::config::{SyncConfig, QUEUE_STORAGE_KEY};
use crate::storage::{self, KeyValueStore, StorageError};
use crate::types::{Entity, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAction {
    pub id: String,
    pub kind: ActionKind,
    pub target: Target,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl QueuedAction {
    /// Point every reference to `old_id` at `new_id`.
    fn rewrite_id(&mut self, old_id: &str, new_id: &str) -> bool {
        let mut changed = false;
        if self.target.id.as_deref() == Some(old_id) {
            self.target.id = Some(new_id.to_string());
            changed = true;
        }
        if self.target.parent_id.as_deref() == Some(old_id) {
            self.target.parent_id = Some(new_id.to_string());
            changed = true;
        }
        if let Some(parent) = self.payload.get_mut("parentId") {
            if parent.as_str() == Some(old_id) {
                *parent = Value::String(new_id.to_string());
                changed = true;
            }
        }
        changed
    }

    /// Whether the action targets `id` or places something under it.
    fn references(&self, id: &str) -> bool {
        self.target.id.as_deref() == Some(id)
            || self.target.parent_id.as_deref() == Some(id)
            || self.payload.get("parentId").and_then(Value::as_str) == Some(id)
    }
}

/// Notifications emitted by the queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued(QueuedAction),
    /// Delivered during a drain. `entity` is the authoritative record (None for deletes).
    Replayed {
        action: QueuedAction,
        entity: Option<Entity>,
    },
    RetryScheduled {
        action_id: String,
        attempts: u32,
        error: ApiError,
    },
    /// Dropped after `max_attempts` failures. The write never reached the server.
    /// A lost create takes the queued writes that depended on it along.
    WriteLost {
        action: QueuedAction,
        error: ApiError,
        discarded: Vec<QueuedAction>,
    },
}

/// What happened to one action during a drain, handed to the drain callback.
#[derive(Debug, Clone, Copy)]
pub enum Replay<'a> {
    /// Accepted by the server. The entity is None for deletes.
    Delivered(Option<&'a Entity>),
    /// Exhausted its attempts and was dropped, with the writes that depended on it.
    Lost {
        error: &'a ApiError,
        discarded: &'a [QueuedAction],
    },
}

/// Outcome of one `drain()` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Another drain was already running; this call did nothing.
    pub skipped: bool,
    /// Connectivity dropped mid-pass; remaining actions stay queued.
    pub interrupted: bool,
    pub delivered: usize,
    pub lost: usize,
    pub remaining: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Resets the single-flight flag when a drain finishes, however it finishes.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct MutationQueue {
    storage: Arc<dyn KeyValueStore>,
    key: String,
    config: SyncConfig,
    /// Serializes read-modify-write cycles on the persisted array.
    lock: Mutex<()>,
    draining: AtomicBool,
    online: Option<watch::Receiver<bool>>,
    event_tx: broadcast::Sender<QueueEvent>,
}

impl MutationQueue {
    pub fn new(storage: Arc<dyn KeyValueStore>, config: SyncConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            storage,
            key: QUEUE_STORAGE_KEY.to_string(),
            config,
            lock: Mutex::new(()),
            draining: AtomicBool::new(false),
            online: None,
            event_tx,
        }
    }

    /// Stop drain passes early when this signal reports offline.
    pub fn with_online_signal(mut self, online: watch::Receiver<bool>) -> Self {
        self.online = Some(online);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Snapshot of everything still waiting, in replay order.
    pub fn pending(&self) -> Result<Vec<QueuedAction>, QueueError> {
        let _guard = self.lock.lock().unwrap();
        Ok(self.load()?)
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.pending()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    /// Append an action to the durable queue. Never attempts delivery.
    pub fn enqueue(
        &self,
        kind: ActionKind,
        target: Target,
        payload: Value,
    ) -> Result<QueuedAction, QueueError> {
        let action = QueuedAction {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            target,
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
            max_attempts: self.config.max_attempts.max(1),
        };

        {
            let _guard = self.lock.lock().unwrap();
            let mut actions = self.load()?;
            actions.push(action.clone());
            self.save(&actions)?;
        }

        log::info!(
            "[corkboard.queue.enqueue] {:?} {} queued as {}",
            action.kind,
            action.target,
            action.id
        );
        let _ = self.event_tx.send(QueueEvent::Enqueued(action.clone()));
        Ok(action)
    }

    /// Point queued actions that reference `old_id` at `new_id`. Returns how many changed.
    pub fn rewrite_ids(&self, old_id: &str, new_id: &str) -> Result<usize, QueueError> {
        let _guard = self.lock.lock().unwrap();
        let mut actions = self.load()?;
        let changed = actions
            .iter_mut()
            .map(|a| a.rewrite_id(old_id, new_id))
            .filter(|changed| *changed)
            .count();
        if changed > 0 {
            self.save(&actions)?;
        }
        Ok(changed)
    }

    /// Drop queued actions addressed to or under `id` because its create
    /// will never reach the server. Creates dropped this way take their own
    /// dependents along.
    pub fn discard_referencing(&self, id: &str) -> Result<Vec<QueuedAction>, QueueError> {
        let _guard = self.lock.lock().unwrap();
        let mut kept = self.load()?;
        let mut gone = vec![id.to_string()];
        let mut discarded = Vec::new();
        loop {
            let (hit, rest): (Vec<_>, Vec<_>) = kept
                .into_iter()
                .partition(|a| gone.iter().any(|id| a.references(id)));
            kept = rest;
            if hit.is_empty() {
                break;
            }
            gone.extend(
                hit.iter()
                    .filter(|a| a.kind == ActionKind::Create)
                    .filter_map(|a| a.target.id.clone()),
            );
            discarded.extend(hit);
        }
        if !discarded.is_empty() {
            self.save(&kept)?;
            log::warn!(
                "[corkboard.queue.discard] Discarded {} queued actions for {}",
                discarded.len(),
                id
            );
        }
        Ok(discarded)
    }

    /// Replay every queued action in FIFO order.
    ///
    /// `on_replayed` sees every delivered or dropped action before the next
    /// action is attempted. A call made while another drain is running
    /// returns immediately with `skipped` set.
    pub async fn drain<F>(
        &self,
        api: &dyn BoardApi,
        mut on_replayed: F,
    ) -> Result<DrainReport, QueueError>
    where
        F: FnMut(&QueuedAction, Replay<'_>) + Send,
    {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("[corkboard.queue.drain] Drain already in progress, skipping");
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        }
        let _flight = DrainGuard(&self.draining);

        let mut report = DrainReport::default();
        loop {
            if !self.is_online() {
                report.interrupted = true;
                log::info!("[corkboard.queue.drain] Offline, pausing replay");
                break;
            }

            let head = {
                let _guard = self.lock.lock().unwrap();
                self.load()?.into_iter().next()
            };
            let Some(action) = head else {
                break;
            };

            match execute(api, &action).await {
                Ok(entity) => {
                    self.complete(&action, entity.as_ref())?;
                    report.delivered += 1;
                    log::info!(
                        "[corkboard.queue.drain] Replayed {:?} {} ({})",
                        action.kind,
                        action.target,
                        action.id
                    );
                    on_replayed(&action, Replay::Delivered(entity.as_ref()));
                    let _ = self.event_tx.send(QueueEvent::Replayed { action, entity });
                }
                Err(error) => {
                    let attempts = self.record_failure(&action)?;
                    if attempts >= action.max_attempts {
                        report.lost += 1;
                        log::error!(
                            "[corkboard.queue.drain] Dropping {:?} {} after {} attempts: {}",
                            action.kind,
                            action.target,
                            attempts,
                            error
                        );
                        let mut lost = action;
                        lost.attempts = attempts;
                        let discarded = match (lost.kind, lost.target.id.as_deref()) {
                            (ActionKind::Create, Some(temp_id)) => {
                                self.discard_referencing(temp_id)?
                            }
                            _ => Vec::new(),
                        };
                        on_replayed(
                            &lost,
                            Replay::Lost {
                                error: &error,
                                discarded: &discarded,
                            },
                        );
                        let _ = self.event_tx.send(QueueEvent::WriteLost {
                            action: lost,
                            error,
                            discarded,
                        });
                    } else {
                        log::warn!(
                            "[corkboard.queue.drain] Attempt {}/{} for {} failed: {}",
                            attempts,
                            action.max_attempts,
                            action.target,
                            error
                        );
                        let _ = self.event_tx.send(QueueEvent::RetryScheduled {
                            action_id: action.id.clone(),
                            attempts,
                            error,
                        });
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }

        report.remaining = self.len()?;
        Ok(report)
    }

    fn is_online(&self) -> bool {
        self.online.as_ref().map_or(true, |rx| *rx.borrow())
    }

    /// Remove a delivered action and resolve temporary ids in the ones behind it.
    fn complete(&self, action: &QueuedAction, entity: Option<&Entity>) -> Result<(), QueueError> {
        let _guard = self.lock.lock().unwrap();
        let mut actions = self.load()?;
        actions.retain(|a| a.id != action.id);

        if let (Some(temp_id), Some(entity)) = (action.target.id.as_deref(), entity) {
            if action.kind == ActionKind::Create && temp_id != entity.id {
                let rewritten = actions
                    .iter_mut()
                    .map(|a| a.rewrite_id(temp_id, &entity.id))
                    .filter(|changed| *changed)
                    .count();
                if rewritten > 0 {
                    log::debug!(
                        "[corkboard.queue.ids] Resolved {} -> {} in {} queued actions",
                        temp_id,
                        entity.id,
                        rewritten
                    );
                }
            }
        }

        self.save(&actions)?;
        Ok(())
    }

    /// Count a failed attempt. Exhausted actions are removed. Returns the new count.
    fn record_failure(&self, action: &QueuedAction) -> Result<u32, QueueError> {
        let _guard = self.lock.lock().unwrap();
        let mut actions = self.load()?;
        let mut attempts = action.attempts + 1;
        if let Some(idx) = actions.iter().position(|a| a.id == action.id) {
            attempts = actions[idx].attempts + 1;
            if attempts >= actions[idx].max_attempts {
                actions.remove(idx);
            } else {
                actions[idx].attempts = attempts;
            }
        }
        self.save(&actions)?;
        Ok(attempts)
    }

    /// Read the persisted array. Unreadable data is set aside and the queue starts empty.
    fn load(&self) -> Result<Vec<QueuedAction>, StorageError> {
        match storage::load_json::<Vec<QueuedAction>>(self.storage.as_ref(), &self.key) {
            Ok(actions) => Ok(actions.unwrap_or_default()),
            Err(StorageError::Corrupt { reason, .. }) => {
                let aside = format!("{}.corrupt-{}", self.key, Utc::now().timestamp());
                log::warn!(
                    "[corkboard.queue.load] Persisted queue unreadable ({}), moved to {}",
                    reason,
                    aside
                );
                self.storage.rename(&self.key, &aside)?;
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    fn save(&self, actions: &[QueuedAction]) -> Result<(), StorageError> {
        storage::save_json(self.storage.as_ref(), &self.key, &actions)
    }
}

/// Issue the remote write a queued action describes.
async fn execute(api: &dyn BoardApi, action: &QueuedAction) -> Result<Option<Entity>, ApiError> {
    let target = &action.target;
    match action.kind {
        ActionKind::Create => api
            .create(target.kind, target.parent_id.as_deref(), &action.payload)
            .await
            .map(Some),
        ActionKind::Update => {
            let id = target
                .id
                .as_deref()
                .ok_or_else(|| ApiError::rejected(400, format!("{} has no id", target)))?;
            api.update(target.kind, id, &action.payload).await.map(Some)
        }
        ActionKind::Delete => {
            let id = target
                .id
                .as_deref()
                .ok_or_else(|| ApiError::rejected(400, format!("{} has no id", target)))?;
            api.delete(target.kind, id).await.map(|_| None)
        }
    }
}
