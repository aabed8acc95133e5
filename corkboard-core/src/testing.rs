/// Scripted collaborators for unit tests.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::api::{ApiError, BoardApi};
use crate::realtime::{ChannelError, RealtimeChannel, RealtimeEvent};
use crate::types::{Entity, EntityKind};

/// In-memory authoritative store with scripted failures.
///
/// Each call first consumes the next scripted outcome (`None` = behave
/// normally); with the script empty, `set_unreachable(true)` fails everything.
/// `hold()` parks every call until `release()`.
pub struct FakeApi {
    records: Mutex<HashMap<String, Entity>>,
    script: Mutex<VecDeque<Option<ApiError>>>,
    calls: Mutex<Vec<String>>,
    unreachable: AtomicBool,
    next_id: AtomicU64,
    held: watch::Sender<bool>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            held: watch::channel(false).0,
        }
    }

    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    pub fn seed(&self, entity: Entity) {
        self.records
            .lock()
            .unwrap()
            .insert(entity.id.clone(), entity);
    }

    pub fn record(&self, id: &str) -> Option<Entity> {
        self.records.lock().unwrap().get(id).cloned()
    }

    pub fn script_ok(&self) {
        self.script.lock().unwrap().push_back(None);
    }

    pub fn script_err(&self, error: ApiError) {
        self.script.lock().unwrap().push_back(Some(error));
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn begin(&self, call: String) -> Result<(), ApiError> {
        // Give concurrent callers a chance to interleave, like a real round trip.
        tokio::task::yield_now().await;
        let mut held = self.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;
        self.calls.lock().unwrap().push(call);
        if let Some(scripted) = self.script.lock().unwrap().pop_front() {
            return match scripted {
                Some(error) => Err(error),
                None => Ok(()),
            };
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ApiError::Unreachable("connection refused".into()));
        }
        Ok(())
    }

    fn apply_payload(entity: &mut Entity, payload: &Value) {
        if let Some(obj) = payload.as_object() {
            for (key, value) in obj {
                match key.as_str() {
                    "parentId" => entity.parent_id = value.as_str().map(str::to_string),
                    "position" => entity.position = value.as_f64().unwrap_or(entity.position),
                    _ => {
                        entity.fields.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        entity.updated_at = Some(Utc::now());
    }
}

#[async_trait]
impl BoardApi for FakeApi {
    async fn list(&self, kind: EntityKind, parent_id: &str) -> Result<Vec<Entity>, ApiError> {
        self.begin(format!("list {}/{}", parent_id, kind.collection()))
            .await?;
        let mut items: Vec<Entity> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.kind == kind && e.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.position.total_cmp(&b.position));
        Ok(items)
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Entity, ApiError> {
        self.begin(format!("get {}/{}", kind.collection(), id)).await?;
        self.record(id)
            .filter(|e| e.kind == kind)
            .ok_or_else(|| ApiError::rejected(404, format!("{} {} not found", kind, id)))
    }

    async fn create(
        &self,
        kind: EntityKind,
        parent_id: Option<&str>,
        payload: &Value,
    ) -> Result<Entity, ApiError> {
        self.begin(format!("create {}", kind.collection())).await?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut entity = Entity::new(kind, format!("srv-{}", n), parent_id.map(str::to_string));
        Self::apply_payload(&mut entity, payload);
        self.seed(entity.clone());
        Ok(entity)
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Value,
    ) -> Result<Entity, ApiError> {
        self.begin(format!("update {}/{}", kind.collection(), id))
            .await?;
        let mut records = self.records.lock().unwrap();
        let entity = records
            .get_mut(id)
            .ok_or_else(|| ApiError::rejected(404, format!("{} {} not found", kind, id)))?;
        Self::apply_payload(entity, payload);
        Ok(entity.clone())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), ApiError> {
        self.begin(format!("delete {}/{}", kind.collection(), id))
            .await?;
        self.records.lock().unwrap().remove(id);
        Ok(())
    }

    async fn ping(&self) -> Result<(), ApiError> {
        self.begin("ping".to_string()).await
    }
}

/// Channel that records emitted events and lets tests inject inbound ones.
#[derive(Default)]
pub struct FakeChannel {
    emitted: Mutex<Vec<RealtimeEvent>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RealtimeEvent>>>,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted(&self) -> Vec<RealtimeEvent> {
        self.emitted.lock().unwrap().clone()
    }

    pub fn push(&self, event: RealtimeEvent) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl RealtimeChannel for FakeChannel {
    fn subscribe(&self, _board_id: &str) -> mpsc::UnboundedReceiver<RealtimeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    fn emit(&self, event: RealtimeEvent) -> Result<(), ChannelError> {
        self.emitted.lock().unwrap().push(event);
        Ok(())
    }
}
