/// One board opened against a server: file-backed storage, HTTP api,
/// realtime socket, connectivity monitor and the store wired together.
use std::sync::Arc;

use corkboard_core::connectivity::ConnectivityMonitor;
use corkboard_core::queue::MutationQueue;
use corkboard_core::realtime::RealtimeListener;
use corkboard_core::storage::local::FileStore;
use corkboard_core::storage::{KeyValueStore, StorageError};
use corkboard_core::store::{BoardStore, LoadSource, SyncError};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::http_api::HttpBoardApi;
use crate::ws_channel::WsRealtimeChannel;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("HTTP client setup failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub struct Session {
    store: Arc<BoardStore>,
    monitor: ConnectivityMonitor,
    api: Arc<HttpBoardApi>,
    channel: Arc<WsRealtimeChannel>,
    config: ClientConfig,
    listener: Option<RealtimeListener>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Wire everything up. Does not touch the network.
    pub fn open(config: ClientConfig, board_id: &str) -> Result<Self, SessionError> {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let storage: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(config.data_dir())?);

        let monitor = ConnectivityMonitor::new(true);
        let queue = Arc::new(
            MutationQueue::new(storage.clone(), config.sync.clone())
                .with_online_signal(monitor.signal()),
        );
        let api = Arc::new(HttpBoardApi::new(
            &config.server_url,
            config.request_timeout(),
        )?);
        let channel = Arc::new(WsRealtimeChannel::new(
            &config.server_url,
            client_id.clone(),
            config.reconnect_delay(),
        ));
        let store = Arc::new(
            BoardStore::new(board_id, api.clone(), queue, storage, &config.sync)
                .with_channel(channel.clone())
                .with_client_id(client_id),
        );

        log::info!(
            "[corkboard.session] Opened board {} against {} (data in {})",
            board_id,
            config.server_url,
            config.data_dir().display()
        );
        Ok(Self {
            store,
            monitor,
            api,
            channel,
            config,
            listener: None,
            tasks: Vec::new(),
        })
    }

    pub fn store(&self) -> &Arc<BoardStore> {
        &self.store
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    /// Load the board, falling back to the cache. Seeds the online flag.
    pub async fn load(&self) -> Result<LoadSource, SessionError> {
        let source = self.store.load().await?;
        self.monitor.set_online(source == LoadSource::Remote);
        Ok(source)
    }

    /// Start the realtime listener, reconnect replay and the reachability probe.
    pub fn start(&mut self) {
        if self.listener.is_some() {
            return;
        }
        self.listener = Some(RealtimeListener::spawn(
            self.store.clone(),
            self.channel.as_ref(),
        ));
        self.tasks.push(self.monitor.spawn(self.store.clone()));
        self.tasks.push(
            self.monitor
                .spawn_probe(self.api.clone(), self.config.sync.probe_interval()),
        );
    }

    /// Stop background work and write the offline cache.
    pub fn shutdown(mut self) -> Result<(), SessionError> {
        if let Some(listener) = self.listener.take() {
            listener.stop();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.store.save_cache()?;
        log::info!(
            "[corkboard.session] Closed board {}",
            self.store.board_id()
        );
        Ok(())
    }
}
