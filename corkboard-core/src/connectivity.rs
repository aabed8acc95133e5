/// Online/offline tracking and reconnect-triggered queue replay.
///
/// The online flag lives in a `watch` channel so the mutation queue can
/// check it between replayed actions and stop as soon as the link drops.
/// Whatever sets the flag (a probe, the realtime socket, the host OS) only
/// calls `set_online`; draining happens in the task started by `spawn`, which
/// also serves `BoardStore::request_drain`.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::BoardApi;
use crate::store::BoardStore;

#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Receiver to hand to `MutationQueue::with_online_signal`.
    pub fn signal(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record the current connectivity. Returns true on a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            log::info!(
                "[corkboard.connectivity] {}",
                if online { "Back online" } else { "Went offline" }
            );
        }
        changed
    }

    /// Drain the store's queue now if online, again on every reconnect, and
    /// whenever the store requests it while online.
    pub fn spawn(&self, store: Arc<BoardStore>) -> JoinHandle<()> {
        tokio::spawn(run(store, self.signal()))
    }

    /// Ping the API every `interval` and derive the online flag from the result.
    /// Only `Unreachable` counts as offline; a rejected ping still proves a link.
    pub fn spawn_probe(&self, api: Arc<dyn BoardApi>, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = match api.ping().await {
                    Ok(()) => true,
                    Err(e) => {
                        if e.is_unreachable() {
                            log::debug!("[corkboard.connectivity.probe] {}", e);
                        }
                        !e.is_unreachable()
                    }
                };
                monitor.set_online(online);
            }
        })
    }
}

/// Replay loop behind [`ConnectivityMonitor::spawn`]. Ends when the monitor is dropped.
pub async fn run(store: Arc<BoardStore>, mut online: watch::Receiver<bool>) {
    let mut was_online = false;
    loop {
        let now_online = *online.borrow_and_update();
        if now_online && !was_online {
            replay(&store).await;
        }
        was_online = now_online;
        tokio::select! {
            changed = online.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = store.drain_requested() => {
                if *online.borrow() {
                    replay(&store).await;
                }
            }
        }
    }
}

async fn replay(store: &BoardStore) {
    match store.drain().await {
        Ok(report) if report.delivered + report.lost > 0 => log::info!(
            "[corkboard.connectivity.replay] Replayed {} queued writes for {} ({} lost)",
            report.delivered,
            store.board_id(),
            report.lost
        ),
        Ok(_) => {}
        Err(e) => log::error!("[corkboard.connectivity.replay] Drain failed: {}", e),
    }
}
