/// Engine configuration shared by every client embedding the sync core.
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Storage key the mutation queue is persisted under.
pub const QUEUE_STORAGE_KEY: &str = "pending-mutations";

/// Storage key prefix for the offline board cache (`board-cache/<board_id>`).
pub const BOARD_CACHE_PREFIX: &str = "board-cache";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Attempts a queued action gets before it is dropped as a lost write.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed pause between retries of the same queued action.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// How often the connectivity probe pings the API.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Capacity of the store's notification broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_probe_interval_ms() -> u64 {
    15_000
}

fn default_event_buffer() -> usize {
    256
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl SyncConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

pub fn board_cache_key(board_id: &str) -> String {
    format!("{}/{}", BOARD_CACHE_PREFIX, board_id)
}
