//! Client-side optimistic mutation and offline reconciliation engine for
//! project boards (boards, lists, cards).
pub mod api;
pub mod config;
pub mod connectivity;
pub mod ids;
pub mod position;
pub mod queue;
pub mod realtime;
pub mod storage;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use api::{ApiError, BoardApi};
pub use config::SyncConfig;
pub use connectivity::ConnectivityMonitor;
pub use queue::{MutationQueue, QueuedAction};
pub use realtime::{RealtimeChannel, RealtimeEvent, RealtimeListener};
pub use store::{BoardStore, CommitOutcome, StoreEvent, SyncError};
pub use types::{BoardState, Entity, EntityKind, Mutation};
