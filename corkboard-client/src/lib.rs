/// Corkboard client: HTTP and WebSocket adapters for the sync engine, config
/// loading, and the headless `corkboard-sync` entry point.
pub mod cli;
pub mod config;
pub mod http_api;
pub mod logging;
pub mod session;
pub mod ws_channel;

pub use config::ClientConfig;
pub use http_api::HttpBoardApi;
pub use session::Session;
pub use ws_channel::WsRealtimeChannel;
