/// WebSocket realtime channel.
///
/// One socket per subscribed board at `{ws-base}/realtime/{board_id}?client={client_id}`.
/// Text frames carry JSON `RealtimeEvent`s in both directions. When the socket
/// drops, the connection task waits `reconnect_delay` and dials again until the
/// subscriber goes away. Events emitted while disconnected are dropped.
use std::time::Duration;

use corkboard_core::realtime::{ChannelError, RealtimeChannel, RealtimeEvent};
use futures_util::{SinkExt, StreamExt};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

const OUTBOUND_BUFFER: usize = 256;

pub struct WsRealtimeChannel {
    ws_base: String,
    client_id: String,
    reconnect_delay: Duration,
    outbound: broadcast::Sender<RealtimeEvent>,
}

impl WsRealtimeChannel {
    /// `server_url` may be http(s) or ws(s); http schemes are mapped to ws.
    pub fn new(server_url: &str, client_id: impl Into<String>, reconnect_delay: Duration) -> Self {
        let (outbound, _) = broadcast::channel(OUTBOUND_BUFFER);
        Self {
            ws_base: ws_base(server_url),
            client_id: client_id.into(),
            reconnect_delay,
            outbound,
        }
    }

    pub fn board_url(&self, board_id: &str) -> String {
        format!(
            "{}/realtime/{}?client={}",
            self.ws_base,
            utf8_percent_encode(board_id, NON_ALPHANUMERIC),
            utf8_percent_encode(&self.client_id, NON_ALPHANUMERIC)
        )
    }
}

fn ws_base(server_url: &str) -> String {
    server_url
        .trim_end_matches('/')
        .replace("http://", "ws://")
        .replace("https://", "wss://")
}

impl RealtimeChannel for WsRealtimeChannel {
    fn subscribe(&self, board_id: &str) -> mpsc::UnboundedReceiver<RealtimeEvent> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let url = self.board_url(board_id);
        let outbound = self.outbound.subscribe();
        tokio::spawn(run_connection(
            url,
            inbound_tx,
            outbound,
            self.reconnect_delay,
        ));
        inbound_rx
    }

    fn emit(&self, event: RealtimeEvent) -> Result<(), ChannelError> {
        self.outbound
            .send(event)
            .map(|_| ())
            .map_err(|_| ChannelError::Closed)
    }
}

/// Dial, pump, and redial until the subscriber drops its receiver.
async fn run_connection(
    url: String,
    inbound: mpsc::UnboundedSender<RealtimeEvent>,
    mut outbound: broadcast::Receiver<RealtimeEvent>,
    reconnect_delay: Duration,
) {
    loop {
        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => {
                log::info!("[corkboard.ws] Connected to {}", url);
                if let Err(e) = pump(ws_stream, &inbound, &mut outbound).await {
                    log::warn!("[corkboard.ws] Connection to {} failed: {}", url, e);
                }
            }
            Err(e) => log::warn!("[corkboard.ws] WS connect to {} failed: {}", url, e),
        }

        if inbound.is_closed() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = inbound.closed() => break,
        }
        log::info!("[corkboard.ws] Reconnecting to {}", url);
    }
    log::info!("[corkboard.ws] Subscription to {} closed", url);
}

async fn pump<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    inbound: &mpsc::UnboundedSender<RealtimeEvent>,
    outbound: &mut broadcast::Receiver<RealtimeEvent>,
) -> Result<(), String>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let Some(msg) = msg else {
                    return Ok(());
                };
                let msg = msg.map_err(|e| format!("WS read error: {}", e))?;
                match msg {
                    Message::Text(t) => {
                        let text = t.to_string();
                        match serde_json::from_str::<RealtimeEvent>(&text) {
                            Ok(event) => {
                                if inbound.send(event).is_err() {
                                    return Ok(());
                                }
                            }
                            Err(e) => log::warn!("[corkboard.ws] Ignoring unparseable event: {}", e),
                        }
                    }
                    Message::Ping(data) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Message::Close(_) => {
                        log::info!("[corkboard.ws] Server closed the connection");
                        return Ok(());
                    }
                    _ => {}
                }
            }
            event = outbound.recv() => match event {
                Ok(event) => {
                    let text = serde_json::to_string(&event)
                        .map_err(|e| format!("Encode event: {}", e))?;
                    ws_tx
                        .send(Message::Text(text.into()))
                        .await
                        .map_err(|e| format!("WS send error: {}", e))?;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("[corkboard.ws] Dropped {} outbound events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            _ = inbound.closed() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}
