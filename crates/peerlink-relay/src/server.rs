//! WebSocket endpoint for the signaling channel

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace};

use crate::hub::SignalingHub;
use crate::protocol::PeerId;

/// Signaling relay state
#[derive(Clone)]
pub struct RelayState {
    pub hub: Arc<SignalingHub>,
}

/// Connection query parameters. The peer id is read here and only here.
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "peerID")]
    pub peer_id: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<RelayState>,
) -> Response {
    let peer_id = query.peer_id.filter(|p| !p.is_empty()).map(PeerId::new);
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer_id))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: RelayState, peer_id: Option<PeerId>) {
    let (mut sender, mut receiver) = socket.split();
    let (conn, mut rx) = state.hub.connect(peer_id);
    let ping_interval = state.hub.config().ping_interval.max(Duration::from_millis(1));
    let idle_timeout = state.hub.config().idle_timeout();

    // Spawn task to forward replies and pushes to the client, pinging it
    // while there is nothing to send
    let send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let text = match serde_json::to_string(&msg) {
                        Ok(text) => text,
                        Err(e) => {
                            debug!("Failed to encode frame: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    info!(
        "New signaling connection {} ({})",
        conn.id,
        conn.peer_id.as_ref().map(|p| p.as_str()).unwrap_or("anonymous")
    );

    loop {
        // Any frame, pongs included, proves the peer is alive
        let result = match timeout(idle_timeout, receiver.next()).await {
            Ok(Some(result)) => result,
            Ok(None) => break,
            Err(_) => {
                info!("Signaling connection {} timed out", conn.id);
                break;
            }
        };
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error: {}", e);
                break;
            }
        };

        trace!("Received: {}", text.as_str());

        let reply = state.hub.handle_text(&conn, text.as_str()).await;
        if !conn.send(reply).await {
            break;
        }
    }

    let left = state.hub.disconnect(&conn).await;
    info!("Signaling connection {} closed (left {} networks)", conn.id, left.len());
    send_task.abort();
}
