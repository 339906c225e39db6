//! Private per-peer channels
//!
//! Every joined connection is subscribed to the channel named after its peer
//! id. Relayed messages are published to the target's channel and reach every
//! connection subscribed there.

use std::collections::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::protocol::{ConnectionId, PeerId, ServerMessage};

/// Outbound side of one accepted connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    /// Peer id taken from the connection query, never from a payload
    pub peer_id: Option<PeerId>,
    tx: mpsc::Sender<ServerMessage>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, peer_id: Option<PeerId>, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self { id, peer_id, tx }
    }

    /// Queue a frame without waiting; returns false if it was dropped
    pub fn push(&self, msg: ServerMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Outbound queue full for {}, dropping frame", self.id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Connection {} already closed", self.id);
                false
            }
        }
    }

    /// Queue a frame, waiting for room
    pub async fn send(&self, msg: ServerMessage) -> bool {
        self.tx.send(msg).await.is_ok()
    }
}

#[derive(Default)]
pub struct PeerChannels {
    subscribers: RwLock<HashMap<PeerId, Vec<ConnectionHandle>>>,
}

impl PeerChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to a peer's channel. Returns false if it already was.
    pub async fn subscribe(&self, peer_id: &PeerId, conn: &ConnectionHandle) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let entry = subscribers.entry(peer_id.clone()).or_default();
        if entry.iter().any(|c| c.id == conn.id) {
            return false;
        }
        entry.push(conn.clone());
        true
    }

    /// Remove a connection from a peer's channel. Returns false if it wasn't subscribed.
    pub async fn unsubscribe(&self, peer_id: &PeerId, conn: ConnectionId) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let Some(entry) = subscribers.get_mut(peer_id) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|c| c.id != conn);
        let removed = entry.len() != before;
        if entry.is_empty() {
            subscribers.remove(peer_id);
        }
        removed
    }

    /// Hand a frame to every connection on a peer's channel.
    /// Returns how many connections accepted it.
    pub async fn publish(&self, peer_id: &PeerId, msg: ServerMessage) -> usize {
        let subscribers = self.subscribers.read().await;
        let Some(conns) = subscribers.get(peer_id) else {
            return 0;
        };
        conns.iter().filter(|c| c.push(msg.clone())).count()
    }
}
