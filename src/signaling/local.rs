//! In-process signaling over a shared [`SignalingHub`]
//!
//! Goes through the same request dispatch as the WebSocket endpoint, without
//! a socket. Used by tests and by embedders running relay and sessions in one
//! process.

use async_trait::async_trait;
use peerlink_relay::{
    ClientRequest, ConnectionHandle, ErrorCode, NetworkId, PeerId, PeerRecord, ServerMessage,
    SignalMessage, SignalingHub,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::api::SignalingApi;
use super::error::{Result, SignalingError};
use super::listeners::RelayListeners;

pub struct LocalSignaling {
    hub: Arc<SignalingHub>,
    conn: ConnectionHandle,
    peer_id: PeerId,
    next_id: AtomicU64,
    listeners: RelayListeners,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl LocalSignaling {
    /// Open an in-process connection identified as `peer_id`
    pub fn connect(hub: Arc<SignalingHub>, peer_id: PeerId) -> Self {
        let (conn, mut rx) = hub.connect(Some(peer_id.clone()));
        let listeners = RelayListeners::new();

        let pump_listeners = listeners.clone();
        let pump = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    ServerMessage::Relayed { message } => {
                        pump_listeners.dispatch(message);
                    }
                    other => trace!("Ignoring pushed frame: {:?}", other),
                }
            }
        });

        Self {
            hub,
            conn,
            peer_id,
            next_id: AtomicU64::new(1),
            listeners,
            closed: AtomicBool::new(false),
            pump: Mutex::new(Some(pump)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drop the connection as a transport disconnect would
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let left = self.hub.disconnect(&self.conn).await;
        debug!("{} disconnected, left {} networks", self.peer_id.short(), left.len());
        let pump = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pump) = pump {
            pump.abort();
        }
    }

    async fn request(&self, build: impl FnOnce(u64) -> ClientRequest) -> Result<ServerMessage> {
        if self.is_closed() {
            return Err(SignalingError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.hub.handle(&self.conn, build(id)).await {
            ServerMessage::Error {
                code: ErrorCode::InvalidRequest,
                message,
                ..
            } => Err(SignalingError::InvalidRequest(message)),
            ServerMessage::Error { code, message, .. } => Err(SignalingError::Server { code, message }),
            reply => Ok(reply),
        }
    }
}

impl Drop for LocalSignaling {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
    }
}

#[async_trait]
impl SignalingApi for LocalSignaling {
    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    async fn join(&self, network_id: &NetworkId) -> Result<u64> {
        match self.request(|id| ClientRequest::join(id, network_id)).await? {
            ServerMessage::Joined { index, .. } => Ok(index),
            _ => Err(SignalingError::UnexpectedReply("join")),
        }
    }

    async fn relay(
        &self,
        network_id: &NetworkId,
        target: &PeerId,
        message: serde_json::Value,
    ) -> Result<SignalMessage> {
        match self
            .request(|id| ClientRequest::relay(id, network_id, target, message))
            .await?
        {
            ServerMessage::Ack { message, .. } => Ok(message),
            _ => Err(SignalingError::UnexpectedReply("relay")),
        }
    }

    async fn list(&self, network_id: &NetworkId) -> Result<Vec<PeerRecord>> {
        match self.request(|id| ClientRequest::list(id, network_id)).await? {
            ServerMessage::Peers { peers, .. } => Ok(peers),
            _ => Err(SignalingError::UnexpectedReply("list")),
        }
    }

    fn listeners(&self) -> &RelayListeners {
        &self.listeners
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_local_join_relay_list() {
        let hub = Arc::new(SignalingHub::default());
        let net = NetworkId::from("net1");
        let a = LocalSignaling::connect(hub.clone(), PeerId::from("a"));
        let b = LocalSignaling::connect(hub.clone(), PeerId::from("b"));
        let mut b_sub = b.listeners().subscribe();

        assert_eq!(a.join(&net).await.unwrap(), 0);
        assert_eq!(b.join(&net).await.unwrap(), 1);

        let ack = a.relay(&net, &PeerId::from("b"), json!({"type": "offer"})).await.unwrap();
        assert_eq!(ack.from_peer_id, PeerId::from("a"));

        let relayed = tokio::time::timeout(Duration::from_secs(1), b_sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relayed.message, ack);

        let peers = a.list(&net).await.unwrap();
        assert_eq!(peers.len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_and_closes() {
        let hub = Arc::new(SignalingHub::default());
        let net = NetworkId::from("net1");
        let a = LocalSignaling::connect(hub.clone(), PeerId::from("a"));
        a.join(&net).await.unwrap();

        a.disconnect().await;
        a.disconnect().await;
        assert!(a.is_closed());
        assert!(hub.registry().list(&net).await.is_empty());
        assert!(matches!(a.list(&net).await, Err(SignalingError::Closed)));
    }
}
