//! WebSocket client for the signaling relay

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use peerlink_relay::{
    ClientRequest, ErrorCode, NetworkId, PeerId, PeerRecord, ServerMessage, SignalMessage,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::api::SignalingApi;
use super::error::{Result, SignalingError};
use super::listeners::RelayListeners;

/// Default time to wait for a reply to a request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<ServerMessage>>>>;
type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<ServerMessage>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Append the peer id to the server URL as the `peerID` query parameter
pub fn connection_url(server_url: &str, peer_id: &PeerId) -> Result<Url> {
    let mut url = Url::parse(server_url)?;
    url.query_pairs_mut().append_pair("peerID", peer_id.as_str());
    Ok(url)
}

pub struct WsSignalingClient {
    peer_id: PeerId,
    outbound: mpsc::Sender<String>,
    pending: Pending,
    next_id: AtomicU64,
    listeners: RelayListeners,
    request_timeout: Duration,
    closed: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsSignalingClient {
    /// Open a signaling connection identified as `peer_id`
    pub async fn connect(server_url: &str, peer_id: PeerId, request_timeout: Duration) -> Result<Self> {
        let url = connection_url(server_url, &peer_id)?;
        info!("Connecting to signaling server: {}", server_url);

        let (ws, _) = connect_async(url.as_str()).await?;

        let (outbound, outbound_rx) = mpsc::channel(100);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let listeners = RelayListeners::new();
        let closed = Arc::new(AtomicBool::new(false));

        let io_task = tokio::spawn(run_io(
            ws,
            outbound_rx,
            pending.clone(),
            listeners.clone(),
            closed.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            peer_id,
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            listeners,
            request_timeout,
            closed,
            shutdown,
            io_task: Mutex::new(Some(io_task)),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the connection. The server treats this as a disconnect.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let task = self
            .io_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn request(&self, build: impl FnOnce(u64) -> ClientRequest) -> Result<ServerMessage> {
        if self.is_closed() {
            return Err(SignalingError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = build(id);
        let text = serde_json::to_string(&request)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending).insert(id, reply_tx);

        if self.is_closed() || self.outbound.send(text).await.is_err() {
            lock(&self.pending).remove(&id);
            return Err(SignalingError::Closed);
        }

        let reply = match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(SignalingError::Closed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                return Err(SignalingError::Timeout);
            }
        };

        match reply {
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

#[async_trait]
impl SignalingApi for WsSignalingClient {
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

/// Own the socket: write queued requests, route replies and pushes
async fn run_io(
    ws: WsStream,
    mut outbound_rx: mpsc::Receiver<String>,
    pending: Pending,
    listeners: RelayListeners,
    closed: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            Some(text) = outbound_rx.recv() => {
                trace!("Sending: {}", text);
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    warn!("Signaling write failed: {}", e);
                    break;
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => route_frame(text.as_str(), &pending, &listeners),
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Signaling connection closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Signaling connection error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Refuse new requests before failing the in-flight ones, so a request
    // registered after the clear still sees `Closed` from its send
    outbound_rx.close();
    drop(outbound_rx);
    lock(&pending).clear();
}

fn route_frame(text: &str, pending: &Pending, listeners: &RelayListeners) {
    let msg: ServerMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Ignoring malformed frame from server: {}", e);
            return;
        }
    };

    match msg {
        ServerMessage::Relayed { message } => {
            let handlers = listeners.dispatch(message);
            trace!("Dispatched relayed message to {} handlers", handlers);
        }
        reply => {
            let Some(id) = reply.request_id() else {
                debug!("Server notice: {:?}", reply);
                return;
            };
            match lock(pending).remove(&id) {
                Some(tx) => {
                    let _ = tx.send(reply);
                }
                None => debug!("Reply for unknown or expired request {}", id),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_url_carries_peer_id() {
        let url = connection_url("ws://127.0.0.1:8090/", &PeerId::from("peer a&b")).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8090/?peerID=peer+a%26b");
    }

    #[test]
    fn test_connection_url_keeps_existing_query() {
        let url = connection_url("ws://localhost:1/signal?v=2", &PeerId::from("p")).unwrap();
        assert_eq!(url.query(), Some("v=2&peerID=p"));
    }

    #[test]
    fn test_connection_url_rejects_garbage() {
        assert!(connection_url("not a url", &PeerId::from("p")).is_err());
    }

    #[test]
    fn test_route_reply_and_push() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let listeners = RelayListeners::new();
        let mut sub = listeners.subscribe();

        let (tx, mut rx) = oneshot::channel();
        lock(&pending).insert(4, tx);

        route_frame(r#"{"type":"joined","id":4,"index":2}"#, &pending, &listeners);
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Joined { id: 4, index: 2 });
        assert!(lock(&pending).is_empty());

        route_frame(
            r#"{"type":"relayed","message":{"networkID":"n","fromPeerID":"a","targetPeerID":"b","message":{"type":"offer"}}}"#,
            &pending,
            &listeners,
        );
        let relayed = sub.try_recv().unwrap();
        assert_eq!(relayed.message.from_peer_id, PeerId::from("a"));

        // Unknown ids and garbage are ignored
        route_frame(r#"{"type":"ack","id":99,"message":{"networkID":"n","fromPeerID":"a","targetPeerID":"b","message":null}}"#, &pending, &listeners);
        route_frame("garbage", &pending, &listeners);
    }

    /// The I/O task has already cleared `pending` but the request passed the
    /// closed check before that happened
    #[tokio::test]
    async fn test_request_after_io_exit_fails_closed() {
        let (outbound, mut outbound_rx) = mpsc::channel(4);
        outbound_rx.close();
        drop(outbound_rx);

        let client = WsSignalingClient {
            peer_id: PeerId::from("me"),
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            listeners: RelayListeners::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: watch::channel(false).0,
            io_task: Mutex::new(None),
        };

        let result = tokio::time::timeout(Duration::from_secs(1), client.list(&NetworkId::from("net1")))
            .await
            .expect("request waited for its timeout");
        assert!(matches!(result, Err(SignalingError::Closed)));
        assert!(lock(&client.pending).is_empty());

        client.closed.store(true, Ordering::SeqCst);
        assert!(matches!(client.join(&NetworkId::from("net1")).await, Err(SignalingError::Closed)));
    }
}
