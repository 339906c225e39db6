//! Request dispatch shared by every transport
//!
//! The WebSocket handler and in-process clients both go through
//! [`SignalingHub`], so they see identical validation and identity rules.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::channels::{ConnectionHandle, PeerChannels};
use crate::protocol::{ClientRequest, ConnectionId, ErrorCode, NetworkId, PeerId, ServerMessage};
use crate::registry::{IdentityResolver, IndexSequence, PeerRegistry};
use crate::relay::SignalRelay;

/// Default per-connection outbound queue size
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound frames buffered per connection before pushes are dropped
    pub channel_capacity: usize,
    /// How often the server pings each socket
    pub ping_interval: Duration,
    /// Grace after a missed ping before a silent socket counts as disconnected
    pub ping_timeout: Duration,
}

impl HubConfig {
    /// Longest a socket may stay silent before it is dropped
    pub fn idle_timeout(&self) -> Duration {
        self.ping_interval + self.ping_timeout
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }
}

pub struct SignalingHub {
    registry: PeerRegistry,
    relay: SignalRelay,
    config: HubConfig,
    next_connection: AtomicU64,
}

impl SignalingHub {
    pub fn new(config: HubConfig) -> Self {
        Self::with_sequence(config, IndexSequence::new())
    }

    pub fn with_sequence(config: HubConfig, sequence: IndexSequence) -> Self {
        let channels = Arc::new(PeerChannels::new());
        Self {
            registry: PeerRegistry::with_sequence(channels.clone(), sequence),
            relay: SignalRelay::new(channels),
            config,
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.registry = self.registry.with_identity(identity);
        self
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Register a new connection. The peer id comes from the transport
    /// (e.g. the WebSocket query string).
    pub fn connect(&self, peer_id: Option<PeerId>) -> (ConnectionHandle, mpsc::Receiver<ServerMessage>) {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        debug!(
            "Connection {} opened for peer {}",
            id,
            peer_id.as_ref().map(|p| p.as_str()).unwrap_or("<none>")
        );
        (ConnectionHandle::new(id, peer_id, tx), rx)
    }

    /// Handle one request and build its reply
    pub async fn handle(&self, conn: &ConnectionHandle, request: ClientRequest) -> ServerMessage {
        let id = request.id();
        trace!("{} {} request {}", conn.id, request.method(), id);

        match request {
            ClientRequest::Join { network_id, .. } => {
                match self
                    .registry
                    .join(network_id.as_ref(), conn.peer_id.as_ref(), conn)
                    .await
                {
                    Ok(index) => ServerMessage::Joined { id, index },
                    Err(e) => ServerMessage::error(Some(id), e.code(), e.to_string()),
                }
            }
            ClientRequest::Relay {
                network_id,
                target_peer_id,
                message,
                ..
            } => {
                match self
                    .relay
                    .relay(
                        conn.peer_id.as_ref(),
                        network_id.as_ref(),
                        target_peer_id.as_ref(),
                        message,
                    )
                    .await
                {
                    Ok(message) => ServerMessage::Ack { id, message },
                    Err(e) => ServerMessage::error(Some(id), e.code(), e.to_string()),
                }
            }
            ClientRequest::List { network_id, .. } => {
                // A list without a network is answered with nothing, not an error
                let peers = match network_id {
                    Some(network_id) => self.registry.list(&network_id).await,
                    None => Vec::new(),
                };
                ServerMessage::Peers { id, peers }
            }
        }
    }

    /// Parse and handle a raw text frame
    pub async fn handle_text(&self, conn: &ConnectionHandle, text: &str) -> ServerMessage {
        match serde_json::from_str::<ClientRequest>(text) {
            Ok(request) => self.handle(conn, request).await,
            Err(e) => {
                warn!("Bad frame from {}: {}", conn.id, e);
                let id = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v.get("id").and_then(|id| id.as_u64()));
                ServerMessage::error(id, ErrorCode::BadFrame, format!("Invalid frame: {}", e))
            }
        }
    }

    /// Transport-level disconnect: drop the peer from every network
    pub async fn disconnect(&self, conn: &ConnectionHandle) -> Vec<NetworkId> {
        debug!("Connection {} closed", conn.id);
        match &conn.peer_id {
            Some(peer_id) => self.registry.leave(peer_id, conn.id).await,
            None => Vec::new(),
        }
    }
}

impl Default for SignalingHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}
