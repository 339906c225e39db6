//! Client-side signaling types

use peerlink_relay::{NetworkId, PeerId, UserId};
use serde::{Deserialize, Serialize};

/// Generate a random peer id (30 base-36 characters)
pub fn generate_peer_id() -> PeerId {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let id: String = (0..30)
        .map(|_| char::from_digit(rng.gen_range(0..36), 36).unwrap_or('0'))
        .collect();
    PeerId::new(id)
}

/// Handshake progress with one remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Discovered,
    Negotiating,
    Connected,
    Closed,
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        *self == ConnectionState::Closed
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Discovered => write!(f, "discovered"),
            ConnectionState::Negotiating => write!(f, "negotiating"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Logical topic a network serves
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkTopic(String);

impl NetworkTopic {
    pub fn new(topic: impl Into<String>) -> Self {
        Self(topic.into())
    }

    pub fn world() -> Self {
        Self::new("world")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NetworkTopic {
    fn default() -> Self {
        Self::world()
    }
}

impl std::fmt::Display for NetworkTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The local end of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPeer {
    pub peer_id: PeerId,
    pub user_id: UserId,
}

/// Announcements for subsystems that track who is in a network
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    PeerJoined {
        network_id: NetworkId,
        topic: NetworkTopic,
        peer_id: PeerId,
        peer_index: u64,
        user_id: UserId,
    },
    PeerLeft {
        network_id: NetworkId,
        topic: NetworkTopic,
        peer_id: PeerId,
        user_id: UserId,
    },
}

impl LifecycleEvent {
    pub fn network_id(&self) -> &NetworkId {
        match self {
            LifecycleEvent::PeerJoined { network_id, .. } => network_id,
            LifecycleEvent::PeerLeft { network_id, .. } => network_id,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        match self {
            LifecycleEvent::PeerJoined { peer_id, .. } => peer_id,
            LifecycleEvent::PeerLeft { peer_id, .. } => peer_id,
        }
    }
}
