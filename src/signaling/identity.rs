//! Where the local user id comes from

use peerlink_relay::{PeerId, UserId};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// Supplies the user id announced in lifecycle events
pub trait IdentityProvider: Send + Sync + 'static {
    fn user_id(&self, peer_id: &PeerId) -> UserId;
}

/// A user id handed in by a real identity service
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub UserId);

impl IdentityProvider for StaticIdentity {
    fn user_id(&self, _peer_id: &PeerId) -> UserId {
        self.0.clone()
    }
}

/// Degraded mode: the peer id doubles as the user id
#[derive(Debug, Default)]
pub struct PeerAliasIdentity {
    warned: AtomicBool,
}

impl PeerAliasIdentity {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityProvider for PeerAliasIdentity {
    fn user_id(&self, peer_id: &PeerId) -> UserId {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!("No identity service configured, using peer id as user id");
        }
        UserId::new(peer_id.as_str())
    }
}
