//! In-memory peer registry
//!
//! Maps each network to the peers that joined it, in join order. Nothing here
//! survives a restart.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::channels::{ConnectionHandle, PeerChannels};
use crate::error::{Error, Result};
use crate::protocol::{ConnectionId, NetworkId, PeerId, PeerRecord, UserId};

/// Source of peer indices. Indices only ever increase and are never reused.
#[derive(Debug, Clone, Default)]
pub struct IndexSequence {
    next: u64,
}

impl IndexSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(first: u64) -> Self {
        Self { next: first }
    }

    pub fn next(&mut self) -> u64 {
        let index = self.next;
        self.next += 1;
        index
    }
}

/// Maps a peer to the user behind it
pub trait IdentityResolver: Send + Sync + 'static {
    fn resolve(&self, peer_id: &PeerId) -> UserId;
}

/// Fallback used when no user service is wired in: the user id is the peer id
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerIdAsUserId;

impl IdentityResolver for PeerIdAsUserId {
    fn resolve(&self, peer_id: &PeerId) -> UserId {
        UserId::new(peer_id.as_str())
    }
}

struct RegistryState {
    networks: HashMap<NetworkId, Vec<PeerRecord>>,
    sequence: IndexSequence,
}

pub struct PeerRegistry {
    state: RwLock<RegistryState>,
    channels: Arc<PeerChannels>,
    identity: Arc<dyn IdentityResolver>,
}

impl PeerRegistry {
    pub fn new(channels: Arc<PeerChannels>) -> Self {
        Self::with_sequence(channels, IndexSequence::new())
    }

    pub fn with_sequence(channels: Arc<PeerChannels>, sequence: IndexSequence) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                networks: HashMap::new(),
                sequence,
            }),
            channels,
            identity: Arc::new(PeerIdAsUserId),
        }
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = identity;
        self
    }

    /// Add a peer to a network and subscribe its connection to the peer's
    /// private channel. Returns the peer's index in the network.
    pub async fn join(
        &self,
        network_id: Option<&NetworkId>,
        peer_id: Option<&PeerId>,
        conn: &ConnectionHandle,
    ) -> Result<u64> {
        let peer_id = peer_id.ok_or(Error::InvalidRequest("peerID required"))?;
        let network_id = network_id.ok_or(Error::InvalidRequest("networkID required"))?;

        let mut state = self.state.write().await;

        self.channels.subscribe(peer_id, conn).await;

        if let Some(existing) = state
            .networks
            .get(network_id)
            .and_then(|peers| peers.iter().find(|p| &p.peer_id == peer_id))
        {
            debug!(
                "Peer {} already in network {} (index {})",
                peer_id, network_id, existing.peer_index
            );
            return Ok(existing.peer_index);
        }

        let peer_index = state.sequence.next();
        let user_id = self.identity.resolve(peer_id);
        state
            .networks
            .entry(network_id.clone())
            .or_default()
            .push(PeerRecord {
                peer_id: peer_id.clone(),
                peer_index,
                user_id,
            });

        info!("Peer {} joined network {} (index {})", peer_id, network_id, peer_index);

        Ok(peer_index)
    }

    /// Remove a disconnected peer from every network it joined.
    /// Returns the networks it was removed from; empty if it was already gone.
    pub async fn leave(&self, peer_id: &PeerId, conn: ConnectionId) -> Vec<NetworkId> {
        let mut state = self.state.write().await;

        self.channels.unsubscribe(peer_id, conn).await;

        let mut left = Vec::new();
        state.networks.retain(|network_id, peers| {
            let before = peers.len();
            peers.retain(|p| &p.peer_id != peer_id);
            if peers.len() != before {
                info!("Peer {} left network {}", peer_id, network_id);
                left.push(network_id.clone());
            }
            if peers.is_empty() {
                debug!("Network {} is empty, removing", network_id);
                return false;
            }
            true
        });

        left
    }

    /// Current peers of a network in join order
    pub async fn list(&self, network_id: &NetworkId) -> Vec<PeerRecord> {
        self.state
            .read()
            .await
            .networks
            .get(network_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn contains_network(&self, network_id: &NetworkId) -> bool {
        self.state.read().await.networks.contains_key(network_id)
    }

    pub async fn network_count(&self) -> usize {
        self.state.read().await.networks.len()
    }

    pub async fn peer_count(&self) -> usize {
        self.state
            .read()
            .await
            .networks
            .values()
            .map(|peers| peers.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn registry() -> PeerRegistry {
        PeerRegistry::new(Arc::new(PeerChannels::new()))
    }

    fn conn(id: u64, peer: &str) -> ConnectionHandle {
        let (tx, _rx) = mpsc::channel(8);
        ConnectionHandle::new(ConnectionId(id), Some(PeerId::from(peer)), tx)
    }

    async fn join(registry: &PeerRegistry, network: &str, id: u64, peer: &str) -> u64 {
        let c = conn(id, peer);
        registry
            .join(Some(&NetworkId::from(network)), c.peer_id.as_ref(), &c)
            .await
            .unwrap()
    }

    #[test]
    fn test_index_sequence() {
        let mut seq = IndexSequence::starting_at(5);
        assert_eq!(seq.next(), 5);
        assert_eq!(seq.next(), 6);
        assert_eq!(seq.next(), 7);
    }

    #[tokio::test]
    async fn test_indices_strictly_increase_across_leaves() {
        let registry = registry();
        let net = NetworkId::from("net1");

        assert_eq!(join(&registry, "net1", 1, "a").await, 0);
        assert_eq!(join(&registry, "net1", 2, "b").await, 1);

        registry.leave(&PeerId::from("a"), ConnectionId(1)).await;
        registry.leave(&PeerId::from("b"), ConnectionId(2)).await;
        assert!(!registry.contains_network(&net).await);

        // Indices are not reused once the network is recreated
        assert_eq!(join(&registry, "net1", 3, "c").await, 2);
        assert_eq!(join(&registry, "other", 4, "d").await, 3);
    }

    #[tokio::test]
    async fn test_injected_sequence() {
        let registry =
            PeerRegistry::with_sequence(Arc::new(PeerChannels::new()), IndexSequence::starting_at(100));
        assert_eq!(join(&registry, "net1", 1, "a").await, 100);
    }

    #[tokio::test]
    async fn test_join_requires_peer_and_network() {
        let registry = registry();
        let c = conn(1, "a");

        let err = registry.join(None, c.peer_id.as_ref(), &c).await.unwrap_err();
        assert_eq!(err, Error::InvalidRequest("networkID required"));

        let err = registry
            .join(Some(&NetworkId::from("net1")), None, &c)
            .await
            .unwrap_err();
        assert_eq!(err, Error::InvalidRequest("peerID required"));

        assert_eq!(registry.network_count().await, 0);
    }

    #[tokio::test]
    async fn test_rejoin_keeps_single_record() {
        let registry = registry();
        assert_eq!(join(&registry, "net1", 1, "a").await, 0);
        assert_eq!(join(&registry, "net1", 1, "a").await, 0);

        let peers = registry.list(&NetworkId::from("net1")).await;
        assert_eq!(peers.len(), 1);

        // The sequence did not advance for the duplicate
        assert_eq!(join(&registry, "net1", 2, "b").await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_joins_then_lowest_leaves() {
        let registry = Arc::new(registry());
        let net = NetworkId::from("net1");
        let n = 16;

        let mut handles = Vec::new();
        for i in 0..n {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let c = conn(i, &format!("peer-{}", i));
                let index = registry
                    .join(Some(&NetworkId::from("net1")), c.peer_id.as_ref(), &c)
                    .await
                    .unwrap();
                (c, index)
            }));
        }

        let mut joined = Vec::new();
        for h in handles {
            joined.push(h.await.unwrap());
        }

        let mut indices: Vec<u64> = joined.iter().map(|(_, i)| *i).collect();
        indices.sort();
        assert_eq!(indices, (0..n).collect::<Vec<_>>());

        // Join order and index order agree
        let peers = registry.list(&net).await;
        assert!(peers.windows(2).all(|w| w[0].peer_index < w[1].peer_index));

        let (lowest, _) = joined.iter().find(|(_, i)| *i == 0).unwrap();
        let lowest_peer = lowest.peer_id.clone().unwrap();
        registry.leave(&lowest_peer, lowest.id).await;

        let peers = registry.list(&net).await;
        assert_eq!(peers.len(), n as usize - 1);
        assert!(peers.iter().all(|p| p.peer_id != lowest_peer));

        for (c, _) in &joined {
            registry.leave(c.peer_id.as_ref().unwrap(), c.id).await;
        }
        assert!(registry.list(&net).await.is_empty());
        assert!(!registry.contains_network(&net).await);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let registry = registry();
        join(&registry, "net1", 1, "a").await;
        join(&registry, "net1", 2, "b").await;

        let left = registry.leave(&PeerId::from("a"), ConnectionId(1)).await;
        assert_eq!(left, vec![NetworkId::from("net1")]);

        assert!(registry.leave(&PeerId::from("a"), ConnectionId(1)).await.is_empty());
        assert!(registry.leave(&PeerId::from("a"), ConnectionId(1)).await.is_empty());
        assert_eq!(registry.list(&NetworkId::from("net1")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_removes_from_all_networks() {
        let registry = registry();
        join(&registry, "net1", 1, "a").await;
        join(&registry, "net2", 1, "a").await;
        join(&registry, "net2", 2, "b").await;

        let mut left = registry.leave(&PeerId::from("a"), ConnectionId(1)).await;
        left.sort();
        assert_eq!(left, vec![NetworkId::from("net1"), NetworkId::from("net2")]);
        assert_eq!(registry.network_count().await, 1);
        assert_eq!(registry.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_list_unknown_network_is_empty() {
        let registry = registry();
        assert!(registry.list(&NetworkId::from("nope")).await.is_empty());
    }

    #[tokio::test]
    async fn test_user_id_defaults_to_peer_id() {
        let registry = registry();
        join(&registry, "net1", 1, "a").await;
        let peers = registry.list(&NetworkId::from("net1")).await;
        assert_eq!(peers[0].user_id, UserId::from("a"));
    }

    #[tokio::test]
    async fn test_custom_identity_resolver() {
        struct Prefixed;
        impl IdentityResolver for Prefixed {
            fn resolve(&self, peer_id: &PeerId) -> UserId {
                UserId::new(format!("user-{}", peer_id))
            }
        }

        let registry = registry().with_identity(Arc::new(Prefixed));
        join(&registry, "net1", 1, "a").await;
        let peers = registry.list(&NetworkId::from("net1")).await;
        assert_eq!(peers[0].user_id, UserId::from("user-a"));
    }
}
