//! Local network objects and the lifecycle event bus

use peerlink_relay::NetworkId;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::debug;

use super::types::{LifecycleEvent, NetworkTopic};

/// Events buffered per subscriber before slow readers start lagging
pub const LIFECYCLE_CAPACITY: usize = 64;

/// A network this process has joined
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNetwork {
    pub id: NetworkId,
    pub topic: NetworkTopic,
    /// Network currently hosting the topic
    pub host_id: Option<NetworkId>,
    pub local_peer_index: u64,
    pub ready: bool,
}

#[derive(Default)]
struct Inner {
    networks: HashMap<NetworkId, LocalNetwork>,
    host_ids: HashMap<NetworkTopic, NetworkId>,
}

/// Registered local networks and the host network of each topic
#[derive(Default)]
pub struct NetworkState {
    inner: RwLock<Inner>,
}

impl NetworkState {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_network(&self, network: LocalNetwork) {
        debug!("Registering local network {}", network.id);
        self.write().networks.insert(network.id.clone(), network);
    }

    pub fn remove_network(&self, id: &NetworkId) -> Option<LocalNetwork> {
        self.write().networks.remove(id)
    }

    pub fn set_ready(&self, id: &NetworkId, ready: bool) -> bool {
        match self.write().networks.get_mut(id) {
            Some(network) => {
                network.ready = ready;
                true
            }
            None => false,
        }
    }

    /// Make `id` the host network of `topic`
    pub fn set_host_id(&self, topic: &NetworkTopic, id: &NetworkId) {
        let mut inner = self.write();
        inner.host_ids.insert(topic.clone(), id.clone());
        if let Some(network) = inner.networks.get_mut(id) {
            network.host_id = Some(id.clone());
        }
    }

    /// Clear the host of `topic`, but only if it is still `id`
    pub fn clear_host_id(&self, topic: &NetworkTopic, id: &NetworkId) -> bool {
        let mut inner = self.write();
        if inner.host_ids.get(topic) != Some(id) {
            return false;
        }
        inner.host_ids.remove(topic);
        if let Some(network) = inner.networks.get_mut(id) {
            network.host_id = None;
        }
        true
    }

    pub fn network(&self, id: &NetworkId) -> Option<LocalNetwork> {
        self.read().networks.get(id).cloned()
    }

    pub fn host_id(&self, topic: &NetworkTopic) -> Option<NetworkId> {
        self.read().host_ids.get(topic).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fan-out of [`LifecycleEvent`]s to whoever tracks network membership
#[derive(Clone)]
pub struct LifecycleBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        Self { tx }
    }

    /// Returns the number of subscribers reached
    pub fn emit(&self, event: LifecycleEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for LifecycleBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_relay::{PeerId, UserId};

    fn network(id: &str) -> LocalNetwork {
        LocalNetwork {
            id: NetworkId::from(id),
            topic: NetworkTopic::world(),
            host_id: None,
            local_peer_index: 3,
            ready: false,
        }
    }

    #[test]
    fn test_register_and_host() {
        let state = NetworkState::new();
        let id = NetworkId::from("net1");
        let topic = NetworkTopic::world();

        state.add_network(network("net1"));
        state.set_host_id(&topic, &id);
        assert!(state.set_ready(&id, true));

        let registered = state.network(&id).unwrap();
        assert!(registered.ready);
        assert_eq!(registered.host_id, Some(id.clone()));
        assert_eq!(state.host_id(&topic), Some(id.clone()));

        // Another network took over the topic; clearing for net1 must not touch it
        let other = NetworkId::from("net2");
        state.set_host_id(&topic, &other);
        assert!(!state.clear_host_id(&topic, &id));
        assert_eq!(state.host_id(&topic), Some(other.clone()));

        assert!(state.clear_host_id(&topic, &other));
        assert_eq!(state.host_id(&topic), None);
        assert!(state.remove_network(&id).is_some());
        assert!(state.is_empty());
        assert!(!state.set_ready(&id, true));
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = LifecycleBus::new();
        assert_eq!(
            bus.emit(LifecycleEvent::PeerLeft {
                network_id: NetworkId::from("n"),
                topic: NetworkTopic::world(),
                peer_id: PeerId::from("p"),
                user_id: UserId::from("p"),
            }),
            0
        );

        let mut rx = bus.subscribe();
        let event = LifecycleEvent::PeerJoined {
            network_id: NetworkId::from("n"),
            topic: NetworkTopic::world(),
            peer_id: PeerId::from("p"),
            peer_index: 0,
            user_id: UserId::from("p"),
        };
        assert_eq!(bus.emit(event.clone()), 1);
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
