//! A joined network with discovery and per-peer drivers running

use peerlink_relay::{NetworkId, PeerId, PeerRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::api::SignalingApi;
use super::discovery::{DriverSet, PeerDiscoveryLoop, DEFAULT_POLL_INTERVAL};
use super::driver::DriverContext;
use super::error::{Result, SignalingError};
use super::identity::IdentityProvider;
use super::join::{JoinOutcome, JoinState, NetworkJoinCoordinator};
use super::negotiation::Negotiator;
use super::state::{LifecycleBus, NetworkState};
use super::types::{ConnectionState, LocalPeer, NetworkTopic};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub network_id: NetworkId,
    pub topic: NetworkTopic,
    pub poll_interval: Duration,
}

impl SessionConfig {
    pub fn new(network_id: NetworkId) -> Self {
        Self {
            network_id,
            topic: NetworkTopic::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_topic(mut self, topic: NetworkTopic) -> Self {
        self.topic = topic;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Shared collaborators of every session in a process
#[derive(Clone)]
pub struct SessionDeps {
    pub networks: Arc<NetworkState>,
    pub events: LifecycleBus,
    pub identity: Arc<dyn IdentityProvider>,
}

pub struct NetworkSession {
    network_id: NetworkId,
    local: LocalPeer,
    local_index: u64,
    coordinator: Arc<NetworkJoinCoordinator>,
    drivers: DriverSet,
    shutdown: watch::Sender<bool>,
    discovery: Option<JoinHandle<()>>,
}

impl NetworkSession {
    /// Join `config.network_id` and start discovering peers
    pub async fn start(
        api: Arc<dyn SignalingApi>,
        negotiator: Arc<dyn Negotiator>,
        deps: SessionDeps,
        config: SessionConfig,
    ) -> Result<Self> {
        let local = LocalPeer {
            peer_id: api.peer_id().clone(),
            user_id: deps.identity.user_id(api.peer_id()),
        };

        let coordinator = Arc::new(NetworkJoinCoordinator::new(
            api.clone(),
            config.network_id.clone(),
            config.topic.clone(),
            local.clone(),
            deps.networks,
            deps.events,
        ));

        // Installed before joining so offers sent right after our join are kept
        let early = api.listeners().subscribe();

        let local_index = match coordinator.activate().await? {
            JoinOutcome::Joined(index) => index,
            JoinOutcome::Superseded => return Err(SignalingError::Cancelled),
        };

        let drivers = DriverSet::new();
        let ctx = DriverContext {
            api,
            negotiator,
            network_id: config.network_id.clone(),
            local: local.clone(),
            local_index,
        };
        let (shutdown, shutdown_rx) = watch::channel(false);
        let discovery = PeerDiscoveryLoop::new(ctx, config.poll_interval, drivers.clone(), early);
        let discovery = tokio::spawn(discovery.run(shutdown_rx));

        info!(
            "Session for {} started (peer {}, index {})",
            config.network_id,
            local.peer_id.short(),
            local_index
        );

        Ok(Self {
            network_id: config.network_id,
            local,
            local_index,
            coordinator,
            drivers,
            shutdown,
            discovery: Some(discovery),
        })
    }

    pub fn network_id(&self) -> &NetworkId {
        &self.network_id
    }

    pub fn local(&self) -> &LocalPeer {
        &self.local
    }

    pub fn local_index(&self) -> u64 {
        self.local_index
    }

    pub fn join_state(&self) -> JoinState {
        self.coordinator.state()
    }

    /// Remote peers with a running driver, in index order
    pub fn peer_states(&self) -> Vec<(PeerRecord, ConnectionState)> {
        self.drivers.states()
    }

    pub fn watch_peer(&self, peer_id: &PeerId) -> Option<watch::Receiver<ConnectionState>> {
        self.drivers.watch(peer_id)
    }

    /// Stop polling, close every driver, then leave
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(discovery) = self.discovery.take() {
            let _ = discovery.await;
        }
        self.coordinator.teardown();
        debug!("Session for {} shut down", self.network_id);
    }
}

impl Drop for NetworkSession {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.coordinator.teardown();
    }
}
