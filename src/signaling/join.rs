//! One-shot network join with cancellation
//!
//! `Idle -> Joining -> Joined -> TornDown`, or `Failed` when the relay
//! refuses. Every activation carries its own cancel token; a response for a
//! superseded or torn down attempt is dropped without side effects.

use peerlink_relay::NetworkId;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::api::SignalingApi;
use super::error::Result;
use super::state::{LifecycleBus, LocalNetwork, NetworkState};
use super::types::{LifecycleEvent, LocalPeer, NetworkTopic};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinState {
    Idle,
    Joining,
    Joined { peer_index: u64 },
    Failed(String),
    TornDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined(u64),
    /// Cancelled by teardown or a newer activation
    Superseded,
}

struct Inner {
    state: JoinState,
    attempt: u64,
    cancel: Option<watch::Sender<bool>>,
}

pub struct NetworkJoinCoordinator {
    api: Arc<dyn SignalingApi>,
    network_id: NetworkId,
    topic: NetworkTopic,
    local: LocalPeer,
    networks: Arc<NetworkState>,
    events: LifecycleBus,
    inner: Mutex<Inner>,
}

impl NetworkJoinCoordinator {
    pub fn new(
        api: Arc<dyn SignalingApi>,
        network_id: NetworkId,
        topic: NetworkTopic,
        local: LocalPeer,
        networks: Arc<NetworkState>,
        events: LifecycleBus,
    ) -> Self {
        Self {
            api,
            network_id,
            topic,
            local,
            networks,
            events,
            inner: Mutex::new(Inner {
                state: JoinState::Idle,
                attempt: 0,
                cancel: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> JoinState {
        self.lock().state.clone()
    }

    pub fn peer_index(&self) -> Option<u64> {
        match self.lock().state {
            JoinState::Joined { peer_index } => Some(peer_index),
            _ => None,
        }
    }

    /// Join the network, cancelling any earlier attempt
    pub async fn activate(&self) -> Result<JoinOutcome> {
        let (attempt, mut cancel_rx) = {
            let mut inner = self.lock();
            self.cancel_and_leave(&mut inner);
            inner.attempt += 1;
            let (cancel, cancel_rx) = watch::channel(false);
            inner.cancel = Some(cancel);
            inner.state = JoinState::Joining;
            (inner.attempt, cancel_rx)
        };

        debug!("Joining {} (attempt {})", self.network_id, attempt);

        let result = tokio::select! {
            result = self.api.join(&self.network_id) => result,
            _ = cancelled(&mut cancel_rx) => {
                debug!("Join of {} cancelled (attempt {})", self.network_id, attempt);
                return Ok(JoinOutcome::Superseded);
            }
        };

        let mut inner = self.lock();
        if inner.attempt != attempt || *cancel_rx.borrow() {
            debug!("Discarding stale join response for {}", self.network_id);
            return Ok(JoinOutcome::Superseded);
        }
        inner.cancel = None;

        match result {
            Ok(peer_index) => {
                inner.state = JoinState::Joined { peer_index };
                self.networks.add_network(LocalNetwork {
                    id: self.network_id.clone(),
                    topic: self.topic.clone(),
                    host_id: None,
                    local_peer_index: peer_index,
                    ready: false,
                });
                self.networks.set_host_id(&self.topic, &self.network_id);
                self.networks.set_ready(&self.network_id, true);
                self.events.emit(LifecycleEvent::PeerJoined {
                    network_id: self.network_id.clone(),
                    topic: self.topic.clone(),
                    peer_id: self.local.peer_id.clone(),
                    peer_index,
                    user_id: self.local.user_id.clone(),
                });
                info!(
                    "Joined {} as {} (index {})",
                    self.network_id,
                    self.local.peer_id.short(),
                    peer_index
                );
                Ok(JoinOutcome::Joined(peer_index))
            }
            Err(e) => {
                warn!("Joining {} failed: {}", self.network_id, e);
                inner.state = JoinState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Cancel any in-flight attempt and leave. Nothing fires afterwards.
    pub fn teardown(&self) {
        let mut inner = self.lock();
        self.cancel_and_leave(&mut inner);
        inner.state = JoinState::TornDown;
    }

    fn cancel_and_leave(&self, inner: &mut Inner) {
        if let Some(cancel) = inner.cancel.take() {
            let _ = cancel.send(true);
        }
        if let JoinState::Joined { .. } = inner.state {
            self.events.emit(LifecycleEvent::PeerLeft {
                network_id: self.network_id.clone(),
                topic: self.topic.clone(),
                peer_id: self.local.peer_id.clone(),
                user_id: self.local.user_id.clone(),
            });
            self.networks.remove_network(&self.network_id);
            self.networks.clear_host_id(&self.topic, &self.network_id);
            info!("Left {}", self.network_id);
        }
    }
}

/// Resolves once the token is set or its sender is gone
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|cancelled| *cancelled).await;
}
