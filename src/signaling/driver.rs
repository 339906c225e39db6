//! Per-remote-peer handshake driver
//!
//! One [`PeerConnectionDriver`] exists for every remote peer the discovery
//! loop knows about. It owns the [`ConnectionState`] for that peer, feeds
//! matching relayed messages to the negotiation routine and pushes the
//! routine's outbound payloads through the relay.

use peerlink_relay::{NetworkId, PeerId, PeerRecord, SignalMessage};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::api::SignalingApi;
use super::listeners::RelaySubscription;
use super::negotiation::{Negotiation, NegotiationContext, Negotiator, PeerLink};
use super::types::{ConnectionState, LocalPeer};

/// Accepts only traffic from `remote` to `local` within one network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFilter {
    pub network_id: NetworkId,
    pub local: PeerId,
    pub remote: PeerId,
}

impl RelayFilter {
    pub fn matches(&self, message: &SignalMessage) -> bool {
        message.from_peer_id == self.remote
            && message.target_peer_id == self.local
            && message.network_id == self.network_id
    }
}

/// What every driver of one session shares
#[derive(Clone)]
pub struct DriverContext {
    pub api: Arc<dyn SignalingApi>,
    pub negotiator: Arc<dyn Negotiator>,
    pub network_id: NetworkId,
    pub local: LocalPeer,
    pub local_index: u64,
}

pub struct PeerConnectionDriver {
    remote: PeerRecord,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PeerConnectionDriver {
    /// Start driving the handshake with `remote`.
    ///
    /// `subscription` must have been installed before the caller learned of
    /// the peer; `backlog` holds messages that arrived earlier and is
    /// delivered first.
    pub fn spawn(
        ctx: &DriverContext,
        remote: PeerRecord,
        subscription: RelaySubscription,
        backlog: Vec<SignalMessage>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Discovered);
        let state = Arc::new(state);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let filter = RelayFilter {
            network_id: ctx.network_id.clone(),
            local: ctx.local.peer_id.clone(),
            remote: remote.peer_id.clone(),
        };

        debug!(
            "Discovered {} (index {}) in {}",
            remote.peer_id.short(),
            remote.peer_index,
            ctx.network_id
        );

        let mut negotiation = ctx.negotiator.negotiate(NegotiationContext {
            network_id: ctx.network_id.clone(),
            local_peer_id: ctx.local.peer_id.clone(),
            local_index: ctx.local_index,
            local_user_id: ctx.local.user_id.clone(),
            remote_peer_id: remote.peer_id.clone(),
            remote_index: remote.peer_index,
            link: PeerLink::new(outbound_tx, state.clone()),
        });

        // The routine may already have reported success
        state.send_if_modified(|s| {
            if *s == ConnectionState::Discovered {
                *s = ConnectionState::Negotiating;
                true
            } else {
                false
            }
        });

        for message in backlog.into_iter().filter(|m| filter.matches(m)) {
            trace!("Replaying early message from {}", remote.peer_id.short());
            negotiation.on_message(message.message);
        }

        let task = tokio::spawn(run_driver(
            ctx.api.clone(),
            filter,
            negotiation,
            subscription,
            outbound_rx,
            state.clone(),
            shutdown_rx,
        ));

        Self {
            remote,
            state,
            shutdown,
            task: Some(task),
        }
    }

    pub fn remote(&self) -> &PeerRecord {
        &self.remote
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Stop the driver and wait for it. Never talks to the relay.
    pub async fn close(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PeerConnectionDriver {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run_driver(
    api: Arc<dyn SignalingApi>,
    filter: RelayFilter,
    mut negotiation: Box<dyn Negotiation>,
    mut subscription: RelaySubscription,
    mut outbound_rx: mpsc::UnboundedReceiver<Value>,
    state: Arc<watch::Sender<ConnectionState>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    'run: loop {
        tokio::select! {
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            relayed = subscription.recv() => {
                let Some(relayed) = relayed else {
                    break;
                };
                if filter.matches(&relayed.message) {
                    trace!("Message {} from {}", relayed.seq, filter.remote.short());
                    negotiation.on_message(relayed.message.message);
                }
            }
            Some(payload) = outbound_rx.recv() => {
                if state.borrow().is_closed() {
                    break;
                }
                tokio::select! {
                    res = shutdown_rx.changed() => {
                        if res.is_err() || *shutdown_rx.borrow() {
                            break 'run;
                        }
                    }
                    result = api.relay(&filter.network_id, &filter.remote, payload) => {
                        if let Err(e) = result {
                            warn!("Relay to {} failed: {}", filter.remote.short(), e);
                        }
                    }
                }
            }
        }
    }

    state.send_replace(ConnectionState::Closed);
    negotiation.on_close();
    drop(subscription);
    info!("Driver for {} in {} closed", filter.remote.short(), filter.network_id);
}
