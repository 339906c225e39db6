//! Seam to the routine that negotiates the direct connection
//!
//! The signaling core only carries opaque payloads between two peers. What
//! goes into them (SDP offers, answers, ICE candidates) is up to a
//! [`Negotiator`], which gets a [`PeerLink`] to talk to its remote
//! counterpart.

use peerlink_relay::{NetworkId, PeerId, UserId};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::types::ConnectionState;

/// Everything a negotiation routine knows about its two ends
#[derive(Debug, Clone)]
pub struct NegotiationContext {
    pub network_id: NetworkId,
    pub local_peer_id: PeerId,
    pub local_index: u64,
    pub local_user_id: UserId,
    pub remote_peer_id: PeerId,
    pub remote_index: u64,
    pub link: PeerLink,
}

impl NegotiationContext {
    /// Lower index goes first
    pub fn is_initiator(&self) -> bool {
        self.local_index < self.remote_index
    }
}

/// Creates one negotiation per discovered remote peer
pub trait Negotiator: Send + Sync + 'static {
    fn negotiate(&self, ctx: NegotiationContext) -> Box<dyn Negotiation>;
}

/// A running negotiation with one remote peer
pub trait Negotiation: Send + 'static {
    /// A payload from the remote peer arrived
    fn on_message(&mut self, payload: Value);

    /// The driver closed; nothing more will be delivered
    fn on_close(&mut self) {}
}

/// Send capability bound to one driver
#[derive(Debug, Clone)]
pub struct PeerLink {
    outbound: mpsc::UnboundedSender<Value>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl PeerLink {
    pub(crate) fn new(
        outbound: mpsc::UnboundedSender<Value>,
        state: Arc<watch::Sender<ConnectionState>>,
    ) -> Self {
        Self { outbound, state }
    }

    /// Queue a payload for the remote peer. Returns false once the driver closed.
    pub fn send(&self, payload: Value) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbound.send(payload).is_ok()
    }

    /// Report that the direct connection is up
    pub fn mark_connected(&self) -> bool {
        self.state.send_if_modified(|state| match state {
            ConnectionState::Discovered | ConnectionState::Negotiating => {
                *state = ConnectionState::Connected;
                true
            }
            _ => false,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }
}
