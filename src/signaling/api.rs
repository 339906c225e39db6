//! The signaling operations a client session needs from a transport

use async_trait::async_trait;
use peerlink_relay::{NetworkId, PeerId, PeerRecord, SignalMessage};

use super::error::Result;
use super::listeners::RelayListeners;

/// A connection to the signaling relay.
///
/// The peer id is fixed when the connection is opened and is never sent in a
/// request body.
#[async_trait]
pub trait SignalingApi: Send + Sync + 'static {
    /// Identity this connection was opened with
    fn peer_id(&self) -> &PeerId;

    /// Join a network, returning the assigned peer index
    async fn join(&self, network_id: &NetworkId) -> Result<u64>;

    /// Submit a message for `target`; resolves once the relay accepted it
    async fn relay(
        &self,
        network_id: &NetworkId,
        target: &PeerId,
        message: serde_json::Value,
    ) -> Result<SignalMessage>;

    /// Current peers of a network in join order
    async fn list(&self, network_id: &NetworkId) -> Result<Vec<PeerRecord>>;

    /// Handlers for `relayed` pushes arriving on this connection
    fn listeners(&self) -> &RelayListeners;
}
