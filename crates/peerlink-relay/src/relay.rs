//! Stateless forwarding of addressed signaling messages

use std::sync::Arc;
use tracing::debug;

use crate::channels::PeerChannels;
use crate::error::{Error, Result};
use crate::protocol::{NetworkId, PeerId, ServerMessage, SignalMessage};

pub struct SignalRelay {
    channels: Arc<PeerChannels>,
}

impl SignalRelay {
    pub fn new(channels: Arc<PeerChannels>) -> Self {
        Self { channels }
    }

    /// Forward a message to the target peer's private channel.
    ///
    /// `sender` is the identity of the connection that submitted the message;
    /// it always replaces whatever "from" the client claimed. With nobody
    /// subscribed to the target the message is dropped without error.
    pub async fn relay(
        &self,
        sender: Option<&PeerId>,
        network_id: Option<&NetworkId>,
        target_peer_id: Option<&PeerId>,
        message: serde_json::Value,
    ) -> Result<SignalMessage> {
        let from_peer_id = sender.ok_or(Error::InvalidRequest("peerID required"))?;
        let target_peer_id = target_peer_id.ok_or(Error::InvalidRequest("targetPeerID required"))?;
        let network_id = network_id.ok_or(Error::InvalidRequest("networkID required"))?;

        let signal = SignalMessage {
            network_id: network_id.clone(),
            from_peer_id: from_peer_id.clone(),
            target_peer_id: target_peer_id.clone(),
            message,
        };

        let delivered = self
            .channels
            .publish(
                target_peer_id,
                ServerMessage::Relayed {
                    message: signal.clone(),
                },
            )
            .await;

        if delivered == 0 {
            debug!(
                "No subscriber for {} in {}, dropping message from {}",
                target_peer_id.short(),
                network_id,
                from_peer_id.short()
            );
        } else {
            debug!(
                "Relayed {} -> {} in {}",
                from_peer_id.short(),
                target_peer_id.short(),
                network_id
            );
        }

        Ok(signal)
    }
}
