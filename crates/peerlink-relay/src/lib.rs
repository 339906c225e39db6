//! Signaling relay for peer-to-peer connection bootstrapping
//!
//! This crate provides:
//! - The wire protocol shared by server and clients
//! - An in-memory peer registry keyed by network
//! - Per-peer private channels and the message relay on top of them
//! - An axum WebSocket endpoint serving the protocol

pub mod channels;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod relay;
mod server;

pub use channels::{ConnectionHandle, PeerChannels};
pub use error::{Error, Result};
pub use hub::{
    HubConfig, SignalingHub, DEFAULT_CHANNEL_CAPACITY, DEFAULT_PING_INTERVAL, DEFAULT_PING_TIMEOUT,
};
pub use protocol::{
    ClientRequest, ConnectionId, ErrorCode, NetworkId, PeerId, PeerRecord, ServerMessage,
    SignalMessage, UserId,
};
pub use registry::{IdentityResolver, IndexSequence, PeerIdAsUserId, PeerRegistry};
pub use relay::SignalRelay;
pub use server::{ws_handler, ConnectQuery, RelayState};
