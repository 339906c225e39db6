pub mod config;
pub mod server;
pub mod signaling;

pub use config::{get_config_path, Config};
pub use peerlink_relay::{
    ws_handler, HubConfig, IdentityResolver, NetworkId, PeerId, PeerIdAsUserId, PeerRecord,
    RelayState, SignalMessage, SignalingHub, UserId,
};
pub use server::SignalingServer;
pub use signaling::{
    generate_peer_id, ConnectionState, LifecycleBus, LifecycleEvent, LocalSignaling,
    NetworkSession, NetworkState, NetworkTopic, ProbeNegotiator, SessionConfig, SessionDeps,
    SignalingApi, WsSignalingClient,
};
