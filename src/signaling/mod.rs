//! Client side of the signaling relay
//!
//! A [`NetworkSession`] joins one network through a [`SignalingApi`]
//! connection, polls its peer list and runs a [`PeerConnectionDriver`] per
//! remote peer. Drivers hand relayed payloads to a pluggable [`Negotiator`].

mod api;
mod client;
mod discovery;
mod driver;
mod error;
mod identity;
mod join;
mod listeners;
mod local;
mod negotiation;
mod probe;
mod session;
mod state;
mod types;


pub use api::SignalingApi;
pub use client::{connection_url, WsSignalingClient, DEFAULT_REQUEST_TIMEOUT};
pub use discovery::{
    diff, DiscoveryDelta, DriverSet, PeerDiscoveryLoop, DEFAULT_POLL_INTERVAL, EARLY_SIGNAL_BACKLOG,
};
pub use driver::{DriverContext, PeerConnectionDriver, RelayFilter};
pub use error::{Result, SignalingError};
pub use identity::{IdentityProvider, PeerAliasIdentity, StaticIdentity};
pub use join::{JoinOutcome, JoinState, NetworkJoinCoordinator};
pub use listeners::{RelayListeners, RelaySubscription, Relayed};
pub use local::LocalSignaling;
pub use negotiation::{Negotiation, NegotiationContext, Negotiator, PeerLink};
pub use probe::ProbeNegotiator;
pub use session::{NetworkSession, SessionConfig, SessionDeps};
pub use state::{LifecycleBus, LocalNetwork, NetworkState, LIFECYCLE_CAPACITY};
pub use types::{generate_peer_id, ConnectionState, LifecycleEvent, LocalPeer, NetworkTopic};
