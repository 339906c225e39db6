//! Wire types for the signaling channel
//!
//! Frames are JSON text messages tagged by `type`. Field names follow the
//! camel-cased ids used by browser clients (`networkID`, `peerID`, ...).

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First eight characters, for log lines
            pub fn short(&self) -> &str {
                let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
                &self.0[..end]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Logical network a group of peers joins
    NetworkId
);
string_id!(
    /// Identity of one transport connection endpoint
    PeerId
);
string_id!(
    /// Identity of the user behind a peer
    UserId
);

/// Server-assigned id of an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One joined peer as listed by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    #[serde(rename = "peerID")]
    pub peer_id: PeerId,
    #[serde(rename = "peerIndex")]
    pub peer_index: u64,
    #[serde(rename = "userID")]
    pub user_id: UserId,
}

/// Addressed signaling payload, forwarded once and never stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "networkID")]
    pub network_id: NetworkId,
    #[serde(rename = "fromPeerID")]
    pub from_peer_id: PeerId,
    #[serde(rename = "targetPeerID")]
    pub target_peer_id: PeerId,
    pub message: serde_json::Value,
}

/// Client -> server requests
///
/// Required ids are optional at the wire level so that a missing field is
/// reported as `invalidRequest` instead of a parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientRequest {
    Join {
        id: u64,
        #[serde(rename = "networkID", default, skip_serializing_if = "Option::is_none")]
        network_id: Option<NetworkId>,
    },
    Relay {
        id: u64,
        #[serde(rename = "networkID", default, skip_serializing_if = "Option::is_none")]
        network_id: Option<NetworkId>,
        #[serde(rename = "targetPeerID", default, skip_serializing_if = "Option::is_none")]
        target_peer_id: Option<PeerId>,
        /// Accepted for compatibility, always overwritten by the connection identity
        #[serde(rename = "fromPeerID", default, skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<PeerId>,
        #[serde(default)]
        message: serde_json::Value,
    },
    List {
        id: u64,
        #[serde(rename = "networkID", default, skip_serializing_if = "Option::is_none")]
        network_id: Option<NetworkId>,
    },
}

impl ClientRequest {
    pub fn id(&self) -> u64 {
        match self {
            ClientRequest::Join { id, .. } => *id,
            ClientRequest::Relay { id, .. } => *id,
            ClientRequest::List { id, .. } => *id,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            ClientRequest::Join { .. } => "join",
            ClientRequest::Relay { .. } => "relay",
            ClientRequest::List { .. } => "list",
        }
    }

    pub fn join(id: u64, network_id: &NetworkId) -> Self {
        ClientRequest::Join {
            id,
            network_id: Some(network_id.clone()),
        }
    }

    pub fn relay(
        id: u64,
        network_id: &NetworkId,
        target_peer_id: &PeerId,
        message: serde_json::Value,
    ) -> Self {
        ClientRequest::Relay {
            id,
            network_id: Some(network_id.clone()),
            target_peer_id: Some(target_peer_id.clone()),
            from_peer_id: None,
            message,
        }
    }

    pub fn list(id: u64, network_id: &NetworkId) -> Self {
        ClientRequest::List {
            id,
            network_id: Some(network_id.clone()),
        }
    }
}

/// Error codes carried by `error` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    InvalidRequest,
    BadFrame,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::InvalidRequest => write!(f, "invalidRequest"),
            ErrorCode::BadFrame => write!(f, "badFrame"),
        }
    }
}

/// Server -> client frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Joined {
        id: u64,
        index: u64,
    },
    Ack {
        id: u64,
        message: SignalMessage,
    },
    Peers {
        id: u64,
        peers: Vec<PeerRecord>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        code: ErrorCode,
        message: String,
    },
    /// Push: a message addressed to this connection's peer
    Relayed {
        message: SignalMessage,
    },
}

impl ServerMessage {
    /// Request id this frame answers, `None` for pushes
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ServerMessage::Joined { id, .. } => Some(*id),
            ServerMessage::Ack { id, .. } => Some(*id),
            ServerMessage::Peers { id, .. } => Some(*id),
            ServerMessage::Error { id, .. } => *id,
            ServerMessage::Relayed { .. } => None,
        }
    }

    pub fn error(id: Option<u64>, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            id,
            code,
            message: message.into(),
        }
    }
}
