use axum::{
    extract::{Query, State},
    response::{IntoResponse, Json},
};
use peerlink_relay::{NetworkId, RelayState};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct PeersQuery {
    #[serde(rename = "networkID")]
    pub network_id: Option<String>,
}

/// Peers of a network in join order; empty without a network id
pub async fn list_peers(
    State(state): State<RelayState>,
    Query(query): Query<PeersQuery>,
) -> impl IntoResponse {
    let peers = match query.network_id.filter(|n| !n.is_empty()) {
        Some(network_id) => state.hub.registry().list(&NetworkId::new(network_id)).await,
        None => Vec::new(),
    };
    Json(peers)
}

pub async fn relay_stats(State(state): State<RelayState>) -> impl IntoResponse {
    let registry = state.hub.registry();
    Json(json!({
        "networks": registry.network_count().await,
        "peers": registry.peer_count().await,
    }))
}
