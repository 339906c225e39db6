mod handlers;

use anyhow::Result;
use axum::{
    routing::{any, get},
    Router,
};
use peerlink_relay::{ws_handler, HubConfig, IdentityResolver, RelayState, SignalingHub};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub struct SignalingServer {
    state: RelayState,
    addr: String,
}

impl SignalingServer {
    pub fn new(addr: String) -> Self {
        Self::with_hub(Arc::new(SignalingHub::default()), addr)
    }

    pub fn with_config(config: HubConfig, addr: String) -> Self {
        Self::with_hub(Arc::new(SignalingHub::new(config)), addr)
    }

    pub fn with_hub(hub: Arc<SignalingHub>, addr: String) -> Self {
        Self {
            state: RelayState { hub },
            addr,
        }
    }

    /// Resolve user ids through an identity service instead of aliasing peer ids
    pub fn with_identity(self, identity: Arc<dyn IdentityResolver>) -> Result<Self> {
        let hub = Arc::try_unwrap(self.state.hub)
            .map_err(|_| anyhow::anyhow!("Signaling hub is already shared"))?;
        Ok(Self::with_hub(Arc::new(hub.with_identity(identity)), self.addr))
    }

    pub fn hub(&self) -> Arc<SignalingHub> {
        self.state.hub.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            // Signaling WebSocket, `?peerID=<id>`
            .route("/", any(ws_handler))
            .route("/api/peers", get(handlers::list_peers))
            .route("/api/stats", get(handlers::relay_stats))
            .with_state(self.state.clone())
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Signaling server listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}
