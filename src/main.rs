use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peerlink::signaling::{PeerAliasIdentity, SignalingApi};
use peerlink::{
    generate_peer_id, Config, HubConfig, LifecycleBus, LifecycleEvent, NetworkId, NetworkSession,
    NetworkState, NetworkTopic, PeerId, ProbeNegotiator, SessionConfig, SessionDeps,
    SignalingServer, WsSignalingClient,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "peerlink")]
#[command(about = "Signaling relay for bootstrapping peer-to-peer connections", long_about = None)]
struct Cli {
    /// Config file (default: ~/.peerlink/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the signaling server
    Serve {
        #[arg(long)]
        addr: Option<String>,
    },
    /// List the peers of a network
    Peers {
        #[arg(long)]
        network: String,
        /// Signaling server URL
        #[arg(long)]
        server: Option<String>,
    },
    /// Join a network and probe every peer found there
    Join {
        #[arg(long)]
        network: String,
        #[arg(long)]
        server: Option<String>,
        /// Local peer id (random if omitted)
        #[arg(long)]
        peer_id: Option<String>,
        #[arg(long)]
        topic: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("peerlink=info,peerlink_relay=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Serve { addr } => {
            let addr = addr.unwrap_or_else(|| config.server.bind_address.clone());
            let server = SignalingServer::with_config(
                HubConfig {
                    channel_capacity: config.server.channel_capacity,
                    ping_interval: config.server.ping_interval(),
                    ping_timeout: config.server.ping_timeout(),
                },
                addr,
            );

            println!("Starting peerlink signaling server on {}", server.addr());
            println!("Signaling: ws://{}/?peerID=<id>", server.addr());
            println!("Peers: http://{}/api/peers?networkID=<id>", server.addr());

            tokio::select! {
                result = server.run() => result.context("Signaling server failed")?,
                _ = tokio::signal::ctrl_c() => println!("Shutting down"),
            }
        }
        Commands::Peers { network, server } => {
            let server_url = server.unwrap_or_else(|| config.client.server_url.clone());
            let client = WsSignalingClient::connect(
                &server_url,
                generate_peer_id(),
                config.client.request_timeout(),
            )
            .await
            .with_context(|| format!("Failed to connect to {}", server_url))?;

            let peers = client.list(&NetworkId::new(network.clone())).await?;
            if peers.is_empty() {
                println!("No peers in {}", network);
            } else {
                println!("Peers in {} ({}):", network, peers.len());
                for peer in peers {
                    println!("  [{}] {} (user {})", peer.peer_index, peer.peer_id, peer.user_id);
                }
            }
            client.close().await;
        }
        Commands::Join {
            network,
            server,
            peer_id,
            topic,
        } => {
            let server_url = server.unwrap_or_else(|| config.client.server_url.clone());
            let peer_id = peer_id.map(PeerId::new).unwrap_or_else(generate_peer_id);
            let topic = NetworkTopic::new(topic.unwrap_or_else(|| config.client.topic.clone()));

            let client = Arc::new(
                WsSignalingClient::connect(&server_url, peer_id.clone(), config.client.request_timeout())
                    .await
                    .with_context(|| format!("Failed to connect to {}", server_url))?,
            );

            let events = LifecycleBus::new();
            let mut event_rx = events.subscribe();
            let deps = SessionDeps {
                networks: Arc::new(NetworkState::new()),
                events,
                identity: Arc::new(PeerAliasIdentity::new()),
            };
            let session_config = SessionConfig::new(NetworkId::new(network))
                .with_topic(topic)
                .with_poll_interval(config.client.poll_interval());

            let session = NetworkSession::start(client.clone(), Arc::new(ProbeNegotiator), deps, session_config)
                .await
                .context("Failed to join network")?;

            println!("Peer id: {}", peer_id);
            let mut status = tokio::time::interval(config.client.poll_interval());
            let mut last_states = HashMap::new();

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = event_rx.recv() => match event {
                        Ok(event) => print_event(&event),
                        Err(RecvError::Lagged(n)) => println!("(missed {} events)", n),
                        Err(RecvError::Closed) => {}
                    },
                    _ = status.tick() => {
                        let states: HashMap<_, _> = session
                            .peer_states()
                            .into_iter()
                            .map(|(record, state)| (record.peer_id, state))
                            .collect();
                        for (peer, state) in &states {
                            if last_states.get(peer) != Some(state) {
                                println!("{} {}", peer, state);
                            }
                        }
                        for peer in last_states.keys() {
                            if !states.contains_key(peer) {
                                println!("{} gone", peer);
                            }
                        }
                        last_states = states;
                        if client.is_closed() {
                            println!("Signaling connection lost");
                            break;
                        }
                    }
                }
            }

            session.shutdown().await;
            // Drain the PeerLeft emitted by shutdown
            while let Ok(event) = event_rx.try_recv() {
                print_event(&event);
            }
            client.close().await;
        }
    }

    Ok(())
}

fn print_event(event: &LifecycleEvent) {
    match event {
        LifecycleEvent::PeerJoined { topic, peer_index, .. } => println!(
            "{} joined {} ({}) with index {}",
            event.peer_id(),
            event.network_id(),
            topic,
            peer_index
        ),
        LifecycleEvent::PeerLeft { .. } => println!("{} left {}", event.peer_id(), event.network_id()),
    }
}
