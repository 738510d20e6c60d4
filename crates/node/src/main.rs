//! orkv-node: entry point for one orkv node.
//!
//! Loads the YAML config, starts the server (store, op-log pipeline and
//! gossip peering), serves the REST API and, if configured, Prometheus
//! metrics. Runs until Ctrl+C, then leaves the cluster and shuts down.
//!
//! Usage: `orkv-node [config.yaml] [host:port ...]`. Extra arguments are
//! peers to join in addition to `peering.join`.

use orkv_config::{ConfigError, NodeConfig};
use orkv_crdt::CollisionPolicy;
use orkv_oplog::HandlerConfig;
use orkv_peering::{GossipProfile, PeerConfig, PeerData};
use orkv_server::{Server, ServerConfig};
use orkv_storage::{StoreOptions, StoreRegistry};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

fn server_config(config: &NodeConfig) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let collision: CollisionPolicy = config.server.collision.parse()?;
    let profile: GossipProfile = config.peering.profile.parse()?;
    let peering = &config.peering;

    Ok(ServerConfig {
        db_path: config.server.db_path.clone(),
        collision,
        store: StoreOptions::default(),
        oplog: HandlerConfig {
            workers: config.oplog.workers,
            commit_buffer: config.oplog.commit_buffer,
            replica_buffer: config.oplog.replica_buffer,
            drain_on_stop: config.oplog.drain_on_stop,
        },
        peering: PeerConfig {
            name: peering.name.clone(),
            bind_addr: peering.bind_addr,
            bind_port: peering.bind_port,
            advertise_address: peering.advertise_address,
            advertise_port: peering.advertise_port,
            join: peering.join.clone(),
            block: peering.block.clone(),
            federation: PeerData {
                node_name: peering.federation.node_name.clone(),
                api_ingress: peering.federation.api_ingress.clone(),
                token: peering.federation.token.clone(),
            },
            profile,
        },
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    orkv_metrics::init_tracing();
    tracing::info!("orkv {} starting", env!("CARGO_PKG_VERSION"));

    // First CLI arg is the YAML config path, the rest are peers to join
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "orkv.yaml".to_string());

    let mut config = match orkv_config::load_from_file(std::path::Path::new(&config_path)) {
        Ok(config) => config,
        Err(ConfigError::Io(e)) => {
            tracing::warn!(
                "failed to read config from {}: {}, using defaults",
                config_path,
                e
            );
            NodeConfig::default()
        }
        Err(e) => return Err(e.into()),
    };
    config.peering.join.extend(args);

    let registry = Arc::new(StoreRegistry::new());
    let server = Arc::new(Server::start(server_config(&config)?, registry).await?);
    tracing::info!(
        "node {} gossiping on {}",
        server.peers().name(),
        server.peers().advertise_addr()
    );

    // Spawn metrics HTTP server if configured
    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr = std::net::SocketAddr::from(([0, 0, 0, 0], metrics_port));
        tokio::spawn(async move {
            if let Err(e) = orkv_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let listener = TcpListener::bind(config.api.bind).await?;
    let mut api = tokio::spawn(orkv_api::serve(listener, server.clone(), stop_rx));

    tokio::select! {
        result = &mut api => {
            match result {
                Ok(Ok(())) => tracing::warn!("api server exited"),
                Ok(Err(e)) => tracing::error!("api server failed: {}", e),
                Err(e) => tracing::error!("api task panicked: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
        }
    }

    stop_tx.send_replace(true);
    server.shutdown().await?;
    Ok(())
}
