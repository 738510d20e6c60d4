//! orkv-server: one embeddable orkv node.
//!
//! Wires a store from the registry, the op-log pipeline and the peer
//! manager together and exposes the core API: `add`, `remove`, `load`,
//! `join` and `leave`. Writes are asynchronous: they return once queued,
//! and `load` reads whatever the store holds at that moment.

use orkv_crdt::{CollisionPolicy, Payload};
use orkv_oplog::{HandlerConfig, OpLogError, OpLogHandler, Replicator};
use orkv_peering::{PeerConfig, PeerManager, PeeringError};
use orkv_storage::{StorageError, Store, StoreOptions, StoreRegistry, StoreStats};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("op-log error: {0}")]
    OpLog(#[from] OpLogError),

    #[error("peering error: {0}")]
    Peering(#[from] PeeringError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub collision: CollisionPolicy,
    pub store: StoreOptions,
    pub oplog: HandlerConfig,
    pub peering: PeerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("orkv.redb"),
            collision: CollisionPolicy::LastWriteWins,
            store: StoreOptions::default(),
            oplog: HandlerConfig::default(),
            peering: PeerConfig::default(),
        }
    }
}

pub struct Server {
    config: ServerConfig,
    registry: Arc<StoreRegistry>,
    store: Arc<Store>,
    handler: OpLogHandler,
    peers: PeerManager,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("db_path", &self.config.db_path)
            .field("collision", &self.config.collision)
            .field("peers", &self.peers)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Open the store, start peering (joining any configured peers) and
    /// start the op-log workers. Fails if the store cannot be opened or
    /// the transport cannot bind.
    pub async fn start(
        config: ServerConfig,
        registry: Arc<StoreRegistry>,
    ) -> Result<Self, ServerError> {
        let store = {
            let registry = registry.clone();
            let path = config.db_path.clone();
            let options = config.store.clone();
            tokio::task::spawn_blocking(move || registry.open(&path, &options)).await??
        };

        let handler = OpLogHandler::new(config.oplog.clone());
        let peers = match PeerManager::new(config.peering.clone(), handler.clone()).await {
            Ok(peers) => peers,
            Err(e) => {
                registry.close(&config.db_path);
                return Err(e.into());
            }
        };
        let replicator = Replicator::gossip(peers.broadcasts());
        if let Err(e) = handler.start(store.clone(), Some(replicator)) {
            let _ = peers.shutdown().await;
            registry.close(&config.db_path);
            return Err(e.into());
        }

        tracing::info!(
            "server {} started on {} (collision policy {})",
            peers.name(),
            config.db_path.display(),
            config.collision
        );
        Ok(Self {
            config,
            registry,
            store,
            handler,
            peers,
        })
    }

    // -----------------------------------------------------------------------
    // Core API
    // -----------------------------------------------------------------------

    /// Queue a new observation of `key`. Waits only for queue space.
    pub async fn add(
        &self,
        key: &str,
        value: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ServerError> {
        Ok(self.handler.add(key, value, content_type).await?)
    }

    /// Queue removal of every observation of `key` visible when it applies.
    pub async fn remove(&self, key: &str) -> Result<(), ServerError> {
        Ok(self.handler.remove(key).await?)
    }

    /// Visible values of `key` under the configured collision policy, or
    /// `None` if there are none.
    pub async fn load(&self, key: &str) -> Result<Option<Payload>, ServerError> {
        let policy = self.config.collision;
        let m = orkv_metrics::metrics();
        m.loads.inc();
        let _timer = orkv_metrics::start_load_timer(&policy.to_string());

        let store = self.store.clone();
        let key = key.to_string();
        let payload = tokio::task::spawn_blocking(move || store.load(&key, policy)).await??;
        Ok(payload)
    }

    /// Join the cluster through `peers` (`host:port`).
    pub async fn join(&self, peers: &[String]) -> Result<usize, ServerError> {
        Ok(self.peers.join(peers).await?)
    }

    /// Leave the cluster. Gossip stops even if the departure could not be
    /// announced in time.
    pub async fn leave(&self) -> Result<(), ServerError> {
        Ok(self.peers.leave().await?)
    }

    /// Leave the cluster, stop the workers and release the store.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        if let Err(e) = self.peers.leave().await {
            tracing::error!("leave failed during shutdown: {}", e);
        }
        self.handler.stop();
        self.handler.wait().await;
        self.registry.close(&self.config.db_path);
        tracing::info!("server {} stopped", self.peers.name());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn peers(&self) -> &PeerManager {
        &self.peers
    }

    pub fn collision(&self) -> CollisionPolicy {
        self.config.collision
    }

    pub async fn stats(&self) -> Result<StoreStats, ServerError> {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || store.stats()).await??)
    }
}
