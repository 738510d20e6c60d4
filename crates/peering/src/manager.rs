//! The peer manager: membership lifecycle for one node.

use crate::config::PeerConfig;
use crate::delegate::PeerDelegate;
use crate::events::PeerEvents;
use crate::resolve::resolve_list;
use crate::PeeringError;
use crate::PeerData;
use orkv_gossip::{Memberlist, Node, TransmitLimitedQueue, WeakMemberlist};
use orkv_net::{WebTransport, WebTransportConfig};
use orkv_oplog::OpLogHandler;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Retransmit multiplier for replicated ops.
const RETRANSMIT_MULT: usize = 3;
/// How long `leave` waits for the departure to be gossiped.
pub const LEAVE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PeerManager {
    name: String,
    config: PeerConfig,
    members: Memberlist<WebTransport>,
    broadcasts: Arc<TransmitLimitedQueue>,
    events: Arc<PeerEvents>,
}

impl std::fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerManager")
            .field("name", &self.name)
            .field("members", &self.members)
            .finish_non_exhaustive()
    }
}

impl PeerManager {
    /// Bind the transport, start the memberlist and join the configured
    /// peers. Join failures are logged, not returned: the peers may simply
    /// be down.
    pub async fn new(config: PeerConfig, handler: OpLogHandler) -> Result<Self, PeeringError> {
        // Several instances may share a base name, e.g. replicas of one
        // container image.
        let name = format!("{}-{}", config.name, uuid::Uuid::new_v4());

        let mut gossip = config.profile.gossip_config().with_name(name.clone());
        gossip.advertise_addr = config.advertise_address;
        gossip.advertise_port = config.advertise_port;

        let transport = WebTransport::bind(WebTransportConfig {
            bind_addrs: vec![config
                .bind_addr
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))],
            bind_port: config.bind_port,
            // Packet posts share the probe deadline, streams use tcp_timeout.
            request_timeout: gossip.probe_timeout,
            max_packet: gossip.packet_budget,
        })
        .await?;

        let list_cell: Arc<OnceLock<WeakMemberlist<WebTransport>>> = Arc::new(OnceLock::new());
        let cell = list_cell.clone();
        let broadcasts = Arc::new(TransmitLimitedQueue::new(RETRANSMIT_MULT, move || {
            cell.get()
                .and_then(|weak| weak.upgrade())
                .map_or(1, |list| list.num_members())
        }));

        let mut meta = config.federation.clone();
        if meta.node_name.is_empty() {
            meta.node_name = config.name.clone();
        }
        let events = Arc::new(PeerEvents::new(&config.block));
        let delegate = Arc::new(PeerDelegate::new(meta, broadcasts.clone(), handler));

        let members = Memberlist::create(gossip, transport, Some(delegate), Some(events.clone()))?;
        let _ = list_cell.set(members.downgrade());
        tracing::info!("peer-list binding to {}", members.advertise_addr());

        let pm = Self {
            name,
            config,
            members,
            broadcasts,
            events,
        };

        if !pm.config.join.is_empty() {
            tracing::info!("detected peer list, attempting to join");
            match pm.join(&pm.config.join).await {
                Ok(n) => tracing::info!("joined {} of {} peers", n, pm.config.join.len()),
                Err(e) => tracing::error!("failed to join peers: {}", e),
            }
        }
        Ok(pm)
    }

    /// Join the cluster through `peers` (`host:port`). Returns how many
    /// peers were contacted.
    pub async fn join(&self, peers: &[String]) -> Result<usize, PeeringError> {
        let addrs = resolve_list(peers).await?;
        Ok(self.members.join(&addrs).await?)
    }

    /// Announce departure, then tear down the memberlist whether or not the
    /// announcement made it out in time.
    pub async fn leave(&self) -> Result<(), PeeringError> {
        tracing::info!("received leave request");
        let announced = self.members.leave(LEAVE_TIMEOUT).await;
        if let Err(e) = &announced {
            tracing::warn!("leave not fully disseminated: {}", e);
        }
        self.members.shutdown().await?;
        Ok(announced?)
    }

    /// Stop gossiping without announcing departure.
    pub async fn shutdown(&self) -> Result<(), PeeringError> {
        Ok(self.members.shutdown().await?)
    }

    /// Queue that locally applied ops are broadcast through.
    pub fn broadcasts(&self) -> Arc<TransmitLimitedQueue> {
        self.broadcasts.clone()
    }

    pub fn peer_data(&self, member: &str) -> Option<PeerData> {
        self.events.peer_data(member)
    }

    pub fn members(&self) -> Vec<Node> {
        self.members.members()
    }

    pub fn num_members(&self) -> usize {
        self.members.num_members()
    }

    /// Unique member name, base name plus uuid.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn advertise_addr(&self) -> SocketAddr {
        self.members.advertise_addr()
    }
}
