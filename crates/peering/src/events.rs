//! Membership events and the peer metadata cache.

use crate::config::PeerData;
use orkv_gossip::{EventDelegate, Node};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug)]
pub struct PeerEvents {
    /// Lowercased blocked node names.
    block: Vec<String>,
    /// Member name to advertised metadata.
    peers: RwLock<HashMap<String, PeerData>>,
}

impl PeerEvents {
    pub fn new(block: &[String]) -> Self {
        Self {
            block: block.iter().map(|b| b.to_lowercase()).collect(),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_blocked(&self, node_name: &str) -> bool {
        let name = node_name.to_lowercase();
        self.block.iter().any(|b| *b == name)
    }

    pub fn peer_data(&self, member: &str) -> Option<PeerData> {
        self.peers.read().get(member).cloned()
    }

    pub fn known_peers(&self) -> usize {
        self.peers.read().len()
    }

    /// Parse and cache `node`'s metadata unless it is unreadable or blocked.
    fn remember(&self, node: &Node) -> Option<PeerData> {
        let data: PeerData = match serde_json::from_slice(&node.meta) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!("failed to read metadata of {}: {}", node.name, e);
                return None;
            }
        };
        if self.is_blocked(&data.node_name) {
            tracing::error!("peer is blocked, ignoring: {}", data.node_name);
            return None;
        }

        let mut peers = self.peers.write();
        peers.insert(node.name.clone(), data.clone());
        orkv_metrics::metrics().members.set(peers.len() as i64);
        Some(data)
    }
}

impl EventDelegate for PeerEvents {
    fn notify_join(&self, node: &Node) {
        if self.remember(node).is_some() {
            tracing::info!("node joined: {} ({})", node.name, node.addr);
        }
    }

    fn notify_leave(&self, node: &Node) {
        let mut peers = self.peers.write();
        peers.remove(&node.name);
        orkv_metrics::metrics().members.set(peers.len() as i64);
        tracing::info!("node left: {} ({})", node.name, node.addr);
    }

    fn notify_update(&self, node: &Node) {
        tracing::info!("node updating: {} ({})", node.name, node.addr);
        self.remember(node);
    }
}
