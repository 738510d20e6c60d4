//! Node states and the membership table.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl NodeState {
    /// Alive and suspect nodes are still members.
    pub fn is_live(self) -> bool {
        matches!(self, NodeState::Alive | NodeState::Suspect)
    }
}

/// A member as seen by the local node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub addr: SocketAddr,
    #[serde(with = "serde_bytes")]
    pub meta: Vec<u8>,
    pub state: NodeState,
    pub incarnation: u32,
}

#[derive(Debug)]
pub(crate) struct NodeRecord {
    pub node: Node,
    pub state_change: Instant,
    pub suspect_deadline: Option<Instant>,
}

impl NodeRecord {
    pub fn new(node: Node, now: Instant) -> Self {
        Self {
            node,
            state_change: now,
            suspect_deadline: None,
        }
    }

    pub fn set_state(&mut self, state: NodeState, now: Instant) {
        if self.node.state != state {
            self.node.state = state;
            self.state_change = now;
        }
    }
}

/// All known nodes plus the round-robin probe order.
#[derive(Debug)]
pub(crate) struct NodeTable {
    local: String,
    nodes: HashMap<String, NodeRecord>,
    probe_order: Vec<String>,
    probe_index: usize,
}

impl NodeTable {
    pub fn new(local: String) -> Self {
        Self {
            local,
            nodes: HashMap::new(),
            probe_order: Vec::new(),
            probe_index: 0,
        }
    }

    pub fn get(&self, name: &str) -> Option<&NodeRecord> {
        self.nodes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut NodeRecord> {
        self.nodes.get_mut(name)
    }

    /// Insert a new node at a random position in the probe order.
    pub fn insert(&mut self, record: NodeRecord) {
        let name = record.node.name.clone();
        if self.nodes.insert(name.clone(), record).is_none() {
            let at = rand::thread_rng().gen_range(0..=self.probe_order.len());
            self.probe_order.insert(at, name);
        }
    }

    pub fn live_count(&self) -> usize {
        self.nodes.values().filter(|r| r.node.state.is_live()).count()
    }

    pub fn members(&self) -> Vec<Node> {
        self.nodes
            .values()
            .filter(|r| r.node.state.is_live())
            .map(|r| r.node.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<Node> {
        self.nodes.values().map(|r| r.node.clone()).collect()
    }

    /// Next remote, non-dead node in round-robin order. Reshuffles after
    /// each full pass.
    pub fn next_probe_target(&mut self) -> Option<Node> {
        for _ in 0..=self.probe_order.len() {
            if self.probe_index >= self.probe_order.len() {
                self.probe_order.shuffle(&mut rand::thread_rng());
                self.probe_index = 0;
                if self.probe_order.is_empty() {
                    return None;
                }
            }
            let name = &self.probe_order[self.probe_index];
            self.probe_index += 1;

            if *name == self.local {
                continue;
            }
            if let Some(rec) = self.nodes.get(name) {
                if rec.node.state.is_live() {
                    return Some(rec.node.clone());
                }
            }
        }
        None
    }

    /// Up to `k` random remote nodes satisfying `filter`.
    pub fn random_nodes(&self, k: usize, filter: impl Fn(&Node) -> bool) -> Vec<Node> {
        let candidates: Vec<&Node> = self
            .nodes
            .values()
            .map(|r| &r.node)
            .filter(|n| n.name != self.local && filter(n))
            .collect();
        candidates
            .choose_multiple(&mut rand::thread_rng(), k)
            .map(|n| (*n).clone())
            .collect()
    }

    /// Gossip targets: live nodes plus nodes dead for less than `dead_window`.
    pub fn gossip_targets(&self, k: usize, now: Instant, dead_window: Duration) -> Vec<Node> {
        let candidates: Vec<&NodeRecord> = self
            .nodes
            .values()
            .filter(|r| r.node.name != self.local)
            .filter(|r| {
                r.node.state.is_live() || now.duration_since(r.state_change) < dead_window
            })
            .collect();
        candidates
            .choose_multiple(&mut rand::thread_rng(), k)
            .map(|r| r.node.clone())
            .collect()
    }

    /// Suspects whose refutation window has passed.
    pub fn expired_suspects(&self, now: Instant) -> Vec<(String, u32)> {
        self.nodes
            .values()
            .filter(|r| r.node.state == NodeState::Suspect)
            .filter(|r| r.suspect_deadline.is_some_and(|d| d <= now))
            .map(|r| (r.node.name.clone(), r.node.incarnation))
            .collect()
    }

    /// Drop dead or left nodes older than `after`. Returns their names.
    pub fn reap(&mut self, now: Instant, after: Duration) -> Vec<String> {
        let gone: Vec<String> = self
            .nodes
            .values()
            .filter(|r| r.node.name != self.local)
            .filter(|r| !r.node.state.is_live() && now.duration_since(r.state_change) >= after)
            .map(|r| r.node.name.clone())
            .collect();
        for name in &gone {
            self.nodes.remove(name);
        }
        self.probe_order.retain(|n| self.nodes.contains_key(n));
        if self.probe_index > self.probe_order.len() {
            self.probe_index = self.probe_order.len();
        }
        gone
    }
}
