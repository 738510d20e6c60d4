//! Peering configuration and advertised node metadata.

use orkv_gossip::GossipConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Metadata every node advertises, JSON encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerData {
    #[serde(rename = "NodeName", default)]
    pub node_name: String,
    #[serde(rename = "APIIngress", default)]
    pub api_ingress: String,
    #[serde(rename = "Token", default)]
    pub token: String,
}

/// Gossip timing profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GossipProfile {
    #[default]
    Wan,
    Lan,
    Local,
}

impl GossipProfile {
    pub fn gossip_config(self) -> GossipConfig {
        match self {
            GossipProfile::Wan => GossipConfig::default_wan(),
            GossipProfile::Lan => GossipConfig::default_lan(),
            GossipProfile::Local => GossipConfig::default_local(),
        }
    }
}

impl FromStr for GossipProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "wan" => Ok(GossipProfile::Wan),
            "lan" => Ok(GossipProfile::Lan),
            "local" => Ok(GossipProfile::Local),
            other => Err(format!("unknown gossip profile: {}", other)),
        }
    }
}

impl fmt::Display for GossipProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GossipProfile::Wan => "wan",
            GossipProfile::Lan => "lan",
            GossipProfile::Local => "local",
        })
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Base node name; a uuid suffix is appended at startup.
    pub name: String,
    /// Address to bind; `None` binds every interface.
    pub bind_addr: Option<IpAddr>,
    pub bind_port: u16,
    pub advertise_address: Option<IpAddr>,
    pub advertise_port: u16,
    /// `host:port` peers to join at startup.
    pub join: Vec<String>,
    /// Node names (case-insensitive) whose metadata is ignored.
    pub block: Vec<String>,
    pub federation: PeerData,
    pub profile: GossipProfile,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: "orkv".to_string(),
            bind_addr: None,
            bind_port: 7946,
            advertise_address: None,
            advertise_port: 0,
            join: Vec::new(),
            block: Vec::new(),
            federation: PeerData::default(),
            profile: GossipProfile::Wan,
        }
    }
}
