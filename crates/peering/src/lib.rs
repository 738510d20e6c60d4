//! orkv-peering: ties the op-log pipeline to the gossip cluster.
//!
//! [`PeerManager`] owns the memberlist running on a `WebTransport`, the
//! broadcast queue local ops are replicated through, and the metadata cache
//! of known peers.

pub mod config;
pub mod delegate;
pub mod events;
pub mod manager;
pub mod resolve;

pub use config::{GossipProfile, PeerConfig, PeerData};
pub use delegate::PeerDelegate;
pub use events::PeerEvents;
pub use manager::PeerManager;
pub use resolve::resolve_list;

use orkv_gossip::GossipError;
use orkv_net::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum PeeringError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("gossip error: {0}")]
    Gossip(#[from] GossipError),

    #[error("peer address {0:?} is not host:port")]
    BadPeerAddress(String),

    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },
}
