use orkv_gossip::GossipError;
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no bind addresses configured")]
    NoBindAddrs,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("port {0} leaves no room for the packet endpoint")]
    PortOverflow(u16),

    #[error("no private IP address found")]
    NoPrivateIp,

    #[error("failed to list interfaces: {0}")]
    Interfaces(std::io::Error),

    #[error("packet request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("peer {addr} answered {status}")]
    Status { addr: SocketAddr, status: u16 },

    #[error("transport is shut down")]
    Shutdown,
}

impl From<TransportError> for GossipError {
    fn from(e: TransportError) -> Self {
        GossipError::Transport(e.to_string())
    }
}
