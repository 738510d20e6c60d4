//! The transport abstraction the memberlist runs on.
//!
//! Implementations:
//! - `MockTransport` (in [`crate::mock`]) for in-process tests
//! - `WebTransport` in `orkv-net` for real deployment (TCP + HTTP packets)

use crate::GossipError;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// An inbound packet.
#[derive(Debug, Clone)]
pub struct Packet {
    pub buf: Vec<u8>,
    /// Address the sender can be reached at for replies.
    pub from: SocketAddr,
    pub timestamp: Instant,
}

/// A bidirectional byte stream.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

pub type Stream = Box<dyn Conn>;

#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Resolve the address peers should use to reach this node.
    fn final_advertise_addr(
        &self,
        ip: Option<IpAddr>,
        port: u16,
    ) -> Result<SocketAddr, GossipError>;

    /// Send one packet, best effort. Returns when it was handed off.
    async fn write_to(&self, buf: &[u8], addr: SocketAddr) -> Result<Instant, GossipError>;

    /// Take the inbound packet channel. Later calls return `None`.
    fn packet_rx(&self) -> Option<mpsc::Receiver<Packet>>;

    /// Open a stream to `addr`.
    async fn dial_timeout(&self, addr: SocketAddr, timeout: Duration)
        -> Result<Stream, GossipError>;

    /// Take the inbound stream channel. Later calls return `None`.
    fn stream_rx(&self) -> Option<mpsc::Receiver<Stream>>;

    async fn shutdown(&self) -> Result<(), GossipError>;
}
