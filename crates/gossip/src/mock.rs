//! In-process transport for tests.
//!
//! Every [`MockTransport`] created from one [`MockNetwork`] can reach the
//! others by address. Packets go through channels, streams through
//! `tokio::io::duplex` pipes.

use crate::transport::{Packet, Stream, Transport};
use crate::GossipError;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const PIPE_CAPACITY: usize = 64 * 1024;

struct Endpoint {
    packet_tx: mpsc::Sender<Packet>,
    stream_tx: mpsc::Sender<Stream>,
}

#[derive(Default)]
struct NetworkInner {
    next_port: u16,
    endpoints: HashMap<SocketAddr, Endpoint>,
    blackholed: HashSet<SocketAddr>,
}

#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl std::fmt::Debug for MockNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockNetwork")
            .field("endpoints", &self.inner.lock().endpoints.len())
            .finish()
    }
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport with a fresh loopback address.
    pub fn new_transport(&self) -> MockTransport {
        let (packet_tx, packet_rx) = mpsc::channel(1024);
        let (stream_tx, stream_rx) = mpsc::channel(64);

        let addr = {
            let mut inner = self.inner.lock();
            inner.next_port += 1;
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 20000 + inner.next_port);
            inner.endpoints.insert(addr, Endpoint { packet_tx, stream_tx });
            addr
        };

        MockTransport {
            network: self.clone(),
            addr,
            packet_rx: Mutex::new(Some(packet_rx)),
            stream_rx: Mutex::new(Some(stream_rx)),
        }
    }

    /// Make `addr` unreachable, as if the process died.
    pub fn disconnect(&self, addr: SocketAddr) {
        self.inner.lock().endpoints.remove(&addr);
    }

    /// Make packet writes to `addr` hang forever, like a peer that accepts
    /// connections and never answers.
    pub fn blackhole(&self, addr: SocketAddr) {
        self.inner.lock().blackholed.insert(addr);
    }

    fn is_blackholed(&self, addr: &SocketAddr) -> bool {
        self.inner.lock().blackholed.contains(addr)
    }

    fn packet_tx(&self, addr: &SocketAddr) -> Option<mpsc::Sender<Packet>> {
        self.inner.lock().endpoints.get(addr).map(|e| e.packet_tx.clone())
    }

    fn stream_tx(&self, addr: &SocketAddr) -> Option<mpsc::Sender<Stream>> {
        self.inner.lock().endpoints.get(addr).map(|e| e.stream_tx.clone())
    }
}

pub struct MockTransport {
    network: MockNetwork,
    addr: SocketAddr,
    packet_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    stream_rx: Mutex<Option<mpsc::Receiver<Stream>>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    fn final_advertise_addr(
        &self,
        ip: Option<IpAddr>,
        port: u16,
    ) -> Result<SocketAddr, GossipError> {
        let port = if port == 0 { self.addr.port() } else { port };
        Ok(SocketAddr::new(ip.unwrap_or(self.addr.ip()), port))
    }

    async fn write_to(&self, buf: &[u8], addr: SocketAddr) -> Result<Instant, GossipError> {
        if self.network.is_blackholed(&addr) {
            std::future::pending::<()>().await;
        }
        let tx = self
            .network
            .packet_tx(&addr)
            .ok_or_else(|| GossipError::Transport(format!("no route to {}", addr)))?;
        tx.try_send(Packet {
            buf: buf.to_vec(),
            from: self.addr,
            timestamp: Instant::now(),
        })
        .map_err(|e| GossipError::Transport(format!("send to {} failed: {}", addr, e)))?;
        Ok(Instant::now())
    }

    fn packet_rx(&self) -> Option<mpsc::Receiver<Packet>> {
        self.packet_rx.lock().take()
    }

    async fn dial_timeout(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Stream, GossipError> {
        let tx = self
            .network
            .stream_tx(&addr)
            .ok_or_else(|| GossipError::Transport(format!("connection refused: {}", addr)))?;
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::time::timeout(timeout, tx.send(Box::new(remote)))
            .await
            .map_err(|_| GossipError::Timeout(format!("dial {}", addr)))?
            .map_err(|_| GossipError::Transport(format!("connection refused: {}", addr)))?;
        Ok(Box::new(local))
    }

    fn stream_rx(&self) -> Option<mpsc::Receiver<Stream>> {
        self.stream_rx.lock().take()
    }

    async fn shutdown(&self) -> Result<(), GossipError> {
        self.network.disconnect(self.addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_packet_delivery() {
        let net = MockNetwork::new();
        let a = net.new_transport();
        let b = net.new_transport();
        let mut rx = b.packet_rx().unwrap();
        assert!(b.packet_rx().is_none());

        a.write_to(b"hi", b.addr()).await.unwrap();
        let p = rx.recv().await.unwrap();
        assert_eq!(p.buf, b"hi");
        assert_eq!(p.from, a.addr());
    }

    #[tokio::test]
    async fn test_stream_pipe() {
        let net = MockNetwork::new();
        let a = net.new_transport();
        let b = net.new_transport();
        let mut streams = b.stream_rx().unwrap();

        let mut conn = a.dial_timeout(b.addr(), Duration::from_secs(1)).await.unwrap();
        conn.write_all(b"ping").await.unwrap();

        let mut inbound = streams.recv().await.unwrap();
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_disconnected_unreachable() {
        let net = MockNetwork::new();
        let a = net.new_transport();
        let b = net.new_transport();
        b.shutdown().await.unwrap();
        assert!(a.write_to(b"x", b.addr()).await.is_err());
        assert!(a
            .dial_timeout(b.addr(), Duration::from_millis(50))
            .await
            .is_err());
    }

    #[test]
    fn test_advertise_defaults_to_bound() {
        let net = MockNetwork::new();
        let a = net.new_transport();
        assert_eq!(a.final_advertise_addr(None, 0).unwrap(), a.addr());
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(
            a.final_advertise_addr(Some(ip), 9000).unwrap(),
            SocketAddr::new(ip, 9000)
        );
    }
}
