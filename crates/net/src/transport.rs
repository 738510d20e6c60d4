//! `WebTransport`: gossip streams over raw TCP, packets over HTTP.
//!
//! For every bind address the transport opens a TCP listener on the gossip
//! port and an HTTP server on gossip port + 1. Outbound packets are posted to
//! the peer's packet endpoint with reqwest.

use crate::fed;
use crate::TransportError;
use orkv_gossip::{GossipError, Packet, Stream, Transport};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const PACKET_BUFFER: usize = 1024;
const STREAM_BUFFER: usize = 64;
/// Attempts at finding a free port pair when binding to port 0.
const EPHEMERAL_ATTEMPTS: usize = 16;

#[derive(Debug, Clone)]
pub struct WebTransportConfig {
    pub bind_addrs: Vec<IpAddr>,
    /// Gossip port; the packet endpoint uses the next one. 0 picks a free
    /// port.
    pub bind_port: u16,
    /// Timeout for outbound packet posts. Stream dials take their own
    /// timeout per call.
    pub request_timeout: Duration,
    /// Largest inbound packet, before base64.
    pub max_packet: usize,
}

impl Default for WebTransportConfig {
    fn default() -> Self {
        Self {
            bind_addrs: vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
            bind_port: 7946,
            request_timeout: Duration::from_secs(10),
            max_packet: 64 * 1024,
        }
    }
}

pub struct WebTransport {
    config: WebTransportConfig,
    /// Bound stream address per bind address, in config order.
    stream_addrs: Vec<SocketAddr>,
    client: reqwest::Client,
    packet_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    stream_rx: Mutex<Option<mpsc::Receiver<Stream>>>,
    shutdown: Arc<AtomicBool>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WebTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebTransport")
            .field("stream_addrs", &self.stream_addrs)
            .field("shutdown", &self.shutdown.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// One bind address' pair of listeners.
struct Bound {
    stream: TcpListener,
    packet: TcpListener,
}

impl WebTransport {
    /// Bind all listeners and start accepting. Must be called inside a tokio
    /// runtime.
    pub async fn bind(config: WebTransportConfig) -> Result<Self, TransportError> {
        if config.bind_addrs.is_empty() {
            return Err(TransportError::NoBindAddrs);
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        let bound = if config.bind_port == 0 {
            bind_ephemeral(&config.bind_addrs).await?
        } else {
            bind_all(&config.bind_addrs, config.bind_port).await?
        };

        let (packet_tx, packet_rx) = mpsc::channel(PACKET_BUFFER);
        let (stream_tx, stream_rx) = mpsc::channel(STREAM_BUFFER);
        let (stop, _) = watch::channel(false);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut stream_addrs = Vec::with_capacity(bound.len());
        let mut tasks = Vec::with_capacity(bound.len() * 2);
        for b in bound {
            let stream_addr = b.stream.local_addr().map_err(|source| TransportError::Bind {
                addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                source,
            })?;
            tracing::info!(
                "gossip transport listening on {} (packets on port {})",
                stream_addr,
                stream_addr.port() + 1
            );
            stream_addrs.push(stream_addr);

            tasks.push(tokio::spawn(accept_streams(
                b.stream,
                stream_tx.clone(),
                shutdown.clone(),
                stop.subscribe(),
            )));
            tasks.push(tokio::spawn(fed::serve(
                b.packet,
                packet_tx.clone(),
                fed::body_limit(config.max_packet),
                shutdown.clone(),
                stop.subscribe(),
            )));
        }

        Ok(Self {
            config,
            stream_addrs,
            client,
            packet_rx: Mutex::new(Some(packet_rx)),
            stream_rx: Mutex::new(Some(stream_rx)),
            shutdown,
            stop,
            tasks: Mutex::new(tasks),
        })
    }

    /// Port the stream listeners are bound to.
    pub fn bound_port(&self) -> u16 {
        self.stream_addrs.first().map_or(0, |a| a.port())
    }

    pub fn stream_addrs(&self) -> &[SocketAddr] {
        &self.stream_addrs
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    async fn post(&self, buf: &[u8], addr: SocketAddr) -> Result<(), TransportError> {
        if self.is_shutdown() {
            return Err(TransportError::Shutdown);
        }
        let port = addr
            .port()
            .checked_add(1)
            .ok_or(TransportError::PortOverflow(addr.port()))?;
        let url = format!("http://{}{}", SocketAddr::new(addr.ip(), port), fed::FED_PATH);

        let resp = self
            .client
            .post(url)
            .header(fed::REPLY_HEADER, self.bound_port().to_string())
            .body(fed::encode_body(buf))
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(TransportError::Status {
                addr,
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}

async fn bind_pair(ip: IpAddr, port: u16) -> Result<Bound, TransportError> {
    let stream_addr = SocketAddr::new(ip, port);
    let stream = TcpListener::bind(stream_addr)
        .await
        .map_err(|source| TransportError::Bind {
            addr: stream_addr,
            source,
        })?;
    let port = stream
        .local_addr()
        .map_err(|source| TransportError::Bind {
            addr: stream_addr,
            source,
        })?
        .port();

    let packet_port = port.checked_add(1).ok_or(TransportError::PortOverflow(port))?;
    let packet_addr = SocketAddr::new(ip, packet_port);
    let packet = TcpListener::bind(packet_addr)
        .await
        .map_err(|source| TransportError::Bind {
            addr: packet_addr,
            source,
        })?;
    Ok(Bound { stream, packet })
}

async fn bind_all(ips: &[IpAddr], port: u16) -> Result<Vec<Bound>, TransportError> {
    let mut out = Vec::with_capacity(ips.len());
    for ip in ips {
        out.push(bind_pair(*ip, port).await?);
    }
    Ok(out)
}

/// Let the OS pick the first stream port, reuse it for the rest, and retry
/// when port + 1 turns out to be taken.
async fn bind_ephemeral(ips: &[IpAddr]) -> Result<Vec<Bound>, TransportError> {
    let mut last_err = None;
    for _ in 0..EPHEMERAL_ATTEMPTS {
        let first = match bind_pair(ips[0], 0).await {
            Ok(b) => b,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };
        let port = first
            .stream
            .local_addr()
            .map(|a| a.port())
            .unwrap_or_default();
        match bind_all(&ips[1..], port).await {
            Ok(mut rest) => {
                rest.insert(0, first);
                return Ok(rest);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or(TransportError::NoBindAddrs))
}

async fn accept_streams(
    listener: TcpListener,
    streams: mpsc::Sender<Stream>,
    shutdown: Arc<AtomicBool>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((conn, remote)) => {
                if let Err(e) = conn.set_nodelay(true) {
                    tracing::debug!("set_nodelay for {} failed: {}", remote, e);
                }
                orkv_metrics::metrics().streams_accepted.inc();
                if streams.send(Box::new(conn)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                tracing::warn!("stream accept failed: {}", e);
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for WebTransport {
    fn final_advertise_addr(&self, ip: Option<IpAddr>, port: u16) -> Result<SocketAddr, GossipError> {
        let ip = match ip {
            Some(ip) => ip,
            None => {
                let first = self.config.bind_addrs[0];
                if first.is_unspecified() {
                    crate::addr::private_ip()?
                } else {
                    self.stream_addrs[0].ip()
                }
            }
        };
        let port = if port == 0 { self.bound_port() } else { port };
        Ok(SocketAddr::new(ip, port))
    }

    async fn write_to(&self, buf: &[u8], addr: SocketAddr) -> Result<Instant, GossipError> {
        let m = orkv_metrics::metrics();
        match self.post(buf, addr).await {
            Ok(()) => {
                m.packets_sent.inc();
                Ok(Instant::now())
            }
            Err(e) => {
                m.packets_failed.inc();
                Err(e.into())
            }
        }
    }

    fn packet_rx(&self) -> Option<mpsc::Receiver<Packet>> {
        self.packet_rx.lock().take()
    }

    async fn dial_timeout(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Stream, GossipError> {
        if self.is_shutdown() {
            return Err(TransportError::Shutdown.into());
        }
        let conn = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| GossipError::Timeout(format!("dial {}", addr)))??;
        conn.set_nodelay(true)?;
        Ok(Box::new(conn))
    }

    fn stream_rx(&self) -> Option<mpsc::Receiver<Stream>> {
        self.stream_rx.lock().take()
    }

    async fn shutdown(&self) -> Result<(), GossipError> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("transport task panicked: {}", e);
            }
        }
        tracing::info!("gossip transport on port {} shut down", self.bound_port());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn loopback() -> WebTransportConfig {
        WebTransportConfig {
            bind_addrs: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            bind_port: 0,
            request_timeout: Duration::from_secs(2),
            max_packet: 64 * 1024,
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let t = WebTransport::bind(loopback()).await.unwrap();
        assert_ne!(t.bound_port(), 0);

        let addr = t.final_advertise_addr(None, 0).unwrap();
        assert_eq!(addr, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), t.bound_port()));

        let explicit: IpAddr = "10.9.8.7".parse().unwrap();
        let addr = t.final_advertise_addr(Some(explicit), 9000).unwrap();
        assert_eq!(addr, SocketAddr::new(explicit, 9000));
        t.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_bind_addrs() {
        let config = WebTransportConfig {
            bind_addrs: Vec::new(),
            ..loopback()
        };
        assert!(matches!(
            WebTransport::bind(config).await,
            Err(TransportError::NoBindAddrs)
        ));
    }

    #[tokio::test]
    async fn test_packet_round_trip() {
        let a = WebTransport::bind(loopback()).await.unwrap();
        let b = WebTransport::bind(loopback()).await.unwrap();
        let mut rx = b.packet_rx().unwrap();
        assert!(b.packet_rx().is_none());

        let b_addr = b.final_advertise_addr(None, 0).unwrap();
        a.write_to(b"ping", b_addr).await.unwrap();

        let packet = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.buf, b"ping");
        assert_eq!(packet.from, a.final_advertise_addr(None, 0).unwrap());

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let a = WebTransport::bind(loopback()).await.unwrap();
        let b = WebTransport::bind(loopback()).await.unwrap();
        let mut incoming = b.stream_rx().unwrap();

        let b_addr = b.final_advertise_addr(None, 0).unwrap();
        let mut out = a.dial_timeout(b_addr, Duration::from_secs(2)).await.unwrap();
        out.write_all(b"hello").await.unwrap();
        out.flush().await.unwrap();

        let mut inbound = incoming.recv().await.unwrap();
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_after_shutdown_fails() {
        let a = WebTransport::bind(loopback()).await.unwrap();
        let b = WebTransport::bind(loopback()).await.unwrap();
        let b_addr = b.final_advertise_addr(None, 0).unwrap();

        a.shutdown().await.unwrap();
        a.shutdown().await.unwrap();
        assert!(a.is_shutdown());
        assert!(a.write_to(b"x", b_addr).await.is_err());
        assert!(a.dial_timeout(b_addr, Duration::from_millis(200)).await.is_err());
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_to_dead_peer_fails() {
        let a = WebTransport::bind(loopback()).await.unwrap();
        let b = WebTransport::bind(loopback()).await.unwrap();
        let b_addr = b.final_advertise_addr(None, 0).unwrap();
        b.shutdown().await.unwrap();

        assert!(a.write_to(b"x", b_addr).await.is_err());
        a.shutdown().await.unwrap();
    }
}
