//! Gossip timing and sizing profiles.

use crate::GossipError;
use std::net::IpAddr;
use std::time::Duration;

/// Largest node metadata blob accepted from a delegate.
pub const META_MAX_SIZE: usize = 512;

#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Unique node name within the cluster.
    pub name: String,
    /// Address to advertise; `None` lets the transport choose.
    pub advertise_addr: Option<IpAddr>,
    /// Port to advertise; 0 uses the transport's bound port.
    pub advertise_port: u16,

    /// Interval between failure-detection probes.
    pub probe_interval: Duration,
    /// How long to wait for a direct ack before asking peers.
    pub probe_timeout: Duration,
    /// Number of peers asked to ping on our behalf.
    pub indirect_checks: usize,

    /// Interval between gossip rounds.
    pub gossip_interval: Duration,
    /// Peers contacted per gossip round.
    pub gossip_nodes: usize,
    /// Dead nodes keep receiving gossip, and stay in the table, this long.
    pub gossip_to_the_dead_time: Duration,

    /// Suspicion timeout multiplier (scaled by log10 of the cluster size).
    pub suspicion_mult: u32,
    /// Retransmit multiplier for queued broadcasts.
    pub retransmit_mult: usize,

    /// Interval between full state syncs; zero disables them.
    pub push_pull_interval: Duration,
    /// Deadline for a stream exchange, dial included.
    pub tcp_timeout: Duration,

    /// Byte budget for one gossip packet.
    pub packet_budget: usize,
}

impl GossipConfig {
    /// Timings for nodes spread over a wide-area network.
    pub fn default_wan() -> Self {
        Self {
            name: String::new(),
            advertise_addr: None,
            advertise_port: 0,
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            indirect_checks: 3,
            gossip_interval: Duration::from_millis(500),
            gossip_nodes: 4,
            gossip_to_the_dead_time: Duration::from_secs(60),
            suspicion_mult: 6,
            retransmit_mult: 3,
            push_pull_interval: Duration::from_secs(60),
            tcp_timeout: Duration::from_secs(30),
            packet_budget: 64 * 1024,
        }
    }

    pub fn default_lan() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            gossip_to_the_dead_time: Duration::from_secs(30),
            suspicion_mult: 4,
            push_pull_interval: Duration::from_secs(30),
            tcp_timeout: Duration::from_secs(10),
            ..Self::default_wan()
        }
    }

    /// Fast timings for a single host or tests.
    pub fn default_local() -> Self {
        Self {
            probe_interval: Duration::from_millis(500),
            probe_timeout: Duration::from_millis(200),
            gossip_interval: Duration::from_millis(100),
            gossip_to_the_dead_time: Duration::from_secs(15),
            suspicion_mult: 3,
            push_pull_interval: Duration::from_secs(15),
            tcp_timeout: Duration::from_secs(2),
            ..Self::default_lan()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn validate(&self) -> Result<(), GossipError> {
        if self.name.is_empty() {
            return Err(GossipError::Config("node name must not be empty".into()));
        }
        if self.probe_timeout >= self.probe_interval {
            return Err(GossipError::Config(
                "probe_timeout must be shorter than probe_interval".into(),
            ));
        }
        if self.gossip_interval.is_zero() || self.probe_interval.is_zero() {
            return Err(GossipError::Config("intervals must be non-zero".into()));
        }
        if self.packet_budget < 1024 {
            return Err(GossipError::Config("packet_budget must be at least 1 KiB".into()));
        }
        if self.retransmit_mult == 0 {
            return Err(GossipError::Config("retransmit_mult must be > 0".into()));
        }
        Ok(())
    }

    /// How long a suspect has to refute before being declared dead.
    pub fn suspicion_timeout(&self, num_nodes: usize) -> Duration {
        let scale = (num_nodes.max(1) as f64).log10().max(1.0);
        self.probe_interval
            .mul_f64(f64::from(self.suspicion_mult) * scale)
    }
}
