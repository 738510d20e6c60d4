//! orkv-gossip: SWIM-style cluster membership.
//!
//! Nodes detect failures with direct and indirect pings, spread state
//! changes by piggybacking them on periodic gossip packets, and reconcile
//! full state over streams on join and periodically (push-pull).
//!
//! The network is abstracted behind [`Transport`] so the protocol can run
//! over real sockets (`orkv-net`) or the in-process [`mock::MockNetwork`].

pub mod config;
pub mod delegate;
pub mod error;
pub mod memberlist;
pub mod message;
pub mod mock;
pub mod queue;
pub mod state;
pub mod transport;

pub use config::GossipConfig;
pub use delegate::{Delegate, EventDelegate};
pub use error::GossipError;
pub use memberlist::{Memberlist, WeakMemberlist};
pub use queue::{Broadcast, TransmitLimitedQueue};
pub use state::{Node, NodeState};
pub use transport::{Packet, Stream, Transport};
