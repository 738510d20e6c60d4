//! Real-network transport for orkv gossip.
//!
//! Provides:
//! - `WebTransport`: implements `orkv_gossip::Transport` with TCP listeners
//!   for streams and an HTTP `POST /fed` endpoint for packets
//! - `private_ip`: picks the address to advertise when bound to a wildcard

pub mod addr;
pub mod error;
pub mod fed;
pub mod transport;

pub use addr::{is_private, private_ip};
pub use error::TransportError;
pub use transport::{WebTransport, WebTransportConfig};
