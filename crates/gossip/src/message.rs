//! Wire messages and stream framing.
//!
//! Packets carry one MessagePack-encoded [`Message`]. Streams carry
//! length-prefixed (u32, big endian) MessagePack frames.

use crate::state::Node;
use crate::GossipError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a stream frame; join state can be large.
pub const MAX_FRAME: usize = 32 * 1024 * 1024;

/// Approximate per-message overhead inside a compound packet.
pub const MESSAGE_OVERHEAD: usize = 5;

/// Approximate header cost of a compound packet.
pub const COMPOUND_OVERHEAD: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alive {
    pub incarnation: u32,
    pub node: String,
    pub addr: SocketAddr,
    #[serde(with = "serde_bytes")]
    pub meta: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspect {
    pub incarnation: u32,
    pub node: String,
    pub from: String,
}

/// `from == node` means the node left voluntarily.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dead {
    pub incarnation: u32,
    pub node: String,
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Ping {
        seq_no: u32,
        /// Intended target; a node ignores pings addressed to someone else.
        node: String,
    },
    IndirectPing {
        seq_no: u32,
        target: String,
        target_addr: SocketAddr,
    },
    Ack {
        seq_no: u32,
    },
    Alive(Alive),
    Suspect(Suspect),
    Dead(Dead),
    User(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Several already-encoded messages in one packet.
    Compound(Vec<ByteBuf>),
}

/// Full state exchanged over a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPull {
    pub join: bool,
    pub nodes: Vec<Node>,
    #[serde(with = "serde_bytes")]
    pub user_state: Vec<u8>,
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, GossipError> {
    Ok(rmp_serde::to_vec_named(msg)?)
}

pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, GossipError> {
    Ok(rmp_serde::from_slice(buf)?)
}

/// Pack encoded messages into a single packet.
pub fn compound(parts: Vec<Vec<u8>>) -> Result<Vec<u8>, GossipError> {
    encode(&Message::Compound(
        parts.into_iter().map(ByteBuf::from).collect(),
    ))
}

pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> Result<(), GossipError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = encode(msg)?;
    if buf.len() > MAX_FRAME {
        return Err(GossipError::FrameTooLarge(buf.len()));
    }
    w.write_u32(buf.len() as u32).await?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(r: &mut R) -> Result<T, GossipError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = r.read_u32().await? as usize;
    if len > MAX_FRAME {
        return Err(GossipError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    decode(&buf)
}
