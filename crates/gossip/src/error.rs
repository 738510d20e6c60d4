//! Error types for the gossip layer.

#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    #[error("invalid gossip config: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("node metadata of {0} bytes exceeds limit")]
    MetaTooLarge(usize),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("failed to join any peer: {0}")]
    JoinFailed(String),
}
