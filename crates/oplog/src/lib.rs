//! orkv-oplog: the asynchronous path every mutation takes.
//!
//! Local writes and replicated records are queued as [`OpLog`] records,
//! applied to the store by worker tasks, appended to the anti-entropy log
//! and handed to a [`Replicator`] when they originated locally.

pub mod handler;
pub mod record;
pub mod replicator;

pub use handler::{HandlerConfig, OpLogHandler};
pub use record::{OpKind, OpLog};
pub use replicator::{OpBroadcast, Replicator};

use orkv_crdt::CrdtError;
use orkv_storage::{CodecError, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum OpLogError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid operation: {0}")]
    Crdt(#[from] CrdtError),

    #[error("handler already started")]
    AlreadyStarted,

    #[error("handler not started")]
    NotStarted,

    #[error("handler stopped")]
    Stopped,

    #[error("worker failed: {0}")]
    Worker(String),
}
