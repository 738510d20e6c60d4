//! Storage engine for orkv: the OR-Set persisted in redb.
//!
//! Table `keys` holds `add.<K>.<obs>` → encoded [`TsValue`] and
//! `rem.<K>.<obs>` → empty tombstone markers. Table `oplog` holds the
//! anti-entropy log, keyed by operation id.
//!
//! All operations are synchronous (blocking I/O). The async boundary is
//! at the caller (the op-log workers).
//!
//! [`TsValue`]: orkv_crdt::TsValue

pub mod codec;
pub mod keys;
pub mod registry;
pub mod store;

pub use codec::CodecError;
pub use registry::StoreRegistry;
pub use store::{OpLogCursor, Store, StoreOptions, StoreStats};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("crdt error: {0}")]
    Crdt(#[from] orkv_crdt::CrdtError),

    #[error("malformed key id: {0:?}")]
    InvalidKeyId(String),

    #[error("timed out waiting for database lock on {0:?}")]
    OpenTimeout(std::path::PathBuf),
}
