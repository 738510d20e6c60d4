//! orkv-crdt: the observed-remove set (OR-Set) model behind orkv.
//!
//! Every `add` mints a fresh [`ObservationId`]; a `remove` tombstones only
//! the observations visible at that moment. Reads filter tombstoned
//! observations and then apply a [`CollisionPolicy`].
//!
//! The persistent form of this model lives in `orkv-storage`; the
//! in-memory [`OrSet`] is the reference model used by tests.

pub mod or_set;
pub mod payload;
pub mod policy;
pub mod value;

pub use or_set::OrSet;
pub use payload::Payload;
pub use policy::{visible, CollisionPolicy};
pub use value::{now_nanos, ObservationId, TsValue};

#[derive(Debug, thiserror::Error)]
pub enum CrdtError {
    #[error("unknown collision policy: {0:?}")]
    UnknownPolicy(String),

    #[error("invalid observation id: {0:?}")]
    InvalidObservation(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Validate an application-level key.
///
/// Keys may contain any character (including the `.` separator of the
/// storage layout), but must not be empty.
pub fn validate_key(key: &str) -> Result<(), CrdtError> {
    if key.is_empty() {
        return Err(CrdtError::InvalidKey("key must not be empty".into()));
    }
    Ok(())
}
