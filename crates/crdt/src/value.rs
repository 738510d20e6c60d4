//! Value records and observation identifiers.

use crate::CrdtError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Nanoseconds since the Unix epoch, used to order observations.
pub fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

// ---------------------------------------------------------------------------
// TsValue
// ---------------------------------------------------------------------------

/// A timestamped value. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TsValue {
    /// Write time in nanoseconds.
    pub timestamp: i64,
    /// Opaque value bytes.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// MIME type supplied by the writer (may be empty).
    pub content_type: String,
}

impl TsValue {
    /// Create a value stamped with the current time.
    pub fn new(payload: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self::at(now_nanos(), payload, content_type)
    }

    /// Create a value with an explicit timestamp.
    pub fn at(timestamp: i64, payload: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            timestamp,
            payload,
            content_type: content_type.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ObservationId
// ---------------------------------------------------------------------------

/// Globally unique token minted per `add`.
///
/// Format: `<uuid-v4 simple hex>:<unix nanos>`. Never contains `.`, so it
/// can always be recovered as the last segment of a storage key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservationId(String);

impl ObservationId {
    /// Mint a fresh observation id.
    pub fn mint() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}:{}", id, now_nanos()))
    }

    /// Wrap an existing id (e.g. one parsed from a storage key).
    pub fn parse(raw: &str) -> Result<Self, CrdtError> {
        if raw.is_empty() || raw.contains('.') {
            return Err(CrdtError::InvalidObservation(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObservationId({})", self.0)
    }
}

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
