//! Collision resolution and the OR-Set visibility rule.

use crate::payload::Payload;
use crate::value::{ObservationId, TsValue};
use crate::CrdtError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Rule applied on read when several observations of a key are visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Return every visible observation.
    #[default]
    None,
    /// Return only the observation(s) carrying the largest timestamp.
    LastWriteWins,
}

impl CollisionPolicy {
    /// Resolve a non-empty set of visible observations.
    pub fn resolve(self, values: Payload) -> Payload {
        match self {
            CollisionPolicy::None => values,
            CollisionPolicy::LastWriteWins => {
                let Some(latest) = values.max_timestamp() else {
                    return values;
                };
                values
                    .into_iter()
                    .filter(|(_, v)| v.timestamp == latest)
                    .collect()
            }
        }
    }
}

impl FromStr for CollisionPolicy {
    type Err = CrdtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "lww" | "last_write_wins" => Ok(Self::LastWriteWins),
            other => Err(CrdtError::UnknownPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for CollisionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollisionPolicy::None => f.write_str("none"),
            CollisionPolicy::LastWriteWins => f.write_str("lww"),
        }
    }
}

/// Apply the OR-Set read rule.
///
/// Observations present in `adds` and absent from `removed` stay visible.
/// Returns `None` when the key was never added or every observation is
/// tombstoned, otherwise the visible set after `policy`.
pub fn visible(
    adds: BTreeMap<ObservationId, TsValue>,
    removed: &HashSet<ObservationId>,
    policy: CollisionPolicy,
) -> Option<Payload> {
    if adds.is_empty() {
        return None;
    }

    let live: Payload = adds
        .into_iter()
        .filter(|(id, _)| !removed.contains(id))
        .collect();

    if live.is_empty() {
        return None;
    }

    Some(policy.resolve(live))
}
