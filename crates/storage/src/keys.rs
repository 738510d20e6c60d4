//! Storage key layout.
//!
//! `add.<K>.<obs>` and `rem.<K>.<obs>`. `K` may itself contain `.`; the
//! observation id never does, so it is always the last segment.

use crate::StorageError;
use orkv_crdt::ObservationId;

pub const ADD: &str = "add";
pub const REM: &str = "rem";
pub const SEP: char = '.';

pub fn add_key(key: &str, obs: &ObservationId) -> String {
    format!("{}{}{}{}{}", ADD, SEP, key, SEP, obs)
}

pub fn rem_key(key: &str, obs: &ObservationId) -> String {
    format!("{}{}{}{}{}", REM, SEP, key, SEP, obs)
}

/// Scan prefix for the adds of `key`, trailing separator included.
pub fn add_prefix(key: &str) -> String {
    format!("{}{}{}{}", ADD, SEP, key, SEP)
}

pub fn rem_prefix(key: &str) -> String {
    format!("{}{}{}{}", REM, SEP, key, SEP)
}

/// If `row` belongs to exactly the key that produced `prefix`, return the
/// observation-id segment.
///
/// `add.k1.` is a byte prefix of `add.k1.x.<obs>` (key `k1.x`), so a row
/// only matches when the remainder has no further separator.
pub fn observation_suffix<'a>(row: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = row.strip_prefix(prefix)?;
    if rest.is_empty() || rest.contains(SEP) {
        None
    } else {
        Some(rest)
    }
}

/// Split an `add.<K>.<obs>` / `rem.<K>.<obs>` key id into `(kind, K, obs)`.
pub fn split_key_id(key_id: &str) -> Result<(&str, &str, ObservationId), StorageError> {
    let bad = || StorageError::InvalidKeyId(key_id.to_string());

    let (kind, rest) = key_id.split_once(SEP).ok_or_else(bad)?;
    if kind != ADD && kind != REM {
        return Err(bad());
    }
    let (key, obs) = rest.rsplit_once(SEP).ok_or_else(bad)?;
    if key.is_empty() {
        return Err(bad());
    }
    let obs = ObservationId::parse(obs).map_err(|_| bad())?;
    Ok((kind, key, obs))
}
