//! Materialized read results.

use crate::value::{ObservationId, TsValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The currently visible observations of a key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<ObservationId, TsValue>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ObservationId, value: TsValue) {
        self.0.insert(id, value);
    }

    pub fn get(&self, id: &ObservationId) -> Option<&TsValue> {
        self.0.get(id)
    }

    pub fn contains(&self, id: &ObservationId) -> bool {
        self.0.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The single visible value, if exactly one observation is visible.
    pub fn extract(&self) -> Option<&TsValue> {
        if self.0.len() == 1 {
            self.0.values().next()
        } else {
            None
        }
    }

    pub fn values(&self) -> impl Iterator<Item = &TsValue> {
        self.0.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObservationId, &TsValue)> {
        self.0.iter()
    }

    /// Largest timestamp among the visible observations.
    pub fn max_timestamp(&self) -> Option<i64> {
        self.0.values().map(|v| v.timestamp).max()
    }

    pub fn into_inner(self) -> BTreeMap<ObservationId, TsValue> {
        self.0
    }
}

impl FromIterator<(ObservationId, TsValue)> for Payload {
    fn from_iter<I: IntoIterator<Item = (ObservationId, TsValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Payload {
    type Item = (ObservationId, TsValue);
    type IntoIter = std::collections::btree_map::IntoIter<ObservationId, TsValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
