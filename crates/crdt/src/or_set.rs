//! In-memory OR-Set.
//!
//! Holds the same add-set / tombstone-set pair that the storage engine
//! persists as `add.*` / `rem.*` rows, so it doubles as a reference model.

use crate::payload::Payload;
use crate::policy::{visible, CollisionPolicy};
use crate::value::{ObservationId, TsValue};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Default)]
pub struct OrSet {
    adds: HashMap<String, BTreeMap<ObservationId, TsValue>>,
    removed: HashMap<String, HashSet<ObservationId>>,
    policy: CollisionPolicy,
}

impl OrSet {
    pub fn new(policy: CollisionPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Record a new observation for `key` and return its id.
    pub fn add(&mut self, key: &str, value: TsValue) -> ObservationId {
        let id = ObservationId::mint();
        self.add_observation(key, id.clone(), value);
        id
    }

    /// Record an observation with a known id (replay path).
    pub fn add_observation(&mut self, key: &str, id: ObservationId, value: TsValue) {
        self.adds.entry(key.to_string()).or_default().insert(id, value);
    }

    /// Tombstone every observation of `key` that is currently visible.
    ///
    /// Returns the ids newly tombstoned; empty if nothing was visible.
    pub fn remove(&mut self, key: &str) -> Vec<ObservationId> {
        let Some(adds) = self.adds.get(key) else {
            return Vec::new();
        };
        let removed = self.removed.get(key);
        let ids: Vec<ObservationId> = adds
            .keys()
            .filter(|id| removed.map_or(true, |r| !r.contains(*id)))
            .cloned()
            .collect();
        self.tombstone(key, &ids);
        ids
    }

    /// Tombstone a specific set of observations (replay path).
    pub fn tombstone(&mut self, key: &str, ids: &[ObservationId]) {
        if ids.is_empty() {
            return;
        }
        self.removed
            .entry(key.to_string())
            .or_default()
            .extend(ids.iter().cloned());
    }

    /// Visible observations of `key`, or `None` if not found.
    pub fn load(&self, key: &str) -> Option<Payload> {
        let adds = self.adds.get(key)?.clone();
        let empty = HashSet::new();
        let removed = self.removed.get(key).unwrap_or(&empty);
        visible(adds, removed, self.policy)
    }

    /// Merge another replica's state into this one (union of both sets).
    pub fn merge(&mut self, other: &OrSet) {
        for (key, adds) in &other.adds {
            let mine = self.adds.entry(key.clone()).or_default();
            for (id, value) in adds {
                mine.entry(id.clone()).or_insert_with(|| value.clone());
            }
        }
        for (key, ids) in &other.removed {
            self.removed
                .entry(key.clone())
                .or_default()
                .extend(ids.iter().cloned());
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.adds.keys().map(String::as_str)
    }
}
