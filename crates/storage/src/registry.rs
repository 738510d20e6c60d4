//! Process-wide map of open stores, so each database file is opened once.

use crate::store::{Store, StoreOptions};
use crate::StorageError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct StoreRegistry {
    stores: Mutex<HashMap<PathBuf, Arc<Store>>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shared handle for `path`, opening it on first use.
    pub fn open(&self, path: &Path, opts: &StoreOptions) -> Result<Arc<Store>, StorageError> {
        // Held across the open so two callers cannot race the file lock.
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(path) {
            return Ok(store.clone());
        }

        let store = Arc::new(Store::open(path, opts)?);
        stores.insert(path.to_path_buf(), store.clone());
        Ok(store)
    }

    /// Forget the handle for `path`. The file closes once every clone of
    /// the handle is dropped. Returns whether the path was open.
    pub fn close(&self, path: &Path) -> bool {
        let removed = self.stores.lock().remove(path);
        if removed.is_some() {
            tracing::info!("store at {:?} released from registry", path);
        }
        removed.is_some()
    }

    pub fn len(&self) -> usize {
        self.stores.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
