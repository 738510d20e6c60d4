//! redb-backed OR-Set store.

use crate::codec;
use crate::keys;
use crate::StorageError;
use orkv_crdt::{visible, CollisionPolicy, ObservationId, Payload, TsValue};
use redb::{Database, ReadOnlyTable, ReadableTable, TableDefinition};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("keys");
const OPLOG: TableDefinition<&str, &[u8]> = TableDefinition::new("oplog");

/// Rows fetched per read transaction by [`OpLogCursor`].
const OPLOG_PAGE: usize = 256;

const TOMBSTONE: &[u8] = &[];

const OPEN_RETRY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How long to keep retrying while another handle holds the file lock.
    pub open_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(1),
        }
    }
}

/// Row counts, for observing unbounded growth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub adds: u64,
    pub tombstones: u64,
    pub ops: u64,
}

pub struct Store {
    db: Database,
    path: PathBuf,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open or create the database file at `path`.
    pub fn open(path: &Path, opts: &StoreOptions) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let deadline = Instant::now() + opts.open_timeout;
        let db = loop {
            match Database::create(path) {
                Ok(db) => break db,
                Err(redb::DatabaseError::DatabaseAlreadyOpen) => {
                    if Instant::now() >= deadline {
                        return Err(StorageError::OpenTimeout(path.to_path_buf()));
                    }
                    std::thread::sleep(OPEN_RETRY);
                }
                Err(e) => return Err(e.into()),
            }
        };

        // Both tables must exist before any read transaction opens them.
        let txn = db.begin_write()?;
        {
            txn.open_table(KEYS)?;
            txn.open_table(OPLOG)?;
        }
        txn.commit()?;

        let store = Self {
            db,
            path: path.to_path_buf(),
        };
        let stats = store.stats()?;
        tracing::info!(
            "store opened at {:?}: {} adds, {} tombstones, {} ops",
            store.path,
            stats.adds,
            stats.tombstones,
            stats.ops
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // -----------------------------------------------------------------------
    // OR-Set
    // -----------------------------------------------------------------------

    /// Record a new observation of `key`. Returns its freshly minted id.
    pub fn add(&self, key: &str, value: &TsValue) -> Result<ObservationId, StorageError> {
        orkv_crdt::validate_key(key)?;
        let obs = ObservationId::mint();
        self.put_row(&keys::add_key(key, &obs), &codec::encode(value)?)?;
        Ok(obs)
    }

    /// Record a replayed observation under its original `add.<K>.<obs>` id.
    /// Writing the same id twice is a no-op overwrite.
    pub fn add_observation(
        &self,
        key_id: &str,
        value: &TsValue,
    ) -> Result<ObservationId, StorageError> {
        let (kind, _, obs) = keys::split_key_id(key_id)?;
        if kind != keys::ADD {
            return Err(StorageError::InvalidKeyId(key_id.to_string()));
        }
        self.put_row(key_id, &codec::encode(value)?)?;
        Ok(obs)
    }

    /// Tombstone every observation of `key` visible right now.
    ///
    /// Reads the add-set in one transaction and writes tombstones in a
    /// second, so an add committed in between may survive. Returns the ids
    /// tombstoned; empty (and nothing written) if none were visible.
    pub fn remove(&self, key: &str) -> Result<Vec<ObservationId>, StorageError> {
        orkv_crdt::validate_key(key)?;

        let live: Vec<ObservationId> = {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(KEYS)?;
            let removed: HashSet<ObservationId> = scan(&table, &keys::rem_prefix(key))?
                .into_iter()
                .map(|(obs, _)| obs)
                .collect();
            scan(&table, &keys::add_prefix(key))?
                .into_iter()
                .map(|(obs, _)| obs)
                .filter(|obs| !removed.contains(obs))
                .collect()
        };

        self.tombstone(key, &live)?;
        Ok(live)
    }

    /// Write tombstones for exactly `ids`, whether or not their adds exist.
    pub fn tombstone(&self, key: &str, ids: &[ObservationId]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        orkv_crdt::validate_key(key)?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(KEYS)?;
            for obs in ids {
                table.insert(keys::rem_key(key, obs).as_str(), TOMBSTONE)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Visible observations of `key` after `policy`, or `None` if not found.
    pub fn load(
        &self,
        key: &str,
        policy: CollisionPolicy,
    ) -> Result<Option<Payload>, StorageError> {
        orkv_crdt::validate_key(key)?;

        let txn = self.db.begin_read()?;
        let table = txn.open_table(KEYS)?;

        let mut adds = BTreeMap::new();
        for (obs, raw) in scan(&table, &keys::add_prefix(key))? {
            let value: TsValue = codec::decode(&raw)?;
            adds.insert(obs, value);
        }
        if adds.is_empty() {
            return Ok(None);
        }

        let removed: HashSet<ObservationId> = scan(&table, &keys::rem_prefix(key))?
            .into_iter()
            .map(|(obs, _)| obs)
            .collect();

        Ok(visible(adds, &removed, policy))
    }

    fn put_row(&self, row: &str, value: &[u8]) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(KEYS)?;
            table.insert(row, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Anti-entropy log
    // -----------------------------------------------------------------------

    /// Append an encoded op under `id`. Re-appending an id overwrites it.
    pub fn append_op(&self, id: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(OPLOG)?;
            table.insert(id, bytes)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Iterate `(id, bytes)` for every op id `>= start`, in id order.
    pub fn read_ops_from(&self, start: &str) -> OpLogCursor<'_> {
        OpLogCursor {
            store: self,
            start: start.to_string(),
            next: Bound::Included(start.to_string()),
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    fn read_op_page(&self, from: &Bound<String>) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(OPLOG)?;
        let range = match from {
            Bound::Included(s) => table.range::<&str>((Bound::Included(s.as_str()), Bound::Unbounded))?,
            Bound::Excluded(s) => table.range::<&str>((Bound::Excluded(s.as_str()), Bound::Unbounded))?,
            Bound::Unbounded => table.range::<&str>(..)?,
        };

        let mut out = Vec::with_capacity(OPLOG_PAGE);
        for entry in range.take(OPLOG_PAGE) {
            let (k, v) = entry?;
            out.push((k.value().to_string(), v.value().to_vec()));
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> Result<StoreStats, StorageError> {
        let txn = self.db.begin_read()?;
        let keys_table = txn.open_table(KEYS)?;
        let oplog = txn.open_table(OPLOG)?;

        let adds = count_prefix(&keys_table, "add.")?;
        let tombstones = count_prefix(&keys_table, "rem.")?;
        let mut ops = 0u64;
        for entry in oplog.iter()? {
            entry?;
            ops += 1;
        }

        Ok(StoreStats {
            adds,
            tombstones,
            ops,
        })
    }
}

/// Rows of exactly the key that produced `prefix`, as `(obs, value)`.
fn scan(
    table: &ReadOnlyTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> Result<Vec<(ObservationId, Vec<u8>)>, StorageError> {
    let mut out = Vec::new();
    for entry in table.range::<&str>(prefix..)? {
        let (k, v) = entry?;
        let row = k.value();
        if !row.starts_with(prefix) {
            break;
        }
        if let Some(obs) = keys::observation_suffix(row, prefix) {
            out.push((ObservationId::parse(obs)?, v.value().to_vec()));
        }
    }
    Ok(out)
}

fn count_prefix(
    table: &ReadOnlyTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> Result<u64, StorageError> {
    let mut n = 0u64;
    for entry in table.range::<&str>(prefix..)? {
        let (k, _) = entry?;
        if !k.value().starts_with(prefix) {
            break;
        }
        n += 1;
    }
    Ok(n)
}

// ---------------------------------------------------------------------------
// OpLogCursor
// ---------------------------------------------------------------------------

/// Lazy, finite iterator over the anti-entropy log.
///
/// Each page is read in a fresh read transaction, so writers are never
/// blocked for the length of an iteration. Ops appended after the cursor
/// passes their position are not seen; [`OpLogCursor::restart`] begins
/// again from the original start id.
pub struct OpLogCursor<'a> {
    store: &'a Store,
    start: String,
    next: Bound<String>,
    page: VecDeque<(String, Vec<u8>)>,
    exhausted: bool,
}

impl OpLogCursor<'_> {
    pub fn restart(&mut self) {
        self.next = Bound::Included(self.start.clone());
        self.page.clear();
        self.exhausted = false;
    }
}

impl Iterator for OpLogCursor<'_> {
    type Item = Result<(String, Vec<u8>), StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() {
            if self.exhausted {
                return None;
            }
            match self.store.read_op_page(&self.next) {
                Ok(rows) => {
                    if rows.len() < OPLOG_PAGE {
                        self.exhausted = true;
                    }
                    if let Some((last, _)) = rows.last() {
                        self.next = Bound::Excluded(last.clone());
                    }
                    self.page.extend(rows);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        self.page.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orkv_crdt::OrSet;
    use rand::Rng;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Store {
        Store::open(&dir.path().join("orkv.db"), &StoreOptions::default()).unwrap()
    }

    fn v(bytes: &[u8]) -> TsValue {
        TsValue::new(bytes.to_vec(), "text/plain")
    }

    #[test]
    fn test_never_added_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert!(store.load("k1", CollisionPolicy::None).unwrap().is_none());
        assert!(store.remove("k1").unwrap().is_empty());
    }

    #[test]
    fn test_add_load() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let obs = store.add("k1", &v(b"foo")).unwrap();

        let p = store.load("k1", CollisionPolicy::None).unwrap().unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(p.get(&obs).unwrap().payload, b"foo");
        assert_eq!(p.get(&obs).unwrap().content_type, "text/plain");
    }

    #[test]
    fn test_add_remove_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.add("k1", &v(b"foo")).unwrap();
        assert_eq!(store.remove("k1").unwrap().len(), 1);
        assert!(store.load("k1", CollisionPolicy::None).unwrap().is_none());
    }

    #[test]
    fn test_add_remove_add_same_bytes_found() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.add("k1", &v(b"foo")).unwrap();
        store.remove("k1").unwrap();
        let obs = store.add("k1", &v(b"foo")).unwrap();

        let p = store.load("k1", CollisionPolicy::None).unwrap().unwrap();
        assert_eq!(p.len(), 1);
        assert!(p.contains(&obs));
    }

    #[test]
    fn test_add_add_remove_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.add("k1", &v(b"foo")).unwrap();
        store.add("k1", &v(b"bar")).unwrap();
        assert_eq!(store.remove("k1").unwrap().len(), 2);
        assert!(store.load("k1", CollisionPolicy::None).unwrap().is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.add("k1", &v(b"foo")).unwrap();
        assert_eq!(store.remove("k1").unwrap().len(), 1);
        assert!(store.remove("k1").unwrap().is_empty());
        assert_eq!(store.stats().unwrap().tombstones, 1);
    }

    #[test]
    fn test_lww_policy() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.add("k1", &TsValue::at(10, b"old".to_vec(), "")).unwrap();
        store.add("k1", &TsValue::at(30, b"new".to_vec(), "")).unwrap();
        store.add("k1", &TsValue::at(20, b"mid".to_vec(), "")).unwrap();

        let all = store.load("k1", CollisionPolicy::None).unwrap().unwrap();
        assert_eq!(all.len(), 3);

        let lww = store
            .load("k1", CollisionPolicy::LastWriteWins)
            .unwrap()
            .unwrap();
        assert_eq!(lww.extract().unwrap().payload, b"new");
    }

    #[test]
    fn test_prefix_isolation() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.add("k1", &v(b"one")).unwrap();
        store.add("k10", &v(b"ten")).unwrap();
        store.add("k1.x", &v(b"dotted")).unwrap();

        let p = store.load("k1", CollisionPolicy::None).unwrap().unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(p.extract().unwrap().payload, b"one");

        store.remove("k1").unwrap();
        assert!(store.load("k1", CollisionPolicy::None).unwrap().is_none());
        assert!(store.load("k10", CollisionPolicy::None).unwrap().is_some());
        assert!(store.load("k1.x", CollisionPolicy::None).unwrap().is_some());
    }

    #[test]
    fn test_replay_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let obs = ObservationId::mint();
        let key_id = keys::add_key("k1", &obs);
        let value = v(b"foo");

        store.add_observation(&key_id, &value).unwrap();
        store.add_observation(&key_id, &value).unwrap();
        let p = store.load("k1", CollisionPolicy::None).unwrap().unwrap();
        assert_eq!(p.len(), 1);
        assert!(p.contains(&obs));

        store.tombstone("k1", &[obs.clone()]).unwrap();
        store.tombstone("k1", &[obs]).unwrap();
        assert!(store.load("k1", CollisionPolicy::None).unwrap().is_none());
        assert_eq!(store.stats().unwrap().tombstones, 1);
    }

    #[test]
    fn test_tombstone_before_add_keeps_add_removed() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let obs = ObservationId::mint();
        store.tombstone("k1", &[obs.clone()]).unwrap();
        store
            .add_observation(&keys::add_key("k1", &obs), &v(b"late"))
            .unwrap();
        assert!(store.load("k1", CollisionPolicy::None).unwrap().is_none());
    }

    #[test]
    fn test_add_observation_rejects_rem_key() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let key_id = keys::rem_key("k1", &ObservationId::mint());
        assert!(matches!(
            store.add_observation(&key_id, &v(b"x")),
            Err(StorageError::InvalidKeyId(_))
        ));
    }

    #[test]
    fn test_empty_key_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert!(matches!(
            store.add("", &v(b"x")),
            Err(StorageError::Crdt(_))
        ));
    }

    #[test]
    fn test_reopen_persists() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            store.add("k1", &v(b"foo")).unwrap();
            store.add("k2", &v(b"bar")).unwrap();
            store.remove("k2").unwrap();
            store.append_op("00000000000000000001.ADD.k1", b"op").unwrap();
        }
        let store = open(&dir);
        assert!(store.load("k1", CollisionPolicy::None).unwrap().is_some());
        assert!(store.load("k2", CollisionPolicy::None).unwrap().is_none());
        assert_eq!(
            store.stats().unwrap(),
            StoreStats {
                adds: 2,
                tombstones: 1,
                ops: 1
            }
        );
    }

    #[test]
    fn test_oplog_cursor_pages_in_order() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let total = OPLOG_PAGE * 2 + 17;
        for i in (0..total).rev() {
            store
                .append_op(&format!("{:020}.ADD.k", i), &[i as u8])
                .unwrap();
        }

        let ids: Vec<String> = store
            .read_ops_from("")
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(ids.len(), total);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let from = format!("{:020}", 300);
        let tail: Vec<String> = store.read_ops_from(&from).map(|r| r.unwrap().0).collect();
        assert_eq!(tail.len(), total - 300);
        assert!(tail[0].starts_with(&from));
    }

    #[test]
    fn test_oplog_cursor_restart() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.append_op("a", b"1").unwrap();
        store.append_op("b", b"2").unwrap();

        let mut cursor = store.read_ops_from("");
        assert_eq!(cursor.by_ref().count(), 2);
        assert!(cursor.next().is_none());

        store.append_op("c", b"3").unwrap();
        cursor.restart();
        let ids: Vec<String> = cursor.map(|r| r.unwrap().0).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_matches_in_memory_model() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let mut model = OrSet::new(CollisionPolicy::None);
        let mut rng = rand::thread_rng();

        for _ in 0..200 {
            let key = format!("k{}", rng.gen_range(0..5));
            if rng.gen_bool(0.6) {
                let value = TsValue::at(rng.gen_range(0..1000), vec![rng.gen()], "");
                let obs = store.add(&key, &value).unwrap();
                model.add_observation(&key, obs, value);
            } else {
                let mut a = store.remove(&key).unwrap();
                let mut b = model.remove(&key);
                a.sort();
                b.sort();
                assert_eq!(a, b);
            }
            assert_eq!(
                store.load(&key, CollisionPolicy::None).unwrap(),
                model.load(&key)
            );
        }
    }
}
