//! The op-log handler: bounded channels in front of a small pool of apply
//! workers.
//!
//! Lifecycle is `Idle -> Running -> Stopped`. Records may be submitted while
//! idle; they wait in the commit channel until [`OpLogHandler::start`].

use crate::record::{OpKind, OpLog};
use crate::replicator::Replicator;
use crate::OpLogError;
use orkv_storage::Store;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Commit workers sharing the commit channel. One worker preserves
    /// single-caller submission order.
    pub workers: usize,
    /// Capacity of the local commit channel. Local submitters wait when full.
    pub commit_buffer: usize,
    /// Capacity of the replica inbound channel; 0 disables it.
    pub replica_buffer: usize,
    /// Apply everything already queued before the workers exit.
    pub drain_on_stop: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            commit_buffer: 1,
            replica_buffer: 256,
            drain_on_stop: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

struct Receivers {
    commit: mpsc::Receiver<OpLog>,
    replica: Option<mpsc::Receiver<OpLog>>,
}

struct Inner {
    config: HandlerConfig,
    commit_tx: mpsc::Sender<OpLog>,
    replica_tx: Option<mpsc::Sender<OpLog>>,
    receivers: Mutex<Option<Receivers>>,
    lifecycle: Mutex<Lifecycle>,
    store: OnceLock<Arc<Store>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable handle to one op-log pipeline.
#[derive(Clone)]
pub struct OpLogHandler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for OpLogHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpLogHandler")
            .field("config", &self.inner.config)
            .field("lifecycle", &*self.inner.lifecycle.lock())
            .finish_non_exhaustive()
    }
}

impl OpLogHandler {
    pub fn new(config: HandlerConfig) -> Self {
        let (commit_tx, commit_rx) = mpsc::channel(config.commit_buffer.max(1));
        let (replica_tx, replica_rx) = if config.replica_buffer > 0 {
            let (tx, rx) = mpsc::channel(config.replica_buffer);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                commit_tx,
                replica_tx,
                receivers: Mutex::new(Some(Receivers {
                    commit: commit_rx,
                    replica: replica_rx,
                })),
                lifecycle: Mutex::new(Lifecycle::Idle),
                store: OnceLock::new(),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the workers against `store`. Must be called inside a tokio
    /// runtime, and only once.
    pub fn start(
        &self,
        store: Arc<Store>,
        replicator: Option<Replicator>,
    ) -> Result<(), OpLogError> {
        let receivers = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if *lifecycle != Lifecycle::Idle {
                return Err(OpLogError::AlreadyStarted);
            }
            let receivers = self
                .inner
                .receivers
                .lock()
                .take()
                .ok_or(OpLogError::AlreadyStarted)?;
            *lifecycle = Lifecycle::Running;
            receivers
        };
        let _ = self.inner.store.set(store.clone());

        let worker = Arc::new(Worker { store, replicator });
        let drain = self.inner.config.drain_on_stop;
        let mut tasks = self.inner.tasks.lock();

        let commit = Arc::new(tokio::sync::Mutex::new(receivers.commit));
        for id in 0..self.inner.config.workers.max(1) {
            tasks.push(tokio::spawn(run_worker(
                format!("commit-{}", id),
                commit.clone(),
                worker.clone(),
                self.inner.shutdown.subscribe(),
                drain,
                false,
            )));
        }
        if let Some(replica) = receivers.replica {
            tasks.push(tokio::spawn(run_worker(
                "replica".to_string(),
                Arc::new(tokio::sync::Mutex::new(replica)),
                worker,
                self.inner.shutdown.subscribe(),
                drain,
                true,
            )));
        }

        tracing::info!(
            "oplog handler started ({} workers, replica channel {})",
            self.inner.config.workers.max(1),
            if self.inner.replica_tx.is_some() { "on" } else { "off" }
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    pub async fn add(
        &self,
        key: &str,
        payload: Vec<u8>,
        content_type: &str,
    ) -> Result<(), OpLogError> {
        orkv_crdt::validate_key(key)?;
        self.submit(OpLog::add(key, payload, content_type)).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), OpLogError> {
        orkv_crdt::validate_key(key)?;
        self.submit(OpLog::remove(key)).await
    }

    /// Apply a record received from another node. It is never re-broadcast.
    pub async fn replicate(&self, mut op: OpLog) -> Result<(), OpLogError> {
        orkv_crdt::validate_key(&op.key)?;
        op.is_from_remote = true;
        self.submit(op).await
    }

    async fn submit(&self, op: OpLog) -> Result<(), OpLogError> {
        if *self.inner.lifecycle.lock() == Lifecycle::Stopped {
            return Err(OpLogError::Stopped);
        }
        orkv_metrics::metrics()
            .ops_submitted
            .with_label_values(&[op.kind.as_str(), orkv_metrics::origin(op.is_from_remote)])
            .inc();
        self.inner
            .commit_tx
            .send(op)
            .await
            .map_err(|_| OpLogError::Stopped)
    }

    /// Sender for records arriving from peers; `None` when the replica
    /// channel is disabled. Callers should `try_send`.
    pub fn replica_sender(&self) -> Option<mpsc::Sender<OpLog>> {
        self.inner.replica_tx.clone()
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Signal the workers to exit. Does not wait.
    pub fn stop(&self) {
        *self.inner.lifecycle.lock() = Lifecycle::Stopped;
        self.inner.shutdown.send_replace(true);
    }

    /// Wait for every worker spawned by `start` to exit.
    pub async fn wait(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("oplog worker panicked: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        *self.inner.lifecycle.lock() == Lifecycle::Running
    }

    // -----------------------------------------------------------------------
    // Anti-entropy log
    // -----------------------------------------------------------------------

    /// Encoded records of every locally applied op with id `>= start`.
    pub fn oplog(&self, start: &str) -> Result<Vec<Vec<u8>>, OpLogError> {
        let store = self.inner.store.get().ok_or(OpLogError::NotStarted)?;
        let mut out = Vec::new();
        for entry in store.read_ops_from(start) {
            let (_, bytes) = entry?;
            out.push(bytes);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

struct Worker {
    store: Arc<Store>,
    replicator: Option<Replicator>,
}

/// What applying a record produced.
enum Applied {
    /// Stored; carries the record as it should be logged.
    Done(OpLog),
    /// A remove that found nothing to tombstone.
    Nothing,
}

impl Worker {
    async fn process(&self, op: OpLog) {
        let kind = op.kind.as_str();
        let origin = orkv_metrics::origin(op.is_from_remote);
        let id = op.id.clone();
        let _timer = orkv_metrics::start_apply_timer(kind);

        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || apply(&store, op))
            .await
            .map_err(|e| OpLogError::Worker(e.to_string()))
            .and_then(|r| r);

        let m = orkv_metrics::metrics();
        match result {
            Ok(Applied::Done(op)) => {
                m.ops_applied.with_label_values(&[kind, origin]).inc();
                if op.is_from_remote {
                    return;
                }
                if let Some(replicator) = &self.replicator {
                    if let Err(e) = replicator.send(&op) {
                        tracing::error!("failed to replicate {}: {}", op.id, e);
                    }
                }
            }
            Ok(Applied::Nothing) => {
                m.ops_applied.with_label_values(&[kind, origin]).inc();
                tracing::debug!("{} removed nothing, not logged", id);
            }
            Err(e) => {
                m.ops_failed.with_label_values(&[kind, origin]).inc();
                tracing::error!("failed to apply {}: {}", id, e);
            }
        }
    }
}

/// Apply `op` to the store and, for local records, append it to the
/// anti-entropy log. Runs on the blocking pool.
fn apply(store: &Store, mut op: OpLog) -> Result<Applied, OpLogError> {
    match op.kind {
        OpKind::Add => {
            store.add_observation(&op.key_id, &op.value)?;
        }
        OpKind::Rem if op.tombstones.is_empty() => {
            let removed = store.remove(&op.key)?;
            if removed.is_empty() {
                return Ok(Applied::Nothing);
            }
            op.tombstones = removed;
        }
        OpKind::Rem => {
            store.tombstone(&op.key, &op.tombstones)?;
        }
    }

    if !op.is_from_remote {
        store.append_op(&op.id, &op.encode()?)?;
    }
    Ok(Applied::Done(op))
}

/// Resolves once the shutdown flag is set or its sender is gone.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn run_worker(
    name: String,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<OpLog>>>,
    worker: Arc<Worker>,
    mut shutdown: watch::Receiver<bool>,
    drain: bool,
    remote: bool,
) {
    tracing::debug!("oplog worker {} running", name);
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => None,
                op = rx.recv() => op,
            }
        };
        let Some(mut op) = next else { break };
        if remote {
            op.is_from_remote = true;
        }
        worker.process(op).await;
    }

    if drain {
        let mut rx = rx.lock().await;
        let mut drained = 0usize;
        while let Ok(mut op) = rx.try_recv() {
            if remote {
                op.is_from_remote = true;
            }
            worker.process(op).await;
            drained += 1;
        }
        if drained > 0 {
            tracing::info!("oplog worker {} drained {} ops", name, drained);
        }
    }
    tracing::debug!("oplog worker {} stopped", name);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use orkv_crdt::{CollisionPolicy, Payload};
    use orkv_storage::StoreOptions;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir, name: &str) -> Arc<Store> {
        Arc::new(Store::open(&dir.path().join(name), &StoreOptions::default()).unwrap())
    }

    /// Handler that applies everything queued before it exits, so tests
    /// can `settle` and then assert on the store.
    fn draining() -> OpLogHandler {
        OpLogHandler::new(HandlerConfig {
            drain_on_stop: true,
            ..HandlerConfig::default()
        })
    }

    fn started(dir: &TempDir, name: &str) -> (OpLogHandler, Arc<Store>) {
        let store = open_store(dir, name);
        let handler = draining();
        handler.start(store.clone(), None).unwrap();
        (handler, store)
    }

    async fn settle(handler: &OpLogHandler) {
        handler.stop();
        handler.wait().await;
    }

    fn load(store: &Store, key: &str) -> Option<Payload> {
        store.load(key, CollisionPolicy::None).unwrap()
    }

    /// Poll `load` until `check` holds or two seconds pass.
    async fn eventually<F>(store: &Store, key: &str, check: F) -> Option<Payload>
    where
        F: Fn(&Option<Payload>) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let got = load(store, key);
            if check(&got) || tokio::time::Instant::now() > deadline {
                return got;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_add_then_contains() {
        let dir = TempDir::new().unwrap();
        let (handler, store) = started(&dir, "node.redb");

        handler.add("k1", b"foo".to_vec(), "").await.unwrap();
        settle(&handler).await;
        let got = load(&store, "k1").unwrap();
        assert_eq!(got.extract().unwrap().payload, b"foo");
    }

    #[tokio::test]
    async fn test_add_remove_not_found() {
        let dir = TempDir::new().unwrap();
        let (handler, store) = started(&dir, "node.redb");

        handler.add("k1", b"foo".to_vec(), "").await.unwrap();
        handler.remove("k1").await.unwrap();
        settle(&handler).await;
        assert!(load(&store, "k1").is_none());
    }

    #[tokio::test]
    async fn test_add_remove_add_found() {
        let dir = TempDir::new().unwrap();
        let (handler, store) = started(&dir, "node.redb");

        handler.add("k1", b"foo".to_vec(), "").await.unwrap();
        handler.remove("k1").await.unwrap();
        handler.add("k1", b"foo".to_vec(), "").await.unwrap();
        settle(&handler).await;

        let got = load(&store, "k1").unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got.extract().unwrap().payload, b"foo");
    }

    #[tokio::test]
    async fn test_add_add_remove_not_found() {
        let dir = TempDir::new().unwrap();
        let (handler, store) = started(&dir, "node.redb");

        handler.add("k1", b"foo".to_vec(), "").await.unwrap();
        handler.add("k1", b"bar".to_vec(), "").await.unwrap();
        handler.remove("k1").await.unwrap();
        settle(&handler).await;
        assert!(load(&store, "k1").is_none());
    }

    #[tokio::test]
    async fn test_running_handler_applies_without_stop() {
        let dir = TempDir::new().unwrap();
        let (handler, store) = started(&dir, "node.redb");

        handler.add("k1", b"foo".to_vec(), "").await.unwrap();
        assert!(eventually(&store, "k1", |p| p.is_some()).await.is_some());
        assert!(handler.is_running());
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let handler = OpLogHandler::new(HandlerConfig::default());
        assert!(matches!(
            handler.add("", b"v".to_vec(), "").await,
            Err(OpLogError::Crdt(_))
        ));
        assert!(matches!(handler.remove("").await, Err(OpLogError::Crdt(_))));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let dir = TempDir::new().unwrap();
        let (handler, store) = started(&dir, "node.redb");
        assert!(matches!(
            handler.start(store, None),
            Err(OpLogError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_submit_after_stop_fails() {
        let dir = TempDir::new().unwrap();
        let (handler, _store) = started(&dir, "node.redb");
        settle(&handler).await;
        assert!(!handler.is_running());
        assert!(matches!(
            handler.add("k", b"v".to_vec(), "").await,
            Err(OpLogError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_oplog_records_local_ops_only() {
        let dir = TempDir::new().unwrap();
        let (handler, _store) = started(&dir, "node.redb");
        assert!(handler.oplog("").unwrap().is_empty());

        handler.add("k1", b"a".to_vec(), "").await.unwrap();
        handler.remove("k1").await.unwrap();
        handler
            .replicate(OpLog::add("k2", b"remote".to_vec(), ""))
            .await
            .unwrap();
        settle(&handler).await;

        let ops: Vec<OpLog> = handler
            .oplog("")
            .unwrap()
            .iter()
            .map(|b| OpLog::decode(b).unwrap())
            .collect();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].kind, OpKind::Add);
        assert_eq!(ops[1].kind, OpKind::Rem);
        assert_eq!(ops[1].tombstones.len(), 1);
        assert!(ops.iter().all(|op| !op.is_from_remote));
    }

    #[tokio::test]
    async fn test_remove_of_unknown_key_not_logged() {
        let dir = TempDir::new().unwrap();
        let (handler, _store) = started(&dir, "node.redb");

        handler.remove("ghost").await.unwrap();
        handler.add("k1", b"a".to_vec(), "").await.unwrap();
        settle(&handler).await;

        assert_eq!(handler.oplog("").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replaying_log_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (source, source_store) = started(&dir, "source.redb");
        source.add("k1", b"foo".to_vec(), "").await.unwrap();
        source.add("k1", b"bar".to_vec(), "").await.unwrap();
        source.remove("k1").await.unwrap();
        source.add("k1", b"baz".to_vec(), "").await.unwrap();
        settle(&source).await;
        let log = source.oplog("").unwrap();
        assert_eq!(log.len(), 4);

        let (target, target_store) = started(&dir, "target.redb");
        for _ in 0..2 {
            for bytes in &log {
                target.replicate(OpLog::decode(bytes).unwrap()).await.unwrap();
            }
        }
        settle(&target).await;

        let expected = load(&source_store, "k1");
        let got = load(&target_store, "k1");
        assert_eq!(got, expected);
        assert_eq!(got.unwrap().extract().unwrap().payload, b"baz");
        assert!(target.oplog("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_app_replication_between_handlers() {
        let dir = TempDir::new().unwrap();
        let store_a = open_store(&dir, "a.redb");
        let store_b = open_store(&dir, "b.redb");

        let a = draining();
        let b = draining();
        a.start(store_a.clone(), Some(Replicator::in_app(b.replica_sender().unwrap())))
            .unwrap();
        b.start(store_b.clone(), Some(Replicator::in_app(a.replica_sender().unwrap())))
            .unwrap();

        a.add("k1", b"foo".to_vec(), "").await.unwrap();
        a.add("k1", b"bar".to_vec(), "").await.unwrap();
        let got = eventually(&store_b, "k1", |p| p.as_ref().map_or(false, |p| p.len() == 2))
            .await
            .unwrap();
        assert_eq!(got.len(), 2);

        a.remove("k1").await.unwrap();
        assert!(eventually(&store_b, "k1", |p| p.is_none()).await.is_none());

        settle(&a).await;
        settle(&b).await;
        assert!(load(&store_a, "k1").is_none());

        // Replicated records never bounce back into either log.
        assert_eq!(a.oplog("").unwrap().len(), 3);
        assert!(b.oplog("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_remove_spares_unseen_add() {
        let dir = TempDir::new().unwrap();
        let (a, _store_a) = started(&dir, "a.redb");
        let (b, store_b) = started(&dir, "b.redb");

        a.add("k1", b"seen".to_vec(), "").await.unwrap();
        a.remove("k1").await.unwrap();
        settle(&a).await;
        let log = a.oplog("").unwrap();
        assert_eq!(log.len(), 2);

        b.add("k1", b"unseen".to_vec(), "").await.unwrap();
        for bytes in &log {
            b.replicate(OpLog::decode(bytes).unwrap()).await.unwrap();
        }
        settle(&b).await;

        let got = load(&store_b, "k1").unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got.extract().unwrap().payload, b"unseen");
    }

    #[tokio::test]
    async fn test_replica_channel_marks_remote() {
        let dir = TempDir::new().unwrap();
        let (handler, store) = started(&dir, "node.redb");

        let tx = handler.replica_sender().unwrap();
        tx.try_send(OpLog::add("k1", b"v".to_vec(), "")).unwrap();
        assert!(eventually(&store, "k1", |p| p.is_some()).await.is_some());
        settle(&handler).await;
        assert!(handler.oplog("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replica_channel_disabled() {
        let handler = OpLogHandler::new(HandlerConfig {
            replica_buffer: 0,
            ..HandlerConfig::default()
        });
        assert!(handler.replica_sender().is_none());
    }

    #[tokio::test]
    async fn test_drain_on_stop_applies_queued() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, "drain.redb");
        let handler = OpLogHandler::new(HandlerConfig {
            commit_buffer: 16,
            drain_on_stop: true,
            ..HandlerConfig::default()
        });

        // Queue while idle, then start and stop at once.
        for i in 0..8 {
            handler
                .add(&format!("k{}", i), b"v".to_vec(), "")
                .await
                .unwrap();
        }
        handler.start(store.clone(), None).unwrap();
        settle(&handler).await;

        for i in 0..8 {
            assert!(load(&store, &format!("k{}", i)).is_some(), "k{} not applied", i);
        }
    }

    #[tokio::test]
    async fn test_oplog_before_start_fails() {
        let handler = OpLogHandler::new(HandlerConfig::default());
        assert!(matches!(handler.oplog(""), Err(OpLogError::NotStarted)));
    }
}
