//! Gossip delegate: carries op-log records between nodes.
//!
//! Records travel two ways. Each local op is queued as a user broadcast and
//! arrives at peers through `notify_msg`. On join the whole anti-entropy log
//! is shipped in the push-pull user state and replayed in order.

use crate::config::PeerData;
use orkv_gossip::{Delegate, TransmitLimitedQueue};
use orkv_oplog::{OpLog, OpLogHandler};
use orkv_storage::codec;
use serde_bytes::ByteBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub struct PeerDelegate {
    meta: PeerData,
    broadcasts: Arc<TransmitLimitedQueue>,
    replica: Option<mpsc::Sender<OpLog>>,
    handler: OpLogHandler,
}

impl std::fmt::Debug for PeerDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerDelegate")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl PeerDelegate {
    pub fn new(
        meta: PeerData,
        broadcasts: Arc<TransmitLimitedQueue>,
        handler: OpLogHandler,
    ) -> Self {
        Self {
            meta,
            broadcasts,
            replica: handler.replica_sender(),
            handler,
        }
    }
}

/// Encode the join payload: an array of encoded op-log records.
pub fn encode_state(ops: Vec<Vec<u8>>) -> Result<Vec<u8>, orkv_storage::CodecError> {
    let blobs: Vec<ByteBuf> = ops.into_iter().map(ByteBuf::from).collect();
    codec::encode(&blobs)
}

/// Decode a join payload back into records, skipping undecodable entries.
pub fn decode_state(buf: &[u8]) -> Result<Vec<OpLog>, orkv_storage::CodecError> {
    let blobs: Vec<ByteBuf> = codec::decode(buf)?;
    let mut ops = Vec::with_capacity(blobs.len());
    for blob in blobs {
        match OpLog::decode(&blob) {
            Ok(op) => ops.push(op),
            Err(e) => tracing::error!("skipping undecodable record in remote state: {}", e),
        }
    }
    Ok(ops)
}

impl Delegate for PeerDelegate {
    fn node_meta(&self, limit: usize) -> Vec<u8> {
        let js = match serde_json::to_vec(&self.meta) {
            Ok(js) => js,
            Err(e) => {
                tracing::error!("failed to encode node metadata: {}", e);
                return Vec::new();
            }
        };
        if js.len() > limit {
            tracing::error!(
                "node metadata is {} bytes, over the {} byte limit; not advertising it",
                js.len(),
                limit
            );
            return Vec::new();
        }
        tracing::debug!("metadata returned: {}", String::from_utf8_lossy(&js));
        js
    }

    fn notify_msg(&self, msg: &[u8]) {
        if msg.is_empty() {
            return;
        }
        let op = match OpLog::decode(msg) {
            Ok(op) => op,
            Err(e) => {
                tracing::error!("dropping undecodable op broadcast: {}", e);
                return;
            }
        };
        let Some(replica) = &self.replica else {
            return;
        };
        match replica.try_send(op) {
            Ok(()) => tracing::debug!("replicated op handed to the pipeline"),
            Err(TrySendError::Full(op)) => {
                orkv_metrics::metrics().replica_bounced.inc();
                tracing::debug!("replica channel busy, bounced {}", op.id);
            }
            Err(TrySendError::Closed(_)) => tracing::debug!("replica channel closed"),
        }
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        self.broadcasts.get_broadcasts(overhead, limit)
    }

    fn local_state(&self, join: bool) -> Vec<u8> {
        if !join {
            return Vec::new();
        }
        let ops = match self.handler.oplog("") {
            Ok(ops) => ops,
            Err(e) => {
                tracing::error!("failed to read op log for state transfer: {}", e);
                return Vec::new();
            }
        };
        let count = ops.len();
        match encode_state(ops) {
            Ok(buf) => {
                tracing::info!("sending {} ops as join state", count);
                buf
            }
            Err(e) => {
                tracing::error!("failed to encode join state: {}", e);
                Vec::new()
            }
        }
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        if buf.is_empty() || !join {
            return;
        }
        let ops = match decode_state(buf) {
            Ok(ops) => ops,
            Err(e) => {
                tracing::error!("failed to decode remote state: {}", e);
                return;
            }
        };
        tracing::info!("replaying {} ops from remote state", ops.len());

        // One task keeps the records in log order.
        let handler = self.handler.clone();
        tokio::spawn(async move {
            for op in ops {
                if let Err(e) = handler.replicate(op).await {
                    tracing::error!("stopped replaying remote state: {}", e);
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orkv_crdt::CollisionPolicy;
    use orkv_oplog::HandlerConfig;
    use orkv_storage::{Store, StoreOptions};
    use std::time::Duration;
    use tempfile::TempDir;

    fn queue() -> Arc<TransmitLimitedQueue> {
        Arc::new(TransmitLimitedQueue::new(3, || 1))
    }

    fn delegate(handler: OpLogHandler) -> PeerDelegate {
        let meta = PeerData {
            node_name: "n1".into(),
            api_ingress: "http://127.0.0.1:8080".into(),
            token: String::new(),
        };
        PeerDelegate::new(meta, queue(), handler)
    }

    #[test]
    fn test_node_meta_is_json() {
        let d = delegate(OpLogHandler::new(HandlerConfig::default()));
        let meta: PeerData = serde_json::from_slice(&d.node_meta(512)).unwrap();
        assert_eq!(meta.node_name, "n1");
    }

    #[test]
    fn test_node_meta_over_limit_refused() {
        let d = delegate(OpLogHandler::new(HandlerConfig::default()));
        assert!(d.node_meta(8).is_empty());
    }

    #[tokio::test]
    async fn test_notify_msg_bounces_when_busy() {
        let handler = OpLogHandler::new(HandlerConfig {
            replica_buffer: 1,
            ..HandlerConfig::default()
        });
        let d = delegate(handler);

        let before = orkv_metrics::metrics().replica_bounced.get();
        for _ in 0..3 {
            let op = OpLog::add("k", b"v".to_vec(), "");
            d.notify_msg(&op.encode().unwrap());
        }
        assert!(orkv_metrics::metrics().replica_bounced.get() >= before + 2);
    }

    #[test]
    fn test_notify_msg_ignores_garbage() {
        let d = delegate(OpLogHandler::new(HandlerConfig::default()));
        d.notify_msg(b"");
        d.notify_msg(b"\xc1\xc1 not msgpack");
    }

    #[test]
    fn test_state_round_trip_keeps_order() {
        let ops: Vec<OpLog> = (0..5)
            .map(|i| OpLog::add(&format!("k{}", i), vec![i as u8], ""))
            .collect();
        let encoded: Vec<Vec<u8>> = ops.iter().map(|op| op.encode().unwrap()).collect();
        let decoded = decode_state(&encode_state(encoded).unwrap()).unwrap();
        assert_eq!(decoded, ops);
    }

    #[test]
    fn test_decode_state_skips_bad_records() {
        let good = OpLog::add("k", b"v".to_vec(), "");
        let buf = encode_state(vec![b"junk".to_vec(), good.encode().unwrap()]).unwrap();
        assert_eq!(decode_state(&buf).unwrap(), vec![good]);
    }

    #[tokio::test]
    async fn test_local_state_only_on_join() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.redb");
        let store = Arc::new(Store::open(&path, &StoreOptions::default()).unwrap());
        let handler = OpLogHandler::new(HandlerConfig {
            drain_on_stop: true,
            ..HandlerConfig::default()
        });
        handler.start(store, None).unwrap();
        handler.add("k1", b"v".to_vec(), "").await.unwrap();
        handler.stop();
        handler.wait().await;

        let d = delegate(handler);
        assert!(d.local_state(false).is_empty());
        let ops = decode_state(&d.local_state(true)).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].key, "k1");
    }

    #[tokio::test]
    async fn test_merge_remote_state_replays() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b.redb");
        let store = Arc::new(Store::open(&path, &StoreOptions::default()).unwrap());
        let handler = OpLogHandler::new(HandlerConfig::default());
        handler.start(store.clone(), None).unwrap();
        let d = delegate(handler.clone());

        let ops = vec![
            OpLog::add("k1", b"foo".to_vec(), "").encode().unwrap(),
            OpLog::add("k1", b"bar".to_vec(), "").encode().unwrap(),
        ];
        let state = encode_state(ops).unwrap();

        d.merge_remote_state(&state, false);
        d.merge_remote_state(&state, true);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let got = store.load("k1", CollisionPolicy::None).unwrap();
            if got.as_ref().map_or(false, |p| p.len() == 2) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "state not replayed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Replayed records are remote and never re-logged.
        assert!(handler.oplog("").unwrap().is_empty());
    }
}
