//! Outbound replication of locally applied operations.

use crate::record::OpLog;
use crate::OpLogError;
use orkv_gossip::{Broadcast, TransmitLimitedQueue};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Ops queued for gossip beyond this are pruned, least-sent first kept.
pub const MAX_QUEUED_OPS: usize = 8192;

/// An encoded operation riding the gossip broadcast queue. Never invalidated
/// by later broadcasts.
#[derive(Debug)]
pub struct OpBroadcast {
    msg: Vec<u8>,
}

impl OpBroadcast {
    pub fn new(msg: Vec<u8>) -> Self {
        Self { msg }
    }
}

impl Broadcast for OpBroadcast {
    fn message(&self) -> &[u8] {
        &self.msg
    }
}

#[derive(Debug, Clone)]
pub enum Replicator {
    /// Hand ops straight to another handler's replica channel. Drops the op
    /// if the channel is full.
    InApp { buffer: mpsc::Sender<OpLog> },
    /// Encode ops and queue them for gossip dissemination.
    Gossip { queue: Arc<TransmitLimitedQueue> },
}

impl Replicator {
    pub fn in_app(buffer: mpsc::Sender<OpLog>) -> Self {
        Replicator::InApp { buffer }
    }

    pub fn gossip(queue: Arc<TransmitLimitedQueue>) -> Self {
        Replicator::Gossip { queue }
    }

    pub fn send(&self, op: &OpLog) -> Result<(), OpLogError> {
        match self {
            Replicator::InApp { buffer } => match buffer.try_send(op.clone()) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    tracing::debug!("in-app replica buffer full, dropping {}", op.id);
                    Ok(())
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("in-app replica buffer closed, dropping {}", op.id);
                    Ok(())
                }
            },
            Replicator::Gossip { queue } => {
                // Nobody to gossip to. Nodes joining later get the op through
                // join state transfer.
                if queue.num_nodes() <= 1 {
                    tracing::trace!("no peers, not queueing {}", op.id);
                    return Ok(());
                }
                let msg = op.encode()?;
                queue.queue_broadcast(Box::new(OpBroadcast::new(msg)));
                queue.prune(MAX_QUEUED_OPS);
                orkv_metrics::metrics().broadcasts_queued.inc();
                Ok(())
            }
        }
    }
}
