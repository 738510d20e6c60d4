//! Retransmit-limited broadcast queue.
//!
//! Each queued broadcast is piggybacked on gossip packets until it has been
//! sent `retransmit_mult * ceil(log10(n + 1))` times, where `n` is the
//! current cluster size estimate. Broadcasts sent fewer times go first;
//! ties are broken oldest-first.

use parking_lot::Mutex;

/// Something that can be disseminated through the queue.
pub trait Broadcast: Send + Sync {
    fn message(&self) -> &[u8];

    /// Named broadcasts replace queued broadcasts with the same name.
    fn name(&self) -> Option<&str> {
        None
    }

    /// Whether queuing `self` makes `other` obsolete.
    fn invalidates(&self, other: &dyn Broadcast) -> bool {
        match (self.name(), other.name()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Called once the broadcast is retired or invalidated.
    fn finished(&self) {}
}

/// Transmissions allowed before a broadcast is retired.
pub fn retransmit_limit(mult: usize, num_nodes: usize) -> usize {
    let scale = ((num_nodes + 1) as f64).log10().ceil() as usize;
    mult * scale.max(1)
}

struct Item {
    transmits: usize,
    id: u64,
    broadcast: Box<dyn Broadcast>,
}

#[derive(Default)]
struct QueueInner {
    items: Vec<Item>,
    next_id: u64,
}

pub struct TransmitLimitedQueue {
    retransmit_mult: usize,
    num_nodes: Box<dyn Fn() -> usize + Send + Sync>,
    inner: Mutex<QueueInner>,
}

impl std::fmt::Debug for TransmitLimitedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmitLimitedQueue")
            .field("retransmit_mult", &self.retransmit_mult)
            .field("queued", &self.num_queued())
            .finish_non_exhaustive()
    }
}

impl TransmitLimitedQueue {
    pub fn new(
        retransmit_mult: usize,
        num_nodes: impl Fn() -> usize + Send + Sync + 'static,
    ) -> Self {
        Self {
            retransmit_mult,
            num_nodes: Box::new(num_nodes),
            inner: Mutex::new(QueueInner::default()),
        }
    }

    pub fn queue_broadcast(&self, broadcast: Box<dyn Broadcast>) {
        let mut invalidated = Vec::new();
        {
            let mut inner = self.inner.lock();
            let mut kept = Vec::with_capacity(inner.items.len() + 1);
            for item in inner.items.drain(..) {
                if broadcast.invalidates(item.broadcast.as_ref()) {
                    invalidated.push(item.broadcast);
                } else {
                    kept.push(item);
                }
            }
            inner.items = kept;

            let id = inner.next_id;
            inner.next_id += 1;
            inner.items.push(Item {
                transmits: 0,
                id,
                broadcast,
            });
        }
        for b in invalidated {
            b.finished();
        }
    }

    /// Take as many messages as fit in `limit` bytes, counting `overhead`
    /// per message.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let max_transmits = retransmit_limit(self.retransmit_mult, (self.num_nodes)());
        let mut retired = Vec::new();
        let mut out = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.items.is_empty() {
                return out;
            }
            inner.items.sort_by_key(|i| (i.transmits, i.id));

            let mut used = 0;
            let mut kept = Vec::with_capacity(inner.items.len());
            for mut item in inner.items.drain(..) {
                let cost = item.broadcast.message().len() + overhead;
                if used + cost > limit {
                    kept.push(item);
                    continue;
                }
                used += cost;
                out.push(item.broadcast.message().to_vec());
                item.transmits += 1;
                if item.transmits >= max_transmits {
                    retired.push(item.broadcast);
                } else {
                    kept.push(item);
                }
            }
            inner.items = kept;
        }
        for b in retired {
            b.finished();
        }
        out
    }

    /// Current cluster size estimate.
    pub fn num_nodes(&self) -> usize {
        (self.num_nodes)()
    }

    pub fn num_queued(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Drop everything queued.
    pub fn reset(&self) {
        let items = std::mem::take(&mut self.inner.lock().items);
        for item in items {
            item.broadcast.finished();
        }
    }

    /// Keep only the `max_retain` least-transmitted broadcasts, preferring
    /// newer ones among equals.
    pub fn prune(&self, max_retain: usize) {
        let mut dropped = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.items.len() <= max_retain {
                return;
            }
            inner
                .items
                .sort_by_key(|i| (i.transmits, std::cmp::Reverse(i.id)));
            dropped.extend(inner.items.drain(max_retain..).map(|i| i.broadcast));
        }
        for b in dropped {
            b.finished();
        }
    }
}
