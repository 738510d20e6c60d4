//! The membership protocol.
//!
//! Failure detection is SWIM-style: probe one node per `probe_interval`,
//! fall back to indirect pings, then mark the node suspect. A suspect that
//! does not refute within the suspicion timeout is declared dead. State
//! changes spread through the broadcast queue on gossip packets; full
//! state is reconciled over streams on join and every `push_pull_interval`.

use crate::config::{GossipConfig, META_MAX_SIZE};
use crate::delegate::{Delegate, EventDelegate};
use crate::message::{
    self, Alive, Dead, Message, PushPull, Suspect, COMPOUND_OVERHEAD, MESSAGE_OVERHEAD,
};
use crate::queue::{Broadcast, TransmitLimitedQueue};
use crate::state::{Node, NodeRecord, NodeState, NodeTable};
use crate::transport::{Packet, Stream, Transport};
use crate::GossipError;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

// ---------------------------------------------------------------------------
// Membership broadcasts
// ---------------------------------------------------------------------------

/// A state message about one node. Newer messages about the same node
/// replace older ones in the queue.
struct MemberBroadcast {
    node: String,
    msg: Vec<u8>,
    notify: Mutex<Option<oneshot::Sender<()>>>,
}

impl Broadcast for MemberBroadcast {
    fn message(&self) -> &[u8] {
        &self.msg
    }

    fn name(&self) -> Option<&str> {
        Some(&self.node)
    }

    fn finished(&self) {
        if let Some(tx) = self.notify.lock().take() {
            let _ = tx.send(());
        }
    }
}

enum Change {
    Join(Node),
    Leave(Node),
    Update(Node),
}

// ---------------------------------------------------------------------------
// Memberlist
// ---------------------------------------------------------------------------

/// A running gossip member. Cheap to clone.
///
/// Background tasks hold a reference to the shared state, so a memberlist
/// lives until [`Memberlist::shutdown`] is called.
pub struct Memberlist<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Memberlist<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> std::fmt::Debug for Memberlist<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memberlist")
            .field("name", &self.inner.config.name)
            .field("advertise", &self.inner.advertise)
            .finish_non_exhaustive()
    }
}

/// A non-owning handle, for callbacks the memberlist itself keeps alive.
pub struct WeakMemberlist<T: Transport> {
    inner: Weak<Inner<T>>,
}

impl<T: Transport> Clone for WeakMemberlist<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> WeakMemberlist<T> {
    pub fn upgrade(&self) -> Option<Memberlist<T>> {
        self.inner.upgrade().map(|inner| Memberlist { inner })
    }
}

struct Inner<T: Transport> {
    config: GossipConfig,
    transport: Arc<T>,
    delegate: Option<Arc<dyn Delegate>>,
    events: Option<Arc<dyn EventDelegate>>,
    advertise: SocketAddr,

    nodes: RwLock<NodeTable>,
    num_nodes: Arc<AtomicUsize>,
    seq_no: AtomicU32,
    incarnation: AtomicU32,
    ack_handlers: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    broadcasts: TransmitLimitedQueue,

    leaving: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> Memberlist<T> {
    /// Start a member on `transport`. Must be called inside a tokio runtime.
    pub fn create(
        config: GossipConfig,
        transport: T,
        delegate: Option<Arc<dyn Delegate>>,
        events: Option<Arc<dyn EventDelegate>>,
    ) -> Result<Self, GossipError> {
        config.validate()?;

        let packet_rx = transport
            .packet_rx()
            .ok_or_else(|| GossipError::Transport("packet channel already taken".into()))?;
        let stream_rx = transport
            .stream_rx()
            .ok_or_else(|| GossipError::Transport("stream channel already taken".into()))?;
        let advertise = transport.final_advertise_addr(config.advertise_addr, config.advertise_port)?;

        let meta = delegate
            .as_ref()
            .map(|d| d.node_meta(META_MAX_SIZE))
            .unwrap_or_default();
        if meta.len() > META_MAX_SIZE {
            return Err(GossipError::MetaTooLarge(meta.len()));
        }

        let num_nodes = Arc::new(AtomicUsize::new(0));
        let counter = num_nodes.clone();
        let broadcasts =
            TransmitLimitedQueue::new(config.retransmit_mult, move || counter.load(Ordering::Relaxed));
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            nodes: RwLock::new(NodeTable::new(config.name.clone())),
            config,
            transport: Arc::new(transport),
            delegate,
            events,
            advertise,
            num_nodes,
            seq_no: AtomicU32::new(0),
            incarnation: AtomicU32::new(0),
            ack_handlers: Mutex::new(HashMap::new()),
            broadcasts,
            leaving: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let incarnation = inner.incarnation.fetch_add(1, Ordering::SeqCst) + 1;
        inner.alive_node(
            Alive {
                incarnation,
                node: inner.config.name.clone(),
                addr: advertise,
                meta,
            },
            true,
        );
        inner.spawn_background(packet_rx, stream_rx);

        tracing::info!(
            "memberlist {} started, advertising {}",
            inner.config.name,
            advertise
        );
        Ok(Self { inner })
    }

    pub fn local_node(&self) -> Node {
        let table = self.inner.nodes.read();
        match table.get(&self.inner.config.name) {
            Some(rec) => rec.node.clone(),
            None => Node {
                name: self.inner.config.name.clone(),
                addr: self.inner.advertise,
                meta: Vec::new(),
                state: NodeState::Alive,
                incarnation: self.inner.incarnation.load(Ordering::SeqCst),
            },
        }
    }

    pub fn downgrade(&self) -> WeakMemberlist<T> {
        WeakMemberlist {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn advertise_addr(&self) -> SocketAddr {
        self.inner.advertise
    }

    /// Alive and suspect nodes, the local node included.
    pub fn members(&self) -> Vec<Node> {
        self.inner.nodes.read().members()
    }

    pub fn num_members(&self) -> usize {
        self.inner.nodes.read().live_count()
    }

    /// Push-pull with each address. Returns how many exchanges succeeded;
    /// fails only if every address failed.
    pub async fn join(&self, addrs: &[SocketAddr]) -> Result<usize, GossipError> {
        let mut joined = 0;
        let mut errors = Vec::new();
        for addr in addrs {
            match self.inner.push_pull_node(*addr, true).await {
                Ok(()) => joined += 1,
                Err(e) => {
                    tracing::warn!("failed to join {}: {}", addr, e);
                    errors.push(format!("{}: {}", addr, e));
                }
            }
        }
        if joined == 0 && !addrs.is_empty() {
            return Err(GossipError::JoinFailed(errors.join("; ")));
        }
        Ok(joined)
    }

    /// Announce that this node is leaving and wait, up to `timeout`, for
    /// the announcement to be disseminated. Background tasks keep running
    /// until [`Memberlist::shutdown`].
    pub async fn leave(&self, timeout: Duration) -> Result<(), GossipError> {
        if self.inner.leaving.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        let name = self.inner.config.name.clone();
        let incarnation = self.inner.incarnation.load(Ordering::SeqCst);
        self.inner.dead_node(
            Dead {
                incarnation,
                node: name.clone(),
                from: name,
            },
            Some(tx),
        );

        if self.num_members() == 0 {
            return Ok(());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(_) => {
                tracing::info!("leave broadcast disseminated");
                Ok(())
            }
            Err(_) => Err(GossipError::Timeout("waiting for leave broadcast".into())),
        }
    }

    /// Stop all background tasks and the transport. Idempotent.
    pub async fn shutdown(&self) -> Result<(), GossipError> {
        if self.inner.shutdown_tx.send_replace(true) {
            return Ok(());
        }
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            task.abort();
        }
        self.inner.transport.shutdown().await?;
        tracing::info!("memberlist {} shut down", self.inner.config.name);
        Ok(())
    }

    /// Send a user message straight to `addr`, outside the broadcast queue.
    pub async fn send_best_effort(&self, addr: SocketAddr, msg: &[u8]) -> Result<(), GossipError> {
        self.inner
            .send_msg(addr, &Message::User(msg.to_vec()))
            .await
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

impl<T: Transport> Inner<T> {
    fn spawn_background(
        self: &Arc<Self>,
        mut packet_rx: mpsc::Receiver<Packet>,
        mut stream_rx: mpsc::Receiver<Stream>,
    ) {
        let mut tasks = Vec::new();

        let this = self.clone();
        let mut stop = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    packet = packet_rx.recv() => match packet {
                        Some(p) => this.handle_packet(p),
                        None => break,
                    },
                    _ = stop.changed() => break,
                }
            }
        }));

        let this = self.clone();
        let mut stop = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    stream = stream_rx.recv() => match stream {
                        Some(s) => {
                            let this = this.clone();
                            tokio::spawn(async move {
                                if let Err(e) = this.handle_stream(s).await {
                                    tracing::warn!("push-pull stream failed: {}", e);
                                }
                            });
                        }
                        None => break,
                    },
                    _ = stop.changed() => break,
                }
            }
        }));

        tasks.push(self.every(self.config.probe_interval, |this| async move {
            this.probe().await
        }));
        tasks.push(self.every(self.config.gossip_interval, |this| async move {
            this.gossip().await;
            this.reap();
        }));
        if !self.config.push_pull_interval.is_zero() {
            tasks.push(self.every(self.config.push_pull_interval, |this| async move {
                this.push_pull().await
            }));
        }

        self.tasks.lock().extend(tasks);
    }

    fn every<F, Fut>(self: &Arc<Self>, period: Duration, f: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let this = self.clone();
        let mut stop = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => f(this.clone()).await,
                    _ = stop.changed() => break,
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Failure detection
    // -----------------------------------------------------------------------

    async fn probe(self: Arc<Self>) {
        let target = self.nodes.write().next_probe_target();
        if let Some(target) = target {
            self.probe_node(target).await;
        }
    }

    async fn probe_node(&self, target: Node) {
        let seq_no = self.next_seq_no();
        let (tx, mut rx) = oneshot::channel();
        self.ack_handlers.lock().insert(seq_no, tx);

        let sent_at = Instant::now();
        let ping = Message::Ping {
            seq_no,
            node: target.name.clone(),
        };
        if let Err(e) = self.send_msg(target.addr, &ping).await {
            tracing::debug!("ping to {} failed: {}", target.name, e);
        }

        let acked = |r: Result<Result<(), oneshot::error::RecvError>, _>| matches!(r, Ok(Ok(())));

        if acked(tokio::time::timeout_at(sent_at + self.config.probe_timeout, &mut rx).await) {
            return;
        }

        let helpers = self.nodes.read().random_nodes(self.config.indirect_checks, |n| {
            n.state == NodeState::Alive && n.name != target.name
        });
        let indirect = Message::IndirectPing {
            seq_no,
            target: target.name.clone(),
            target_addr: target.addr,
        };
        let sends = helpers.iter().map(|helper| {
            let indirect = &indirect;
            async move {
                if let Err(e) = self.send_msg(helper.addr, indirect).await {
                    tracing::debug!("indirect ping via {} failed: {}", helper.name, e);
                }
            }
        });
        futures::future::join_all(sends).await;

        let ok = acked(tokio::time::timeout_at(sent_at + self.config.probe_interval, &mut rx).await);
        self.ack_handlers.lock().remove(&seq_no);
        if ok {
            return;
        }

        tracing::info!(
            "no ack from {} ({} indirect checks), marking suspect",
            target.name,
            helpers.len()
        );
        self.suspect_node(Suspect {
            incarnation: target.incarnation,
            node: target.name,
            from: self.config.name.clone(),
        });
    }

    /// Ping `target` for a peer and ack the peer if the target answers.
    async fn indirect_probe(&self, seq_no: u32, target: String, target_addr: SocketAddr, from: SocketAddr) {
        let local_seq = self.next_seq_no();
        let (tx, rx) = oneshot::channel();
        self.ack_handlers.lock().insert(local_seq, tx);

        let ping = Message::Ping {
            seq_no: local_seq,
            node: target.clone(),
        };
        if let Err(e) = self.send_msg(target_addr, &ping).await {
            tracing::debug!("indirect ping to {} failed: {}", target, e);
        }

        let res = tokio::time::timeout(self.config.probe_timeout, rx).await;
        self.ack_handlers.lock().remove(&local_seq);
        if matches!(res, Ok(Ok(()))) {
            if let Err(e) = self.send_msg(from, &Message::Ack { seq_no }).await {
                tracing::debug!("forwarding ack to {} failed: {}", from, e);
            }
        }
    }

    /// Declare suspects dead once their timeout lapses; forget old dead nodes.
    fn reap(&self) {
        let now = Instant::now();
        let expired = self.nodes.read().expired_suspects(now);
        for (node, incarnation) in expired {
            tracing::info!("suspicion timeout for {}, marking dead", node);
            self.dead_node(
                Dead {
                    incarnation,
                    node,
                    from: self.config.name.clone(),
                },
                None,
            );
        }

        let gone = self
            .nodes
            .write()
            .reap(now, self.config.gossip_to_the_dead_time);
        for name in gone {
            tracing::debug!("reaped node {}", name);
        }
    }

    // -----------------------------------------------------------------------
    // Gossip
    // -----------------------------------------------------------------------

    async fn gossip(&self) {
        let targets = self.nodes.read().gossip_targets(
            self.config.gossip_nodes,
            Instant::now(),
            self.config.gossip_to_the_dead_time,
        );
        let mut packets = Vec::with_capacity(targets.len());
        for target in targets {
            let Some(packet) = self.build_gossip_packet() else {
                break;
            };
            packets.push((target, packet));
        }

        let sends = packets.iter().map(|(target, packet)| async move {
            if let Err(e) = self.send_packet(packet, target.addr).await {
                tracing::debug!("gossip to {} failed: {}", target.name, e);
            }
        });
        futures::future::join_all(sends).await;
    }

    /// Membership broadcasts first, then user broadcasts in what is left.
    fn build_gossip_packet(&self) -> Option<Vec<u8>> {
        let budget = self.config.packet_budget.saturating_sub(COMPOUND_OVERHEAD);
        let mut parts = self.broadcasts.get_broadcasts(MESSAGE_OVERHEAD, budget);
        let used: usize = parts.iter().map(|p| p.len() + MESSAGE_OVERHEAD).sum();

        if let Some(delegate) = &self.delegate {
            let overhead = 2 * MESSAGE_OVERHEAD;
            for msg in delegate.get_broadcasts(overhead, budget.saturating_sub(used)) {
                match message::encode(&Message::User(msg)) {
                    Ok(buf) => parts.push(buf),
                    Err(e) => tracing::error!("failed to encode user broadcast: {}", e),
                }
            }
        }

        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => match message::compound(parts) {
                Ok(buf) => Some(buf),
                Err(e) => {
                    tracing::error!("failed to encode compound packet: {}", e);
                    None
                }
            },
        }
    }

    // -----------------------------------------------------------------------
    // Push-pull
    // -----------------------------------------------------------------------

    async fn push_pull(self: Arc<Self>) {
        let target = self
            .nodes
            .read()
            .random_nodes(1, |n| n.state == NodeState::Alive)
            .pop();
        if let Some(target) = target {
            if let Err(e) = self.push_pull_node(target.addr, false).await {
                tracing::warn!("push-pull with {} failed: {}", target.name, e);
            }
        }
    }

    async fn push_pull_node(&self, addr: SocketAddr, join: bool) -> Result<(), GossipError> {
        let timeout = self.config.tcp_timeout;
        let local = self.local_push_pull(join);
        let remote: PushPull = tokio::time::timeout(timeout, async {
            let mut stream = self.transport.dial_timeout(addr, timeout).await?;
            message::write_frame(&mut stream, &local).await?;
            message::read_frame::<_, PushPull>(&mut stream).await
        })
        .await
        .map_err(|_| GossipError::Timeout(format!("push-pull with {}", addr)))??;

        self.merge_push_pull(remote);
        Ok(())
    }

    async fn handle_stream(self: Arc<Self>, mut stream: Stream) -> Result<(), GossipError> {
        let timeout = self.config.tcp_timeout;
        let remote = tokio::time::timeout(timeout, message::read_frame::<_, PushPull>(&mut stream))
            .await
            .map_err(|_| GossipError::Timeout("reading push-pull".into()))??;

        let reply = self.local_push_pull(remote.join);
        tokio::time::timeout(timeout, message::write_frame(&mut stream, &reply))
            .await
            .map_err(|_| GossipError::Timeout("writing push-pull".into()))??;

        self.merge_push_pull(remote);
        Ok(())
    }

    fn local_push_pull(&self, join: bool) -> PushPull {
        let nodes = self.nodes.read().all();
        let user_state = self
            .delegate
            .as_ref()
            .map(|d| d.local_state(join))
            .unwrap_or_default();
        PushPull {
            join,
            nodes,
            user_state,
        }
    }

    fn merge_push_pull(&self, remote: PushPull) {
        for node in remote.nodes {
            match node.state {
                NodeState::Alive => self.alive_node(
                    Alive {
                        incarnation: node.incarnation,
                        node: node.name,
                        addr: node.addr,
                        meta: node.meta,
                    },
                    false,
                ),
                NodeState::Left => self.dead_node(
                    Dead {
                        incarnation: node.incarnation,
                        node: node.name.clone(),
                        from: node.name,
                    },
                    None,
                ),
                // Another node's failure verdict is only a suspicion here.
                NodeState::Dead | NodeState::Suspect => self.suspect_node(Suspect {
                    incarnation: node.incarnation,
                    node: node.name,
                    from: self.config.name.clone(),
                }),
            }
        }

        if !remote.user_state.is_empty() {
            if let Some(delegate) = &self.delegate {
                delegate.merge_remote_state(&remote.user_state, remote.join);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Packets
    // -----------------------------------------------------------------------

    fn handle_packet(self: &Arc<Self>, packet: Packet) {
        match message::decode::<Message>(&packet.buf) {
            Ok(msg) => self.handle_message(msg, packet.from),
            Err(e) => tracing::warn!("dropping undecodable packet from {}: {}", packet.from, e),
        }
    }

    fn handle_message(self: &Arc<Self>, msg: Message, from: SocketAddr) {
        match msg {
            Message::Compound(parts) => {
                for part in parts {
                    match message::decode::<Message>(&part) {
                        Ok(msg) => self.handle_message(msg, from),
                        Err(e) => tracing::warn!("dropping compound part from {}: {}", from, e),
                    }
                }
            }
            Message::Ping { seq_no, node } => {
                if !node.is_empty() && node != self.config.name {
                    tracing::warn!("got ping for {} but we are {}", node, self.config.name);
                    return;
                }
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.send_msg(from, &Message::Ack { seq_no }).await {
                        tracing::debug!("ack to {} failed: {}", from, e);
                    }
                });
            }
            Message::IndirectPing {
                seq_no,
                target,
                target_addr,
            } => {
                let this = self.clone();
                tokio::spawn(async move {
                    this.indirect_probe(seq_no, target, target_addr, from).await;
                });
            }
            Message::Ack { seq_no } => {
                if let Some(tx) = self.ack_handlers.lock().remove(&seq_no) {
                    let _ = tx.send(());
                }
            }
            Message::Alive(a) => self.alive_node(a, false),
            Message::Suspect(s) => self.suspect_node(s),
            Message::Dead(d) => self.dead_node(d, None),
            Message::User(buf) => {
                if let Some(delegate) = &self.delegate {
                    delegate.notify_msg(&buf);
                }
            }
        }
    }

    async fn send_msg(&self, addr: SocketAddr, msg: &Message) -> Result<(), GossipError> {
        let buf = message::encode(msg)?;
        self.send_packet(&buf, addr).await
    }

    /// Write one packet, giving up after `probe_timeout`. An unresponsive
    /// peer must not hold up the protocol tasks.
    async fn send_packet(&self, buf: &[u8], addr: SocketAddr) -> Result<(), GossipError> {
        match tokio::time::timeout(self.config.probe_timeout, self.transport.write_to(buf, addr))
            .await
        {
            Ok(sent) => sent.map(|_| ()),
            Err(_) => Err(GossipError::Timeout(format!("packet to {}", addr))),
        }
    }

    fn next_seq_no(&self) -> u32 {
        self.seq_no.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    // -----------------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------------

    fn alive_node(&self, a: Alive, bootstrap: bool) {
        if a.node == self.config.name && !bootstrap {
            let ours = self.incarnation.load(Ordering::SeqCst);
            if a.incarnation > ours || (a.incarnation == ours && a.addr != self.advertise) {
                self.refute(a.incarnation);
            }
            return;
        }

        let now = Instant::now();
        let change = {
            let mut table = self.nodes.write();
            let change = match table.get_mut(&a.node) {
                None => {
                    let node = Node {
                        name: a.node.clone(),
                        addr: a.addr,
                        meta: a.meta.clone(),
                        state: NodeState::Alive,
                        incarnation: a.incarnation,
                    };
                    table.insert(NodeRecord::new(node.clone(), now));
                    Some(Change::Join(node))
                }
                Some(rec) => {
                    if !bootstrap && a.incarnation <= rec.node.incarnation {
                        return;
                    }
                    let was_live = rec.node.state.is_live();
                    let changed = rec.node.meta != a.meta || rec.node.addr != a.addr;
                    rec.node.incarnation = a.incarnation;
                    rec.node.meta = a.meta.clone();
                    rec.node.addr = a.addr;
                    rec.suspect_deadline = None;
                    rec.set_state(NodeState::Alive, now);
                    if !was_live {
                        Some(Change::Join(rec.node.clone()))
                    } else if changed {
                        Some(Change::Update(rec.node.clone()))
                    } else {
                        None
                    }
                }
            };
            self.num_nodes.store(table.live_count(), Ordering::Relaxed);
            change
        };

        let name = a.node.clone();
        self.queue_member_broadcast(&name, &Message::Alive(a), None);
        if let Some(change) = change {
            self.notify(change);
        }
    }

    fn suspect_node(&self, s: Suspect) {
        let now = Instant::now();
        {
            let mut table = self.nodes.write();
            let num_nodes = table.live_count();
            let Some(rec) = table.get_mut(&s.node) else {
                return;
            };
            if s.incarnation < rec.node.incarnation || rec.node.state != NodeState::Alive {
                return;
            }
            if s.node != self.config.name {
                rec.node.incarnation = s.incarnation;
                rec.set_state(NodeState::Suspect, now);
                rec.suspect_deadline = Some(now + self.config.suspicion_timeout(num_nodes));
            }
        }

        if s.node == self.config.name {
            if !self.leaving.load(Ordering::SeqCst) {
                self.refute(s.incarnation);
            }
            return;
        }

        tracing::info!("marking {} as suspect (reported by {})", s.node, s.from);
        let name = s.node.clone();
        self.queue_member_broadcast(&name, &Message::Suspect(s), None);
    }

    fn dead_node(&self, d: Dead, notify: Option<oneshot::Sender<()>>) {
        let is_local = d.node == self.config.name;
        if is_local && !self.leaving.load(Ordering::SeqCst) {
            let known_live = self
                .nodes
                .read()
                .get(&d.node)
                .is_some_and(|r| r.node.state.is_live());
            if known_live && d.incarnation >= self.incarnation.load(Ordering::SeqCst) {
                self.refute(d.incarnation);
            }
            return;
        }

        let now = Instant::now();
        let node = {
            let mut table = self.nodes.write();
            let Some(rec) = table.get_mut(&d.node) else {
                return;
            };
            if d.incarnation < rec.node.incarnation || !rec.node.state.is_live() {
                return;
            }
            let state = if d.node == d.from {
                NodeState::Left
            } else {
                NodeState::Dead
            };
            rec.node.incarnation = d.incarnation;
            rec.suspect_deadline = None;
            rec.set_state(state, now);
            let node = rec.node.clone();
            self.num_nodes.store(table.live_count(), Ordering::Relaxed);
            node
        };

        if node.state == NodeState::Left {
            tracing::info!("node {} left the cluster", node.name);
        } else {
            tracing::info!("node {} declared dead by {}", node.name, d.from);
        }
        let name = d.node.clone();
        self.queue_member_broadcast(&name, &Message::Dead(d), notify);
        self.notify(Change::Leave(node));
    }

    /// Answer a claim about ourselves with a higher incarnation.
    fn refute(&self, accused: u32) {
        let prev = self
            .incarnation
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                Some(cur.max(accused) + 1)
            })
            .unwrap_or(accused);
        let incarnation = prev.max(accused) + 1;

        let meta = {
            let mut table = self.nodes.write();
            match table.get_mut(&self.config.name) {
                Some(rec) => {
                    rec.node.incarnation = incarnation;
                    rec.set_state(NodeState::Alive, Instant::now());
                    rec.node.meta.clone()
                }
                None => Vec::new(),
            }
        };

        tracing::warn!(
            "refuting claim about {} with incarnation {}",
            self.config.name,
            incarnation
        );
        let alive = Alive {
            incarnation,
            node: self.config.name.clone(),
            addr: self.advertise,
            meta,
        };
        self.queue_member_broadcast(&self.config.name, &Message::Alive(alive), None);
    }

    fn queue_member_broadcast(
        &self,
        node: &str,
        msg: &Message,
        notify: Option<oneshot::Sender<()>>,
    ) {
        match message::encode(msg) {
            Ok(buf) => self.broadcasts.queue_broadcast(Box::new(MemberBroadcast {
                node: node.to_string(),
                msg: buf,
                notify: Mutex::new(notify),
            })),
            Err(e) => tracing::error!("failed to encode membership broadcast: {}", e),
        }
    }

    fn notify(&self, change: Change) {
        let Some(events) = &self.events else {
            return;
        };
        match change {
            Change::Join(node) => events.notify_join(&node),
            Change::Leave(node) => events.notify_leave(&node),
            Change::Update(node) => events.notify_update(&node),
        }
    }
}
