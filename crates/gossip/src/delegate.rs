//! Hooks the application plugs into the memberlist.

use crate::state::Node;

/// Application payload hooks. Called from memberlist tasks; must not block.
pub trait Delegate: Send + Sync + 'static {
    /// Metadata advertised with the local node; at most `limit` bytes.
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// A user message arrived.
    fn notify_msg(&self, msg: &[u8]);

    /// User broadcasts to piggyback on the next gossip packet.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Application state sent during push-pull.
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// Application state received during push-pull.
    fn merge_remote_state(&self, buf: &[u8], join: bool);
}

/// Membership change notifications.
pub trait EventDelegate: Send + Sync + 'static {
    fn notify_join(&self, node: &Node);
    fn notify_leave(&self, node: &Node);
    fn notify_update(&self, node: &Node);
}
