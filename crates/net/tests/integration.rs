//! Integration test: run the gossip memberlist over real loopback sockets
//! and check that members converge and user messages get through.

use orkv_gossip::{Delegate, GossipConfig, Memberlist, NodeState};
use orkv_net::{WebTransport, WebTransportConfig};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Default)]
struct Inbox {
    messages: Mutex<Vec<Vec<u8>>>,
    remote_state: Mutex<Vec<Vec<u8>>>,
    state: Vec<u8>,
}

impl Delegate for Inbox {
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }

    fn notify_msg(&self, msg: &[u8]) {
        self.messages.lock().push(msg.to_vec());
    }

    fn get_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        self.state.clone()
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        if join {
            self.remote_state.lock().push(buf.to_vec());
        }
    }
}

async fn spawn_member(name: &str, inbox: Arc<Inbox>) -> Memberlist<WebTransport> {
    let transport = WebTransport::bind(WebTransportConfig {
        bind_addrs: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        bind_port: 0,
        request_timeout: Duration::from_secs(2),
        max_packet: 64 * 1024,
    })
    .await
    .unwrap();
    let config = GossipConfig::default_local().with_name(name);
    Memberlist::create(config, transport, Some(inbox), None).unwrap()
}

async fn wait_for_members(lists: &[&Memberlist<WebTransport>], n: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if lists.iter().all(|m| m.num_members() == n) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "members did not converge: {:?}",
        lists.iter().map(|m| m.num_members()).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_two_members_join_over_http() {
    let a_inbox = Arc::new(Inbox {
        state: b"state-of-a".to_vec(),
        ..Inbox::default()
    });
    let b_inbox = Arc::new(Inbox::default());
    let a = spawn_member("a", a_inbox.clone()).await;
    let b = spawn_member("b", b_inbox.clone()).await;

    let joined = b.join(&[a.advertise_addr()]).await.unwrap();
    assert_eq!(joined, 1);
    wait_for_members(&[&a, &b], 2).await;

    // The join push-pull carried a's user state to b.
    assert!(b_inbox
        .remote_state
        .lock()
        .iter()
        .any(|s| s == b"state-of-a"));

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_three_members_converge() {
    let a = spawn_member("a", Arc::new(Inbox::default())).await;
    let b = spawn_member("b", Arc::new(Inbox::default())).await;
    let c = spawn_member("c", Arc::new(Inbox::default())).await;

    b.join(&[a.advertise_addr()]).await.unwrap();
    c.join(&[b.advertise_addr()]).await.unwrap();
    wait_for_members(&[&a, &b, &c], 3).await;

    for m in [&a, &b, &c] {
        assert!(m
            .members()
            .iter()
            .all(|n| n.state == NodeState::Alive));
    }

    for m in [&a, &b, &c] {
        m.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_user_message_delivered() {
    let b_inbox = Arc::new(Inbox::default());
    let a = spawn_member("a", Arc::new(Inbox::default())).await;
    let b = spawn_member("b", b_inbox.clone()).await;
    b.join(&[a.advertise_addr()]).await.unwrap();

    a.send_best_effort(b.advertise_addr(), b"direct")
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while b_inbox.messages.lock().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(b_inbox.messages.lock().as_slice(), &[b"direct".to_vec()]);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_join_unreachable_fails() {
    let a = spawn_member("a", Arc::new(Inbox::default())).await;
    let b = spawn_member("b", Arc::new(Inbox::default())).await;
    let gone = b.advertise_addr();
    b.shutdown().await.unwrap();

    assert!(a.join(&[gone]).await.is_err());
    assert_eq!(a.num_members(), 1);
    a.shutdown().await.unwrap();
}
