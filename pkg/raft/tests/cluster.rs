//! Multi-node scenarios (§8) driven against in-memory fakes of the two
//! external collaborators (`Wal`, `Transport`). Neither fake is part of the
//! public API; they exist only to give the driver state machine something
//! to talk to without a real disk or network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use raft::config::NodeConfig;
use raft::node::{Committed, InitialState, Node};
use raft::transport::MessageHandler;
use raft::wal::WalState;
use raft::{LogIndex, NodeError, PeerState, Role, Transport, Wal};

struct FakeWalState {
    first: LogIndex,
    entries: Vec<Bytes>,
}

struct FakeWal {
    state: Mutex<FakeWalState>,
}

impl FakeWal {
    fn new() -> Arc<Self> {
        Arc::new(FakeWal { state: Mutex::new(FakeWalState { first: 1, entries: Vec::new() }) })
    }
}

#[async_trait]
impl Wal for FakeWal {
    async fn append(&self, payload: Bytes) -> Result<LogIndex, NodeError> {
        let mut s = self.state.lock();
        s.entries.push(payload);
        Ok(s.first + s.entries.len() as u64 - 1)
    }

    async fn load(&self, seq: LogIndex) -> Result<Bytes, NodeError> {
        let s = self.state.lock();
        if seq < s.first || seq >= s.first + s.entries.len() as u64 {
            return Err(NodeError::EntryLoadFailed(seq));
        }
        Ok(s.entries[(seq - s.first) as usize].clone())
    }

    async fn remove(&self, seq: LogIndex) -> Result<bool, NodeError> {
        let mut s = self.state.lock();
        if seq < s.first || seq >= s.first + s.entries.len() as u64 {
            return Ok(false);
        }
        s.entries.remove((seq - s.first) as usize);
        Ok(true)
    }

    async fn compact(&self, seq: LogIndex) -> Result<LogIndex, NodeError> {
        let mut s = self.state.lock();
        if seq >= s.first {
            let drop_n = ((seq - s.first + 1) as usize).min(s.entries.len());
            s.entries.drain(0..drop_n);
            s.first += drop_n as u64;
        }
        Ok(s.first)
    }

    async fn truncate(&self, seq: LogIndex) -> Result<(), NodeError> {
        let mut s = self.state.lock();
        if seq >= s.first {
            s.entries.truncate((seq - s.first + 1) as usize);
        } else {
            s.entries.clear();
        }
        Ok(())
    }

    async fn state(&self) -> WalState {
        let s = self.state.lock();
        let last = if s.entries.is_empty() { s.first.saturating_sub(1) } else { s.first + s.entries.len() as u64 - 1 };
        WalState {
            first: s.first,
            last,
            count: s.entries.len() as u64,
            bytes: s.entries.iter().map(|e| e.len() as u64).sum(),
        }
    }

    async fn stop(&self) {}

    async fn delete(&self) {
        let mut s = self.state.lock();
        s.entries.clear();
    }
}

type Broker = Arc<Mutex<HashMap<String, Vec<MessageHandler>>>>;

#[derive(Clone)]
struct FakeTransport {
    broker: Broker,
}

impl FakeTransport {
    fn new_broker() -> Broker {
        Arc::new(Mutex::new(HashMap::new()))
    }
}

struct FakeSubscription {
    broker: Broker,
    subject: String,
    handler: MessageHandler,
}

impl raft::transport::Subscription for FakeSubscription {
    fn unsubscribe(&self) {
        let mut map = self.broker.lock();
        if let Some(v) = map.get_mut(&self.subject) {
            v.retain(|h| !Arc::ptr_eq(h, &self.handler));
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn publish(&self, subject: &str, reply_to: Option<&str>, payload: Bytes) -> Result<(), NodeError> {
        let handlers: Vec<MessageHandler> = {
            let map = self.broker.lock();
            map.get(subject).cloned().unwrap_or_default()
        };
        for h in handlers {
            h(subject, reply_to, payload.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<Box<dyn raft::transport::Subscription>, NodeError> {
        self.broker.lock().entry(subject.to_string()).or_default().push(handler.clone());
        Ok(Box::new(FakeSubscription { broker: self.broker.clone(), subject: subject.to_string(), handler }))
    }
}

fn fast_config() -> NodeConfig {
    NodeConfig {
        election_timeout: (Duration::from_millis(40), Duration::from_millis(80)),
        heartbeat_interval: Duration::from_millis(15),
        campaign_backoff: (Duration::from_millis(5), Duration::from_millis(15)),
        ..NodeConfig::default()
    }
}

async fn spawn_node(
    id: u64,
    group: &str,
    broker: Broker,
    peer_state: PeerState,
) -> (Node, tokio::sync::mpsc::Receiver<Committed>, tokio::sync::watch::Receiver<bool>) {
    let dir = tempfile::tempdir().unwrap();
    let init = InitialState {
        id,
        group: group.to_string(),
        store_dir: dir.path().to_path_buf(),
        wal: FakeWal::new(),
        transport: Arc::new(FakeTransport { broker }),
        config: fast_config(),
        bootstrap_peers: Some(peer_state),
    };
    // Leak the tempdir so the store survives for the life of the test node;
    // these are single-use throwaway directories per test process.
    std::mem::forget(dir);
    let (node, apply_rx, lead_rx, _quit_rx) = Node::spawn(init).await.unwrap();
    (node, apply_rx, lead_rx)
}

async fn expect_end_of_replay(rx: &mut tokio::sync::mpsc::Receiver<Committed>) {
    let marker = rx.recv().await.expect("channel open");
    assert!(raft::node::is_end_of_replay(&marker));
}

#[tokio::test]
async fn single_node_propose_is_committed_and_delivered() {
    let broker = FakeTransport::new_broker();
    let (node, mut apply_rx, _lead_rx) = spawn_node(1, "solo", broker, PeerState::single(1)).await;
    expect_end_of_replay(&mut apply_rx).await;

    // A lone node's first election timeout wins immediately (quorum of 1).
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(node.state(), Role::Leader);

    let index = node.propose(Bytes::from_static(b"hello")).await.unwrap();
    assert!(index > 0);

    let committed = tokio::time::timeout(Duration::from_secs(1), apply_rx.recv())
        .await
        .expect("commit delivered in time")
        .expect("channel open");
    assert_eq!(committed.index, index);
    match &committed.entries[..] {
        [raft::Entry::Normal(b)] => assert_eq!(b.as_ref(), b"hello"),
        other => panic!("unexpected entries: {other:?}"),
    }
}

#[tokio::test]
async fn three_node_cluster_elects_one_leader_and_replicates() {
    let broker = FakeTransport::new_broker();
    let peer_state = PeerState { cluster_size: 3, peers: vec![1, 2, 3] };

    let (n1, mut a1, _l1) = spawn_node(1, "trio", broker.clone(), peer_state.clone()).await;
    let (n2, mut a2, _l2) = spawn_node(2, "trio", broker.clone(), peer_state.clone()).await;
    let (n3, mut a3, _l3) = spawn_node(3, "trio", broker.clone(), peer_state).await;
    expect_end_of_replay(&mut a1).await;
    expect_end_of_replay(&mut a2).await;
    expect_end_of_replay(&mut a3).await;

    let nodes = [&n1, &n2, &n3];
    let mut leader = None;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Some(n) = nodes.iter().find(|n| n.state() == Role::Leader) {
            leader = Some(*n);
            break;
        }
    }
    let leader = leader.expect("a leader was elected within the deadline");

    let index = leader.propose(Bytes::from_static(b"order-42")).await.unwrap();

    for rx in [&mut a1, &mut a2, &mut a3] {
        let committed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let c = rx.recv().await.expect("channel open");
                if c.index == index {
                    return c;
                }
            }
        })
        .await
        .expect("every node eventually sees the commit");
        match &committed.entries[..] {
            [raft::Entry::Normal(b)] => assert_eq!(b.as_ref(), b"order-42"),
            other => panic!("unexpected entries: {other:?}"),
        }
    }
}

#[tokio::test]
async fn stepping_down_leader_clears_leadership_and_stops_heartbeats() {
    let broker = FakeTransport::new_broker();
    let (node, mut apply_rx, _lead_rx) = spawn_node(1, "solo-stepdown", broker, PeerState::single(1)).await;
    expect_end_of_replay(&mut apply_rx).await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(node.state(), Role::Leader);

    node.step_down(Vec::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(node.state(), Role::Follower);
}
