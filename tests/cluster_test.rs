// Multi-node cluster scenarios over the in-process transport.
//
// These tests exercise whole nodes end to end: elections, replication,
// restarts, partitions, log conflict resolution, and snapshot recovery.

use rusty_raft::message::{
    AppendEntriesArgs, AppendEntriesReply, Message, RequestVoteArgs, RequestVoteReply,
};
use rusty_raft::transport::Transport;
use rusty_raft::{
    EntryPayload, KvCommand, KvStore, LogEntry, MemoryKv, MemoryNetwork, MemoryStorage, RaftConfig,
    RaftNode, RaftRole,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

const POLL: Duration = Duration::from_millis(20);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct TestNode {
    id: String,
    node: Arc<RaftNode>,
    kv: MemoryKv,
    storage: MemoryStorage,
}

impl TestNode {
    async fn start(network: &MemoryNetwork, id: &str, peers: &[&str], seed: u64) -> Self {
        Self::start_with_storage(network, id, peers, seed, MemoryStorage::new()).await
    }

    async fn start_with_storage(
        network: &MemoryNetwork,
        id: &str,
        peers: &[&str],
        seed: u64,
        storage: MemoryStorage,
    ) -> Self {
        let mut config = RaftConfig::new(
            id,
            peers.iter().map(|p| p.to_string()).collect(),
            format!("/tmp/rustyraft-cluster-test/{id}"),
        );
        config.rng_seed = Some(seed);

        let kv = MemoryKv::new();
        let node = RaftNode::start(
            config,
            Box::new(kv.clone()),
            Arc::new(storage.clone()),
            Arc::new(network.join(id)),
        )
        .await
        .expect("node should start");

        Self { id: id.to_string(), node: Arc::new(node), kv, storage }
    }

    fn store(&self) -> KvStore {
        KvStore::new(self.node.clone(), self.kv.clone())
    }
}

/// Poll a synchronous predicate until it holds or the deadline passes.
async fn wait_sync(what: &str, limit: Duration, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        sleep(POLL).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for_role(node: &RaftNode, role: RaftRole, limit: Duration) {
    let deadline = Instant::now() + limit;
    loop {
        if node.get_state().await.1 == role {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for role {role}");
        }
        sleep(POLL).await;
    }
}

async fn wait_for_leader(nodes: &[TestNode], limit: Duration) -> usize {
    let deadline = Instant::now() + limit;
    loop {
        for (i, n) in nodes.iter().enumerate() {
            if n.node.is_leader().await {
                return i;
            }
        }
        if Instant::now() >= deadline {
            panic!("no leader elected within {limit:?}");
        }
        sleep(POLL).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_bootstrap() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = TestNode::start(&network, "a", &[], 1).await;

    // A cluster of one elects itself within a couple of timeout windows.
    wait_for_role(&a.node, RaftRole::Leader, Duration::from_secs(2)).await;
    let (term, role) = a.node.get_state().await;
    assert_eq!(role, RaftRole::Leader);
    assert!(term >= 1);

    let store = a.store();
    let (index, submit_term) = store.set("x", "1").await.unwrap();
    assert_eq!(index, 1);
    assert_eq!(submit_term, term);

    let kv = a.kv.clone();
    wait_sync("command to apply", Duration::from_secs(2), move || {
        kv.get("x").as_deref() == Some("1")
    })
    .await;
    assert_eq!(a.kv.len(), 1);

    a.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_election() {
    init_tracing();
    let network = MemoryNetwork::new();
    let ids = ["a", "b", "c"];
    let mut nodes = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        nodes.push(TestNode::start(&network, id, &["a", "b", "c"], i as u64 * 17 + 3).await);
    }

    let leader = wait_for_leader(&nodes, Duration::from_secs(5)).await;

    // Exactly one leader; everyone else settles into follower.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let mut leaders = 0;
        let mut followers = 0;
        for n in &nodes {
            match n.node.get_state().await.1 {
                RaftRole::Leader => leaders += 1,
                RaftRole::Follower => followers += 1,
                RaftRole::Candidate => {}
            }
        }
        if leaders == 1 && followers == 2 {
            break;
        }
        if Instant::now() >= deadline {
            panic!("cluster did not settle on one leader and two followers");
        }
        sleep(POLL).await;
    }

    let (term, _) = nodes[leader].node.get_state().await;
    assert!(term >= 1);
    for n in &nodes {
        n.node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replication_survives_follower_restart() {
    init_tracing();
    let network = MemoryNetwork::new();
    let ids = ["a", "b", "c"];
    let mut nodes = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        nodes.push(TestNode::start(&network, id, &["a", "b", "c"], i as u64 * 31 + 5).await);
    }

    let leader = wait_for_leader(&nodes, Duration::from_secs(5)).await;
    let store = nodes[leader].store();
    for key in ["c1", "c2", "c3"] {
        store.set(key, "v").await.unwrap();
    }
    let leader_kv = nodes[leader].kv.clone();
    wait_sync("first batch to apply on the leader", Duration::from_secs(3), move || {
        leader_kv.len() == 3
    })
    .await;

    // Take one follower down, keep writing, then bring it back with the
    // same storage but a fresh state machine.
    let follower = (0..nodes.len()).find(|i| *i != leader).unwrap();
    let follower_id = nodes[follower].id.clone();
    let follower_storage = nodes[follower].storage.clone();
    nodes[follower].node.shutdown().await;

    for key in ["c4", "c5"] {
        store.set(key, "v").await.unwrap();
    }
    let leader_kv = nodes[leader].kv.clone();
    wait_sync("second batch to apply on the leader", Duration::from_secs(3), move || {
        leader_kv.len() == 5
    })
    .await;

    let restarted = TestNode::start_with_storage(
        &network,
        &follower_id,
        &["a", "b", "c"],
        77,
        follower_storage,
    )
    .await;

    let restarted_kv = restarted.kv.clone();
    wait_sync("restarted follower to catch up", Duration::from_secs(5), move || {
        restarted_kv.len() == 5
    })
    .await;
    for key in ["c1", "c2", "c3", "c4", "c5"] {
        assert_eq!(restarted.kv.get(key).as_deref(), Some("v"), "missing {key}");
    }

    restarted.node.shutdown().await;
    for (i, n) in nodes.iter().enumerate() {
        if i != follower {
            n.node.shutdown().await;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn isolated_leader_steps_down_and_discards_uncommitted() {
    init_tracing();
    let network = MemoryNetwork::new();
    let ids = ["a", "b", "c", "d", "e"];
    let mut nodes = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        nodes.push(TestNode::start(&network, id, &ids, i as u64 * 13 + 11).await);
    }

    let old_leader = wait_for_leader(&nodes, Duration::from_secs(5)).await;
    let (old_term, _) = nodes[old_leader].node.get_state().await;
    let old_leader_id = nodes[old_leader].id.clone();

    network.isolate(&old_leader_id);

    // A submit to the cut-off leader is accepted into its log but can never
    // reach a quorum.
    nodes[old_leader].store().set("iso", "lost").await.unwrap();

    // The rest of the cluster moves on to a new term and a new leader.
    let new_leader = {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let mut found = None;
            for (i, n) in nodes.iter().enumerate() {
                if i == old_leader {
                    continue;
                }
                let (term, role) = n.node.get_state().await;
                if role == RaftRole::Leader && term > old_term {
                    found = Some(i);
                }
            }
            if let Some(i) = found {
                break i;
            }
            if Instant::now() >= deadline {
                panic!("no replacement leader elected");
            }
            sleep(POLL).await;
        }
    };

    nodes[new_leader].store().set("post", "committed").await.unwrap();
    let new_leader_kv = nodes[new_leader].kv.clone();
    wait_sync("new leader's write to commit", Duration::from_secs(3), move || {
        new_leader_kv.get("post").is_some()
    })
    .await;

    // The deposed leader rejoins, steps down, and converges on the new
    // history; its uncommitted entry is truncated away, never applied.
    network.reconnect(&old_leader_id);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let (term, role) = nodes[old_leader].node.get_state().await;
        if role == RaftRole::Follower
            && term > old_term
            && nodes[old_leader].kv.get("post").is_some()
        {
            break;
        }
        if Instant::now() >= deadline {
            panic!("old leader did not step down and converge");
        }
        sleep(POLL).await;
    }
    assert_eq!(nodes[old_leader].kv.get("iso"), None);

    for n in &nodes {
        n.node.shutdown().await;
    }
}

/// Drive a follower directly through the wire protocol: the tester owns a
/// transport handle and plays leader.
mod wire {
    use super::*;

    pub async fn recv_matching<T, F>(transport: &dyn Transport, mut select: F, limit: Duration) -> T
    where
        F: FnMut(Message) -> Option<T>,
    {
        let deadline = Instant::now() + limit;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let envelope = timeout(remaining, transport.recv())
                .await
                .expect("timed out waiting for a message")
                .expect("transport closed");
            if let Some(found) = select(envelope.message) {
                return found;
            }
        }
    }

    pub fn set_entry(term: u64, index: u64, key: &str) -> LogEntry {
        let command = KvCommand::Set { key: key.to_string(), value: "v".to_string() }
            .encode()
            .unwrap();
        LogEntry::new(term, index, EntryPayload::Command(command))
    }

    pub fn append_reply(message: Message) -> Option<AppendEntriesReply> {
        match message {
            Message::AppendEntriesReply(reply) => Some(reply),
            _ => None,
        }
    }

    pub fn vote_reply(message: Message) -> Option<RequestVoteReply> {
        match message {
            Message::RequestVoteReply(reply) => Some(reply),
            _ => None,
        }
    }
}

/// A follower with slow election timeouts, so the tester stays in control.
async fn start_patient_follower(network: &MemoryNetwork, id: &str, peer: &str) -> TestNode {
    let mut config = RaftConfig::new(
        id,
        vec![peer.to_string()],
        format!("/tmp/rustyraft-cluster-test/{id}"),
    );
    config.election_timeout_min = Duration::from_millis(1500);
    config.election_timeout_max = Duration::from_millis(3000);
    config.rng_seed = Some(99);

    let kv = MemoryKv::new();
    let storage = MemoryStorage::new();
    let node = RaftNode::start(
        config,
        Box::new(kv.clone()),
        Arc::new(storage.clone()),
        Arc::new(network.join(id)),
    )
    .await
    .unwrap();
    TestNode { id: id.to_string(), node: Arc::new(node), kv, storage }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_truncates_conflicting_suffix() {
    init_tracing();
    let network = MemoryNetwork::new();
    let tester = network.join("tester");
    let f = start_patient_follower(&network, "f", "tester").await;
    let f_id = f.id.clone();

    // Seed the follower with [(1,1,a), (2,2,b), (2,3,c)].
    let args = AppendEntriesArgs {
        term: 10,
        leader_id: "tester".to_string(),
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![
            wire::set_entry(1, 1, "a"),
            wire::set_entry(2, 2, "b"),
            wire::set_entry(2, 3, "c"),
        ],
        leader_commit: 0,
    };
    tester.send(&f_id, Message::AppendEntries(args)).await.unwrap();
    let reply = wire::recv_matching(&tester, wire::append_reply, Duration::from_secs(2)).await;
    assert!(reply.success);
    assert_eq!(reply.match_index, 3);

    // A newer leader replaces index 2 onward: [(1,1,a), (3,2,d)].
    let args = AppendEntriesArgs {
        term: 11,
        leader_id: "tester".to_string(),
        prev_log_index: 1,
        prev_log_term: 1,
        entries: vec![wire::set_entry(3, 2, "d")],
        leader_commit: 2,
    };
    tester.send(&f_id, Message::AppendEntries(args)).await.unwrap();
    let reply = wire::recv_matching(&tester, wire::append_reply, Duration::from_secs(2)).await;
    assert!(reply.success);
    assert_eq!(reply.match_index, 2);

    // Indices 3 onward are gone and only the surviving prefix applies.
    let kv = f.kv.clone();
    wait_sync("commit to apply", Duration::from_secs(2), move || {
        kv.contains("a") && kv.contains("d")
    })
    .await;
    assert!(!f.kv.contains("b"));
    assert!(!f.kv.contains("c"));
    let metrics = f.node.metrics().await;
    assert_eq!(metrics.last_log_index, 2);
    assert_eq!(metrics.commit_index, 2);

    // Probing past the end yields the fast-forward hint.
    let args = AppendEntriesArgs {
        term: 11,
        leader_id: "tester".to_string(),
        prev_log_index: 10,
        prev_log_term: 11,
        entries: vec![],
        leader_commit: 2,
    };
    tester.send(&f_id, Message::AppendEntries(args)).await.unwrap();
    let reply = wire::recv_matching(&tester, wire::append_reply, Duration::from_secs(2)).await;
    assert!(!reply.success);
    assert_eq!(reply.conflict_index, 3);
    assert_eq!(reply.conflict_term, 0);

    f.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_candidate_log_is_refused_a_vote() {
    init_tracing();
    let network = MemoryNetwork::new();
    let tester = network.join("tester");
    let f = start_patient_follower(&network, "f", "tester").await;
    let f_id = f.id.clone();

    // Give the follower history through term 2.
    let args = AppendEntriesArgs {
        term: 2,
        leader_id: "tester".to_string(),
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![wire::set_entry(1, 1, "a"), wire::set_entry(2, 2, "b")],
        leader_commit: 0,
    };
    tester.send(&f_id, Message::AppendEntries(args)).await.unwrap();
    let reply = wire::recv_matching(&tester, wire::append_reply, Duration::from_secs(2)).await;
    assert!(reply.success);

    // A candidate whose log ends at term 0 must not win the vote, even with
    // a newer term.
    let stale = RequestVoteArgs {
        term: 12,
        candidate_id: "tester".to_string(),
        last_log_index: 0,
        last_log_term: 0,
    };
    tester.send(&f_id, Message::RequestVote(stale)).await.unwrap();
    let reply = wire::recv_matching(&tester, wire::vote_reply, Duration::from_secs(2)).await;
    assert!(!reply.vote_granted);
    assert_eq!(reply.term, 12);

    // The same candidate with an up-to-date log gets the vote.
    let fresh = RequestVoteArgs {
        term: 12,
        candidate_id: "tester".to_string(),
        last_log_index: 2,
        last_log_term: 2,
    };
    tester.send(&f_id, Message::RequestVote(fresh)).await.unwrap();
    let reply = wire::recv_matching(&tester, wire::vote_reply, Duration::from_secs(2)).await;
    assert!(reply.vote_granted);

    f.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_compacts_and_restart_restores() {
    init_tracing();
    let network = MemoryNetwork::new();
    let s = TestNode::start(&network, "s", &[], 5).await;

    wait_for_role(&s.node, RaftRole::Leader, Duration::from_secs(2)).await;
    let store = s.store();
    for i in 0..5 {
        store.set(format!("k{i}"), "v").await.unwrap();
    }
    let kv = s.kv.clone();
    wait_sync("writes to apply", Duration::from_secs(2), move || kv.len() == 5).await;

    let last_included = s.node.snapshot().await.unwrap();
    assert_eq!(last_included, 5);
    // The persisted log prefix is gone.
    assert_eq!(s.storage.first_index().unwrap(), 0);

    // One more write lands after the snapshot.
    store.set("k5", "v").await.unwrap();
    let kv = s.kv.clone();
    wait_sync("post-snapshot write to apply", Duration::from_secs(2), move || kv.len() == 6)
        .await;

    let storage = s.storage.clone();
    s.node.shutdown().await;

    // Restart from the same storage with an empty state machine.
    let restarted = TestNode::start_with_storage(&network, "s", &[], 6, storage).await;
    wait_for_role(&restarted.node, RaftRole::Leader, Duration::from_secs(2)).await;

    // The snapshot prefix is restored immediately.
    for i in 0..5 {
        assert_eq!(restarted.kv.get(&format!("k{i}")).as_deref(), Some("v"));
    }

    // The suffix beyond the snapshot commits once an entry from the new
    // term reaches quorum.
    restarted.store().set("k6", "v").await.unwrap();
    let kv = restarted.kv.clone();
    wait_sync("suffix to replay", Duration::from_secs(2), move || kv.len() == 7).await;
    assert_eq!(restarted.kv.get("k5").as_deref(), Some("v"));

    restarted.node.shutdown().await;
}
