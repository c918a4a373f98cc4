//! End-to-end tests: in-process clusters wired over the loopback
//! network electing leaders, replicating commands, and surviving
//! leader loss.

use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use keel_raft::{
    Cluster, CommandRequest, EntryPayload, LogEntry, LoopbackNetwork, Member, MemberId,
    MemoryLogStore, MemoryMetadataStore, PeerClient, ProtocolConfig, QueryRequest,
    ReadConsistency, Replica, ResponseStatus, Result, RoleFactories, RoleType, StateMachine,
    Status, Term,
};
use tokio::sync::mpsc;

/// State machine that records applied command payloads and answers
/// queries with how many it has seen.
struct RecordingStateMachine {
    applied: Arc<StdMutex<Vec<Bytes>>>,
}

#[async_trait]
impl StateMachine for RecordingStateMachine {
    async fn apply(&mut self, entry: &LogEntry) -> Result<Bytes> {
        if let EntryPayload::Command(data) = &entry.payload {
            self.applied.lock().unwrap().push(data.clone());
            return Ok(data.clone());
        }
        Ok(Bytes::new())
    }

    async fn query(&self, _payload: &Bytes) -> Result<Bytes> {
        let count = self.applied.lock().unwrap().len();
        Ok(Bytes::from(count.to_string()))
    }

    async fn restore(&mut self, _data: Bytes) -> Result<()> {
        self.applied.lock().unwrap().clear();
        Ok(())
    }
}

struct TestNode {
    id: MemberId,
    replica: Arc<Replica>,
    applied: Arc<StdMutex<Vec<Bytes>>>,
}

struct TestCluster {
    network: Arc<LoopbackNetwork>,
    nodes: Vec<TestNode>,
}

impl TestCluster {
    async fn start(size: usize) -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        let members: Vec<Member> = (0..size)
            .map(|i| Member::new(format!("n{i}"), "localhost", (7000 + i) as u16))
            .collect();
        let network = LoopbackNetwork::new();

        let mut nodes = Vec::new();
        for member in &members {
            let id = member.id.clone();
            let cluster = Cluster::new(id.clone(), members.clone()).unwrap();
            let applied = Arc::new(StdMutex::new(Vec::new()));
            let replica = Replica::new(
                cluster,
                ProtocolConfig::with_election_timeout(Duration::from_millis(300)),
                network.client(id.clone()) as Arc<dyn PeerClient>,
                Arc::new(MemoryLogStore::new()),
                Arc::new(MemoryMetadataStore::new()),
                Box::new(RecordingStateMachine {
                    applied: Arc::clone(&applied),
                }),
                RoleFactories::standard(),
            )
            .unwrap();
            network.register(id.clone(), Arc::clone(&replica));
            nodes.push(TestNode {
                id,
                replica,
                applied,
            });
        }
        for node in &nodes {
            node.replica.init().unwrap();
        }
        TestCluster { network, nodes }
    }

    /// Wait for a leader to emerge; returns its node position.
    async fn await_leader(&self, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(pos) = self
                .nodes
                .iter()
                .position(|n| n.replica.role() == RoleType::Leader)
            {
                return pos;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("no leader elected within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn await_condition(&self, what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !check() {
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn shutdown(&self) {
        for node in &self.nodes {
            let _ = node.replica.close();
        }
    }
}

async fn send_command(replica: &Arc<Replica>, payload: &str) -> keel_raft::CommandResponse {
    let (tx, mut rx) = mpsc::channel(4);
    let request = CommandRequest {
        payload: Bytes::from(payload.to_string()),
    };
    tokio::time::timeout(Duration::from_secs(10), async {
        replica.command(request, tx).await;
        rx.recv().await.expect("command produced no response")
    })
    .await
    .expect("command timed out")
}

#[tokio::test]
async fn three_replicas_elect_single_leader() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.await_leader(Duration::from_secs(10)).await;

    // Once the leader's heartbeats land, everyone agrees on it.
    let leader_id = cluster.nodes[leader].id.clone();
    let leader_term = cluster.nodes[leader].replica.term();
    cluster
        .await_condition("followers to learn the leader", Duration::from_secs(5), || {
            cluster
                .nodes
                .iter()
                .all(|n| n.replica.leader() == Some(leader_id.clone()))
        })
        .await;

    let leaders_at_term = cluster
        .nodes
        .iter()
        .filter(|n| n.replica.role() == RoleType::Leader && n.replica.term() == leader_term)
        .count();
    assert_eq!(leaders_at_term, 1);
    cluster.shutdown();
}

#[tokio::test]
async fn commands_replicate_to_every_state_machine() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.await_leader(Duration::from_secs(10)).await;

    let response = send_command(&cluster.nodes[leader].replica, "set x=1").await;
    assert_eq!(response.status, ResponseStatus::Ok);
    assert!(response.index > keel_raft::Index(0));
    assert_eq!(response.payload, Bytes::from("set x=1"));

    let index = response.index;
    cluster
        .await_condition("commit convergence", Duration::from_secs(10), || {
            cluster.nodes.iter().all(|n| n.replica.commit_index() >= index)
        })
        .await;
    cluster
        .await_condition("state machine convergence", Duration::from_secs(10), || {
            cluster
                .nodes
                .iter()
                .all(|n| n.applied.lock().unwrap().contains(&Bytes::from("set x=1")))
        })
        .await;

    // With the first commit index reached, every replica serves.
    cluster
        .await_condition("readiness", Duration::from_secs(10), || {
            cluster.nodes.iter().all(|n| n.replica.status() == Status::Ready)
        })
        .await;
    cluster.shutdown();
}

#[tokio::test]
async fn followers_forward_commands_to_the_leader() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.await_leader(Duration::from_secs(10)).await;

    let leader_id = cluster.nodes[leader].id.clone();
    cluster
        .await_condition("followers to learn the leader", Duration::from_secs(5), || {
            cluster
                .nodes
                .iter()
                .all(|n| n.replica.leader() == Some(leader_id.clone()))
        })
        .await;

    let follower = (leader + 1) % cluster.nodes.len();
    let response = send_command(&cluster.nodes[follower].replica, "forwarded").await;
    assert_eq!(response.status, ResponseStatus::Ok);

    let index = response.index;
    cluster
        .await_condition("commit convergence", Duration::from_secs(10), || {
            cluster.nodes.iter().all(|n| n.replica.commit_index() >= index)
        })
        .await;
    cluster.shutdown();
}

#[tokio::test]
async fn queries_serve_applied_state() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.await_leader(Duration::from_secs(10)).await;

    let response = send_command(&cluster.nodes[leader].replica, "set y=2").await;
    assert_eq!(response.status, ResponseStatus::Ok);

    // Linearizable read through the leader.
    let (tx, mut rx) = mpsc::channel(4);
    cluster.nodes[leader]
        .replica
        .query(
            QueryRequest {
                payload: Bytes::from("count"),
                consistency: ReadConsistency::Linearizable,
            },
            tx,
        )
        .await;
    let query_response = rx.recv().await.unwrap();
    assert_eq!(query_response.status, ResponseStatus::Ok);
    assert_eq!(query_response.payload, Bytes::from("1"));

    // Sequential read served locally by a follower once it catches up.
    let follower = (leader + 1) % cluster.nodes.len();
    cluster
        .await_condition("follower catch-up", Duration::from_secs(10), || {
            cluster.nodes[follower].replica.commit_index() >= response.index
        })
        .await;
    let (tx, mut rx) = mpsc::channel(4);
    cluster.nodes[follower]
        .replica
        .query(
            QueryRequest {
                payload: Bytes::from("count"),
                consistency: ReadConsistency::Sequential,
            },
            tx,
        )
        .await;
    let query_response = rx.recv().await.unwrap();
    assert_eq!(query_response.status, ResponseStatus::Ok);
    assert_eq!(query_response.payload, Bytes::from("1"));
    cluster.shutdown();
}

#[tokio::test]
async fn cluster_elects_new_leader_after_failure() {
    let cluster = TestCluster::start(3).await;
    let old_leader = cluster.await_leader(Duration::from_secs(10)).await;
    let old_term = cluster.nodes[old_leader].replica.term();

    // Take the leader down entirely.
    cluster.nodes[old_leader].replica.close().unwrap();
    cluster.network.disconnect(&cluster.nodes[old_leader].id);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let new_leader = loop {
        let survivor = cluster.nodes.iter().enumerate().find_map(|(i, n)| {
            (i != old_leader
                && n.replica.role() == RoleType::Leader
                && n.replica.status() != Status::Stopped)
                .then_some(i)
        });
        if let Some(pos) = survivor {
            break pos;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("no replacement leader elected");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    assert!(cluster.nodes[new_leader].replica.term() > old_term);

    // The surviving majority still commits.
    let response = send_command(&cluster.nodes[new_leader].replica, "after failover").await;
    assert_eq!(response.status, ResponseStatus::Ok);
    cluster.shutdown();
}

#[tokio::test]
async fn transfer_steps_the_leader_down() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.await_leader(Duration::from_secs(10)).await;

    // Commit something so the target has a tail to match.
    let response = send_command(&cluster.nodes[leader].replica, "pre-transfer").await;
    assert_eq!(response.status, ResponseStatus::Ok);

    let target = (leader + 1) % cluster.nodes.len();
    let target_id = cluster.nodes[target].id.clone();
    let transfer = tokio::time::timeout(
        Duration::from_secs(10),
        cluster.nodes[leader]
            .replica
            .transfer(keel_raft::TransferRequest { member: target_id }),
    )
    .await
    .expect("transfer timed out");
    assert_eq!(transfer.status, ResponseStatus::Ok);
    assert_ne!(cluster.nodes[leader].replica.role(), RoleType::Leader);

    // The cluster recovers a leader afterwards.
    cluster.await_leader(Duration::from_secs(10)).await;
    cluster.shutdown();
}

#[tokio::test]
async fn membership_requests_return_the_configuration() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.await_leader(Duration::from_secs(10)).await;
    let replica = &cluster.nodes[leader].replica;

    let join = replica
        .join(keel_raft::JoinRequest {
            member: cluster.nodes[0].id.clone(),
        })
        .await;
    assert_eq!(join.status, ResponseStatus::Ok);
    assert_eq!(join.members.len(), 3);

    // Unknown members cannot be admitted here.
    let join = replica
        .join(keel_raft::JoinRequest {
            member: MemberId::new("stranger"),
        })
        .await;
    assert_eq!(join.status, ResponseStatus::Error);

    let leave = replica
        .leave(keel_raft::LeaveRequest {
            member: cluster.nodes[1].id.clone(),
        })
        .await;
    assert_eq!(leave.status, ResponseStatus::Ok);

    // Followers do not serve the membership surface.
    let follower = (leader + 1) % cluster.nodes.len();
    let join = cluster.nodes[follower]
        .replica
        .join(keel_raft::JoinRequest {
            member: cluster.nodes[0].id.clone(),
        })
        .await;
    assert_eq!(join.status, ResponseStatus::Error);
    cluster.shutdown();
}

#[tokio::test]
async fn single_member_cluster_leads_immediately() {
    let cluster = TestCluster::start(1).await;
    let leader = cluster.await_leader(Duration::from_secs(10)).await;
    assert_eq!(cluster.nodes[leader].id, MemberId::new("n0"));

    let response = send_command(&cluster.nodes[leader].replica, "solo").await;
    assert_eq!(response.status, ResponseStatus::Ok);
    assert!(cluster.nodes[leader].replica.term() >= Term(0));
    cluster.shutdown();
}
