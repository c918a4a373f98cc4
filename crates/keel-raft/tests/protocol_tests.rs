//! Protocol state tests: lifecycle, term/vote/leader invariants, commit
//! gating, restart persistence, and role dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_raft::{
    AppendRequest, AppendResponse, Cluster, Event, Index, Member, MemberId, MemoryLogStore,
    MemoryMetadataStore, MetadataStore, NoopStateMachine, ProtocolConfig, RaftError, Replica, Role,
    RoleFactories, RoleType, Status, Term, UnreachablePeerClient,
};
use tokio::sync::mpsc;

fn three_member_cluster() -> Cluster {
    Cluster::new(
        MemberId::new("foo"),
        vec![
            Member::new("foo", "foo", 5678),
            Member::new("bar", "bar", 5679),
            Member::new("baz", "baz", 5680),
        ],
    )
    .unwrap()
}

fn new_replica(metadata: Arc<dyn MetadataStore>, roles: RoleFactories) -> Arc<Replica> {
    Replica::new(
        three_member_cluster(),
        ProtocolConfig::with_election_timeout(Duration::from_secs(10)),
        Arc::new(UnreachablePeerClient),
        Arc::new(MemoryLogStore::new()),
        metadata,
        Box::new(NoopStateMachine),
        roles,
    )
    .unwrap()
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn startup_and_monotonic_term() {
    let replica = new_replica(Arc::new(MemoryMetadataStore::new()), RoleFactories::new());
    assert_eq!(replica.status(), Status::Stopped);

    let (events_tx, mut events) = mpsc::unbounded_channel();
    replica.watch(move |event| {
        let _ = events_tx.send(event);
    });

    replica.init().unwrap();
    assert_eq!(replica.status(), Status::Running);
    assert_eq!(next_event(&mut events).await, Event::Status(Status::Running));

    assert_eq!(replica.member(), &MemberId::new("foo"));
    assert_eq!(replica.members().len(), 3);
    assert_eq!(replica.term(), Term(0));
    assert_eq!(replica.leader(), None);
    assert_eq!(replica.last_voted_for(), None);
    assert_eq!(replica.commit_index(), Index(0));

    replica.set_term(Term(1)).unwrap();
    assert_eq!(replica.term(), Term(1));
    replica.set_term(Term(3)).unwrap();
    assert_eq!(replica.term(), Term(3));
    assert!(matches!(
        replica.set_term(Term(2)),
        Err(RaftError::TermRegression { .. })
    ));
    assert_eq!(replica.term(), Term(3));
}

#[tokio::test]
async fn single_vote_per_term() {
    let replica = new_replica(Arc::new(MemoryMetadataStore::new()), RoleFactories::new());
    replica.init().unwrap();
    replica.set_term(Term(3)).unwrap();

    let foo = MemberId::new("foo");
    let bar = MemberId::new("bar");

    replica.set_last_voted_for(foo.clone()).unwrap();
    assert_eq!(replica.last_voted_for(), Some(foo.clone()));
    assert!(matches!(
        replica.set_last_voted_for(bar.clone()),
        Err(RaftError::AlreadyVoted { .. })
    ));
    assert_eq!(replica.last_voted_for(), Some(foo));

    // Advancing the term clears the vote.
    replica.set_term(Term(4)).unwrap();
    assert_eq!(replica.leader(), None);
    assert_eq!(replica.last_voted_for(), None);

    assert!(matches!(
        replica.set_last_voted_for(MemberId::new("none")),
        Err(RaftError::UnknownMember { .. })
    ));
    assert_eq!(replica.last_voted_for(), None);

    replica.set_last_voted_for(bar.clone()).unwrap();
    assert_eq!(replica.last_voted_for(), Some(bar.clone()));
    assert!(matches!(
        replica.set_last_voted_for(MemberId::new("")),
        Err(RaftError::InvalidVote { .. })
    ));
    assert_eq!(replica.last_voted_for(), Some(bar));
}

#[tokio::test]
async fn leader_immutable_within_term() {
    let replica = new_replica(Arc::new(MemoryMetadataStore::new()), RoleFactories::new());
    replica.init().unwrap();
    replica.set_term(Term(4)).unwrap();

    let foo = MemberId::new("foo");
    let bar = MemberId::new("bar");

    assert_eq!(replica.leader(), None);
    replica.set_leader(Some(bar.clone())).unwrap();
    assert_eq!(replica.leader(), Some(bar.clone()));
    assert!(matches!(
        replica.set_leader(Some(foo)),
        Err(RaftError::LeaderConflict { .. })
    ));
    assert_eq!(replica.leader(), Some(bar.clone()));
    assert_eq!(replica.term(), Term(4));

    // Clearing is always allowed and does not advance the term.
    replica.set_leader(None).unwrap();
    assert_eq!(replica.term(), Term(4));
    assert_eq!(replica.leader(), None);

    replica.set_leader(Some(bar.clone())).unwrap();
    replica.set_term(Term(5)).unwrap();
    assert_eq!(replica.leader(), None);
    assert_eq!(replica.last_voted_for(), None);
}

#[tokio::test]
async fn first_commit_gating() {
    let replica = new_replica(Arc::new(MemoryMetadataStore::new()), RoleFactories::new());

    let (events_tx, mut events) = mpsc::unbounded_channel();
    replica.watch(move |event| {
        let _ = events_tx.send(event);
    });

    replica.init().unwrap();
    assert_eq!(next_event(&mut events).await, Event::Status(Status::Running));

    assert_eq!(replica.commit_index(), Index(0));
    assert_eq!(replica.status(), Status::Running);

    // A commit before the first commit index is known does not change
    // readiness.
    assert_eq!(replica.commit(Index(5)), Index(0));
    assert_eq!(replica.commit_index(), Index(5));
    assert_eq!(replica.status(), Status::Running);

    replica.set_commit_index(Index(10));
    assert_eq!(replica.status(), Status::Running);
    // The first commit index is write-once.
    replica.set_commit_index(Index(50));

    assert_eq!(replica.commit(Index(9)), Index(5));
    assert_eq!(replica.status(), Status::Running);

    assert_eq!(replica.commit(Index(10)), Index(9));
    assert_eq!(replica.status(), Status::Ready);
    assert_eq!(next_event(&mut events).await, Event::Status(Status::Ready));

    // The commit index never decreases.
    assert_eq!(replica.commit(Index(3)), Index(10));
    assert_eq!(replica.commit_index(), Index(10));
}

#[tokio::test]
async fn restart_restores_metadata() {
    let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
    let bar = MemberId::new("bar");

    let replica = new_replica(Arc::clone(&metadata), RoleFactories::new());
    replica.init().unwrap();
    replica.set_term(Term(10)).unwrap();
    replica.set_last_voted_for(bar.clone()).unwrap();
    replica.set_leader(Some(bar.clone())).unwrap();
    replica.commit(Index(7));

    replica.close().unwrap();
    assert_eq!(replica.status(), Status::Stopped);

    // A new replica over the same metadata store restores the durable
    // fields; the leader and commit index are volatile.
    let restarted = new_replica(metadata, RoleFactories::new());
    assert_eq!(restarted.status(), Status::Stopped);
    restarted.init().unwrap();
    assert_eq!(restarted.status(), Status::Running);
    assert_eq!(restarted.term(), Term(10));
    assert_eq!(restarted.last_voted_for(), Some(bar));
    assert_eq!(restarted.leader(), None);
    assert_eq!(restarted.commit_index(), Index(0));
}

struct ProbeRole {
    role_type: RoleType,
    appended: Arc<AtomicBool>,
}

#[async_trait]
impl Role for ProbeRole {
    fn role_type(&self) -> RoleType {
        self.role_type
    }

    async fn append(&self, _request: AppendRequest) -> AppendResponse {
        self.appended.store(true, Ordering::SeqCst);
        AppendResponse::ok(Term(0), true, Index(0))
    }
}

#[tokio::test]
async fn role_transitions_dispatch() {
    let appended = Arc::new(AtomicBool::new(false));

    let mut roles = RoleFactories::new();
    {
        let appended = Arc::clone(&appended);
        roles.register(RoleType::Follower, move |_| {
            Arc::new(ProbeRole {
                role_type: RoleType::Follower,
                appended: Arc::clone(&appended),
            }) as Arc<dyn Role>
        });
    }
    roles.register(RoleType::Leader, move |_| {
        Arc::new(ProbeRole {
            role_type: RoleType::Leader,
            appended: Arc::new(AtomicBool::new(false)),
        }) as Arc<dyn Role>
    });

    let replica = new_replica(Arc::new(MemoryMetadataStore::new()), roles);

    let (events_tx, mut events) = mpsc::unbounded_channel();
    replica.watch(move |event| {
        let _ = events_tx.send(event);
    });

    replica.init().unwrap();
    assert_eq!(replica.role(), RoleType::Follower);

    // The follower's handler is wired into dispatch.
    assert!(!appended.load(Ordering::SeqCst));
    let _ = replica
        .append(AppendRequest {
            term: Term(0),
            leader: MemberId::new("bar"),
            prev_log_index: Index(0),
            prev_log_term: Term(0),
            entries: Vec::new(),
            commit_index: Index(0),
        })
        .await;
    assert!(appended.load(Ordering::SeqCst));

    replica.set_role(RoleType::Leader);
    assert_eq!(replica.role(), RoleType::Leader);

    // The role event arrives after the status event from init.
    loop {
        match next_event(&mut events).await {
            Event::Role(RoleType::Leader) => break,
            _ => continue,
        }
    }
}
