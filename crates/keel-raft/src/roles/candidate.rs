//! Candidate: drives election rounds until a leader emerges.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::replica::Replica;
use crate::roles::{active, passive, Role, RoleShared};
use crate::types::*;

/// One counted response in an election round.
enum Ballot {
    Granted,
    Rejected,
    HigherTerm(Term),
}

/// Candidate role.
///
/// Each round advances the term, votes for itself, and fans vote requests
/// out to the peers. A quorum of grants makes it leader, a quorum of
/// rejections (or a greater observed term) sends it back to follower, and
/// an expired round restarts the election at the next term.
pub struct CandidateRole {
    shared: RoleShared,
}

impl CandidateRole {
    pub fn new(replica: Arc<Replica>) -> Self {
        Self {
            shared: RoleShared::new(replica),
        }
    }
}

#[async_trait]
impl Role for CandidateRole {
    fn role_type(&self) -> RoleType {
        RoleType::Candidate
    }

    fn start(&self) -> Result<()> {
        let replica = Arc::clone(&self.shared.replica);
        let active = Arc::clone(&self.shared.active);
        let shutdown_rx = self.shared.shutdown_rx();
        tokio::spawn(run_election(replica, active, shutdown_rx));
        Ok(())
    }

    fn stop(&self) {
        self.shared.deactivate();
    }

    async fn vote(&self, request: VoteRequest) -> VoteResponse {
        let replica = &self.shared.replica;

        // A greater term ends this candidacy; decide the vote as a voter
        // of the new term would.
        if request.term > replica.term() {
            let response = active::handle_vote(replica, request).await;
            replica.step(&self.shared.active, RoleType::Follower);
            return response;
        }

        // A candidate always votes for itself.
        if request.candidate == *replica.member() {
            return VoteResponse::ok(replica.term(), true);
        }
        VoteResponse::ok(replica.term(), false)
    }

    async fn poll(&self, request: PollRequest) -> PollResponse {
        active::handle_poll(&self.shared.replica, request).await
    }

    async fn append(&self, request: AppendRequest) -> AppendResponse {
        let replica = &self.shared.replica;
        // An append at our term or newer proves a leader for it; step
        // down before handling.
        if request.term >= replica.term() {
            if let Err(e) = replica.step_down(Some(request.term), Some(request.leader.clone())) {
                warn!(error = %e, "failed to step down for leader append");
            }
        }
        passive::handle_append(replica, request).await
    }

    async fn install(&self, chunks: mpsc::Receiver<InstallRequest>) -> InstallResponse {
        passive::handle_install(&self.shared.replica, chunks).await
    }

    async fn configure(&self, request: ConfigureRequest) -> ConfigureResponse {
        let replica = &self.shared.replica;
        if request.term >= replica.term() {
            if let Err(e) = replica.step_down(Some(request.term), Some(request.leader.clone())) {
                warn!(error = %e, "failed to step down for configure");
            }
        }
        passive::handle_configure(replica, request)
    }

    async fn command(&self, _request: CommandRequest, responses: mpsc::Sender<CommandResponse>) {
        let replica = &self.shared.replica;
        let _ = responses
            .send(CommandResponse::rejected(
                ResponseError::NoLeader,
                replica.term(),
                None,
            ))
            .await;
    }

    async fn query(&self, _request: QueryRequest, responses: mpsc::Sender<QueryResponse>) {
        let _ = responses
            .send(QueryResponse::rejected(ResponseError::NoLeader))
            .await;
    }
}

/// Drive election rounds until the candidacy resolves or is stopped.
async fn run_election(
    replica: Arc<Replica>,
    active: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if !active.load(Ordering::Acquire) {
            return;
        }

        // A single voting member needs no votes beyond its own.
        if replica.cluster().len() == 1 {
            debug!("single-member cluster; assuming leadership");
            replica.step(&active, RoleType::Leader);
            return;
        }

        let election_term = match replica.begin_election_round() {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "failed to start election round; stepping down");
                replica.step(&active, RoleType::Follower);
                return;
            }
        };

        let (last_log_index, last_log_term) = replica
            .log()
            .last_entry()
            .unwrap_or((Index::ZERO, Term::ZERO));

        let members = replica.members();
        let quorum = replica.cluster().quorum();
        // Bounded by the number of voters so producers never block.
        let (votes_tx, votes_rx) = mpsc::channel(members.len());
        tokio::spawn(tally(
            Arc::clone(&replica),
            Arc::clone(&active),
            election_term,
            votes_rx,
            quorum,
        ));

        info!(term = %election_term, "requesting votes");
        for member in members {
            if member == *replica.member() {
                let _ = votes_tx.send(Ballot::Granted).await;
                continue;
            }
            let request = VoteRequest {
                term: election_term,
                candidate: replica.member().clone(),
                last_log_index,
                last_log_term,
            };
            tokio::spawn(request_vote(
                Arc::clone(&replica),
                member,
                request,
                votes_tx.clone(),
            ));
        }
        drop(votes_tx);

        let timeout = replica.config().random_election_timeout();
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                if !active.load(Ordering::Acquire) {
                    return;
                }
                if replica.term() != election_term {
                    // Another path owns the transition.
                    return;
                }
                debug!(term = %election_term, "election round expired; restarting");
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// Request one peer's vote and convert the outcome into a ballot.
async fn request_vote(
    replica: Arc<Replica>,
    peer: MemberId,
    request: VoteRequest,
    votes_tx: mpsc::Sender<Ballot>,
) {
    debug!(peer = %peer, term = %request.term, "requesting vote");
    let ballot = match replica.client().vote(request.clone(), &peer).await {
        Err(e) => {
            warn!(peer = %peer, error = %e, "vote request failed");
            Ballot::Rejected
        }
        Ok(response) => {
            if response.term > request.term {
                Ballot::HigherTerm(response.term)
            } else if !response.voted {
                debug!(peer = %peer, "vote rejected");
                Ballot::Rejected
            } else if response.term != request.term {
                // Granted for a term other than the one we ran in.
                debug!(peer = %peer, term = %response.term, "vote granted for a different term");
                Ballot::Rejected
            } else {
                debug!(peer = %peer, "vote granted");
                Ballot::Granted
            }
        }
    };
    let _ = votes_tx.send(ballot).await;
}

/// Count ballots for one round. Exits on channel close, a stale term, or
/// deactivation; otherwise resolves the round at a quorum either way.
async fn tally(
    replica: Arc<Replica>,
    active: Arc<AtomicBool>,
    election_term: Term,
    mut votes_rx: mpsc::Receiver<Ballot>,
    quorum: usize,
) {
    let mut granted = 0usize;
    let mut rejected = 0usize;
    while let Some(ballot) = votes_rx.recv().await {
        if !active.load(Ordering::Acquire) || replica.term() != election_term {
            return;
        }
        match ballot {
            Ballot::Granted => {
                granted += 1;
                if granted >= quorum {
                    if replica.step_to_leader(&active, election_term) {
                        info!(term = %election_term, granted, "won election");
                    }
                    return;
                }
            }
            Ballot::Rejected => {
                rejected += 1;
                if rejected >= quorum {
                    info!(term = %election_term, rejected, "lost election; stepping down");
                    replica.step(&active, RoleType::Follower);
                    return;
                }
            }
            Ballot::HigherTerm(term) => {
                debug!(term = %term, "observed greater term; stepping down");
                if active.load(Ordering::Acquire) {
                    if let Err(e) = replica.step_down(Some(term), None) {
                        warn!(error = %e, "failed to adopt greater term");
                    }
                }
                return;
            }
        }
    }
}
