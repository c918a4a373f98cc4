//! Follower: passive replication target with an election timer.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::replica::Replica;
use crate::roles::{active, passive, Role, RoleShared};
use crate::types::*;

/// Follower role.
///
/// Arms a randomized election deadline in `[T, 2T)`; any successful
/// append from the recognized leader or granted vote pushes the deadline
/// out. When the deadline passes the follower becomes a candidate.
/// Client commands are forwarded to the known leader.
pub struct FollowerRole {
    shared: RoleShared,
    deadline_tx: watch::Sender<Instant>,
}

impl FollowerRole {
    pub fn new(replica: Arc<Replica>) -> Self {
        let (deadline_tx, _) = watch::channel(Instant::now());
        Self {
            shared: RoleShared::new(replica),
            deadline_tx,
        }
    }

    fn reset_deadline(&self) {
        let timeout = self.shared.replica.config().random_election_timeout();
        let _ = self.deadline_tx.send(Instant::now() + timeout);
    }
}

#[async_trait]
impl Role for FollowerRole {
    fn role_type(&self) -> RoleType {
        RoleType::Follower
    }

    fn start(&self) -> Result<()> {
        self.reset_deadline();
        let replica = Arc::clone(&self.shared.replica);
        let active = Arc::clone(&self.shared.active);
        let mut deadline_rx = self.deadline_tx.subscribe();
        let mut shutdown_rx = self.shared.shutdown_rx();
        tokio::spawn(async move {
            loop {
                let deadline = *deadline_rx.borrow_and_update();
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        if !active.load(std::sync::atomic::Ordering::Acquire) {
                            return;
                        }
                        debug!(term = %replica.term(), "election timeout; becoming candidate");
                        replica.step(&active, RoleType::Candidate);
                        return;
                    }
                    changed = deadline_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn stop(&self) {
        self.shared.deactivate();
    }

    async fn append(&self, request: AppendRequest) -> AppendResponse {
        let response = passive::handle_append(&self.shared.replica, request).await;
        if response.succeeded {
            self.reset_deadline();
        }
        response
    }

    async fn install(&self, chunks: mpsc::Receiver<InstallRequest>) -> InstallResponse {
        let response = passive::handle_install(&self.shared.replica, chunks).await;
        if response.status == ResponseStatus::Ok {
            self.reset_deadline();
        }
        response
    }

    async fn configure(&self, request: ConfigureRequest) -> ConfigureResponse {
        let response = passive::handle_configure(&self.shared.replica, request);
        if response.status == ResponseStatus::Ok {
            self.reset_deadline();
        }
        response
    }

    async fn vote(&self, request: VoteRequest) -> VoteResponse {
        let response = active::handle_vote(&self.shared.replica, request).await;
        if response.voted {
            self.reset_deadline();
        }
        response
    }

    async fn poll(&self, request: PollRequest) -> PollResponse {
        active::handle_poll(&self.shared.replica, request).await
    }

    async fn command(&self, request: CommandRequest, responses: mpsc::Sender<CommandResponse>) {
        let replica = &self.shared.replica;
        match replica.leader() {
            Some(leader) if leader != *replica.member() => {
                debug!(leader = %leader, "forwarding command to leader");
                if let Err(e) = replica
                    .client()
                    .command(request, &leader, responses.clone())
                    .await
                {
                    warn!(leader = %leader, error = %e, "command forward failed");
                    let _ = responses
                        .send(CommandResponse::rejected(
                            ResponseError::NoLeader,
                            replica.term(),
                            Some(leader),
                        ))
                        .await;
                }
            }
            _ => {
                let _ = responses
                    .send(CommandResponse::rejected(
                        ResponseError::NoLeader,
                        replica.term(),
                        None,
                    ))
                    .await;
            }
        }
    }

    async fn query(&self, request: QueryRequest, responses: mpsc::Sender<QueryResponse>) {
        let replica = &self.shared.replica;
        match request.consistency {
            ReadConsistency::Sequential => {
                // Serve locally once the state machine has caught up to
                // everything known committed.
                let commit = replica.commit_index();
                if replica.wait_applied(commit).await.is_err() {
                    let _ = responses
                        .send(QueryResponse::rejected(ResponseError::ProtocolError))
                        .await;
                    return;
                }
                let sm = replica.state_machine().lock().await;
                match sm.query(&request.payload).await {
                    Ok(payload) => {
                        let _ = responses.send(QueryResponse::ok(payload)).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "query failed");
                        let _ = responses
                            .send(QueryResponse::rejected(ResponseError::ApplicationError))
                            .await;
                    }
                }
            }
            ReadConsistency::Linearizable | ReadConsistency::LinearizableLease => {
                match replica.leader() {
                    Some(leader) if leader != *replica.member() => {
                        if let Err(e) = replica
                            .client()
                            .query(request, &leader, responses.clone())
                            .await
                        {
                            warn!(leader = %leader, error = %e, "query forward failed");
                            let _ = responses
                                .send(QueryResponse::rejected(ResponseError::NoLeader))
                                .await;
                        }
                    }
                    _ => {
                        let _ = responses
                            .send(QueryResponse::rejected(ResponseError::NoLeader))
                            .await;
                    }
                }
            }
        }
    }
}
