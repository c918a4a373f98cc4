//! Leader: heartbeats, log replication, commit advancement, and the
//! client-facing write path.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::replica::Replica;
use crate::roles::{active, passive, Role, RoleShared};
use crate::types::*;

/// Replication progress towards one peer.
struct Progress {
    /// Index of the next entry to send.
    next: Index,
    /// Highest index known replicated on the peer.
    matched: Index,
}

/// Leader role.
///
/// On start it appends a no-op entry at its term so prior-term entries
/// become committable, then drives per-peer replication off a heartbeat
/// ticker. The commit index advances to the largest index a quorum has
/// matched whose entry carries the leader's term.
pub struct LeaderRole {
    shared: RoleShared,
    term: Term,
    progress: Arc<Mutex<HashMap<MemberId, Progress>>>,
    replicate_now: Arc<Notify>,
    last_quorum_ack: Arc<Mutex<Option<Instant>>>,
    /// Serializes index assignment for local appends.
    append_lock: Mutex<()>,
    /// Single writer for the membership request surface.
    membership: tokio::sync::Mutex<()>,
}

impl LeaderRole {
    pub fn new(replica: Arc<Replica>) -> Self {
        let term = replica.term();
        Self {
            shared: RoleShared::new(replica),
            term,
            progress: Arc::new(Mutex::new(HashMap::new())),
            replicate_now: Arc::new(Notify::new()),
            last_quorum_ack: Arc::new(Mutex::new(None)),
            append_lock: Mutex::new(()),
            membership: tokio::sync::Mutex::new(()),
        }
    }

    /// Append a local entry at the leader's term, assigning the next index.
    fn append_local(&self, payload: EntryPayload) -> Result<LogEntry> {
        let _guard = self.append_lock.lock();
        let replica = &self.shared.replica;
        let last = replica
            .log()
            .last_entry()
            .map(|(index, _)| index)
            .unwrap_or(Index::ZERO);
        let entry = LogEntry::new(last.next(), self.term, payload);
        replica.log().append(entry.clone())?;
        Ok(entry)
    }

    /// One explicit replication round; true if a quorum acknowledged.
    async fn confirm_leadership(&self) -> bool {
        let replica = &self.shared.replica;
        let peers = replica.cluster().peers();
        if peers.is_empty() {
            return true;
        }
        let rounds = peers.into_iter().map(|peer| {
            replicate_to_peer(
                Arc::clone(replica),
                Arc::clone(&self.shared.active),
                self.term,
                Arc::clone(&self.progress),
                peer,
            )
        });
        let successes = futures::future::join_all(rounds)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        let confirmed = successes + 1 >= replica.cluster().quorum();
        if confirmed {
            *self.last_quorum_ack.lock() = Some(Instant::now());
        }
        confirmed
    }

    async fn serve_query(&self, request: &QueryRequest, responses: &mpsc::Sender<QueryResponse>) {
        let replica = &self.shared.replica;
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
}

#[async_trait]
impl Role for LeaderRole {
    fn role_type(&self) -> RoleType {
        RoleType::Leader
    }

    fn start(&self) -> Result<()> {
        let replica = &self.shared.replica;
        if let Err(e) = replica.set_leader(Some(replica.member().clone())) {
            warn!(error = %e, "failed to record own leadership");
        }

        // Initialize progress from the pre-no-op tail so the no-op itself
        // gets replicated.
        let last = replica
            .log()
            .last_entry()
            .map(|(index, _)| index)
            .unwrap_or(Index::ZERO);
        {
            let mut progress = self.progress.lock();
            for peer in replica.cluster().peers() {
                progress.insert(
                    peer,
                    Progress {
                        next: last.next(),
                        matched: Index::ZERO,
                    },
                );
            }
        }

        match self.append_local(EntryPayload::Noop) {
            Ok(entry) => {
                debug!(index = %entry.index, term = %self.term, "appended no-op entry");
                // The leader is caught up once its own no-op commits.
                replica.set_commit_index(entry.index);
            }
            Err(e) => {
                error!(error = %e, "failed to append no-op entry; stepping down");
                let replica = Arc::clone(replica);
                let active = Arc::clone(&self.shared.active);
                tokio::spawn(async move {
                    replica.step(&active, RoleType::Follower);
                });
                return Ok(());
            }
        }

        tokio::spawn(heartbeat_loop(
            Arc::clone(replica),
            Arc::clone(&self.shared.active),
            self.term,
            Arc::clone(&self.progress),
            Arc::clone(&self.replicate_now),
            Arc::clone(&self.last_quorum_ack),
            self.shared.shutdown_rx(),
        ));
        info!(term = %self.term, "leadership started");
        Ok(())
    }

    fn stop(&self) {
        self.shared.deactivate();
        self.shared.replica.cancel_applied_waiters();
    }

    async fn vote(&self, request: VoteRequest) -> VoteResponse {
        let replica = &self.shared.replica;
        if request.term > replica.term() {
            let response = active::handle_vote(replica, request).await;
            replica.step(&self.shared.active, RoleType::Follower);
            return response;
        }
        active::handle_vote(replica, request).await
    }

    async fn poll(&self, request: PollRequest) -> PollResponse {
        active::handle_poll(&self.shared.replica, request).await
    }

    async fn append(&self, request: AppendRequest) -> AppendResponse {
        let replica = &self.shared.replica;
        if request.term > replica.term() {
            if let Err(e) = replica.step_down(Some(request.term), Some(request.leader.clone())) {
                warn!(error = %e, "failed to step down for newer leader");
            }
            return passive::handle_append(replica, request).await;
        }
        // Two leaders cannot share a term; anything at or below ours is
        // stale.
        if request.term == replica.term() {
            warn!(leader = %request.leader, term = %request.term, "append from a leader of our own term");
        }
        AppendResponse::ok(
            replica.term(),
            false,
            replica
                .log()
                .last_entry()
                .map(|(index, _)| index)
                .unwrap_or(Index::ZERO),
        )
    }

    async fn install(&self, chunks: mpsc::Receiver<InstallRequest>) -> InstallResponse {
        passive::handle_install(&self.shared.replica, chunks).await
    }

    async fn configure(&self, request: ConfigureRequest) -> ConfigureResponse {
        let replica = &self.shared.replica;
        if request.term > replica.term() {
            if let Err(e) = replica.step_down(Some(request.term), Some(request.leader.clone())) {
                warn!(error = %e, "failed to step down for configure");
            }
            return passive::handle_configure(replica, request);
        }
        ConfigureResponse::rejected(ResponseError::ProtocolError, replica.term())
    }

    async fn join(&self, request: JoinRequest) -> JoinResponse {
        let _writer = self.membership.lock().await;
        let replica = &self.shared.replica;
        let index = replica
            .log()
            .last_entry()
            .map(|(index, _)| index)
            .unwrap_or(Index::ZERO);
        if replica.cluster().contains(&request.member) {
            JoinResponse {
                status: ResponseStatus::Ok,
                error: None,
                term: self.term,
                index,
                members: replica.members(),
            }
        } else {
            // Admission of new members happens out of band.
            JoinResponse {
                status: ResponseStatus::Error,
                error: Some(ResponseError::ProtocolError),
                term: self.term,
                index,
                members: replica.members(),
            }
        }
    }

    async fn leave(&self, request: LeaveRequest) -> LeaveResponse {
        let _writer = self.membership.lock().await;
        let replica = &self.shared.replica;
        let index = replica
            .log()
            .last_entry()
            .map(|(index, _)| index)
            .unwrap_or(Index::ZERO);
        if replica.cluster().contains(&request.member) {
            LeaveResponse {
                status: ResponseStatus::Ok,
                error: None,
                term: self.term,
                index,
                members: replica.members(),
            }
        } else {
            LeaveResponse {
                status: ResponseStatus::Error,
                error: Some(ResponseError::ProtocolError),
                term: self.term,
                index,
                members: replica.members(),
            }
        }
    }

    async fn reconfigure(&self, request: ReconfigureRequest) -> ReconfigureResponse {
        let _writer = self.membership.lock().await;
        let replica = &self.shared.replica;
        let index = replica
            .log()
            .last_entry()
            .map(|(index, _)| index)
            .unwrap_or(Index::ZERO);
        let known = replica.cluster().contains(&request.member);
        ReconfigureResponse {
            status: if known {
                ResponseStatus::Ok
            } else {
                ResponseStatus::Error
            },
            error: if known {
                None
            } else {
                Some(ResponseError::ProtocolError)
            },
            term: self.term,
            index,
            members: replica.members(),
        }
    }

    async fn transfer(&self, request: TransferRequest) -> TransferResponse {
        let _writer = self.membership.lock().await;
        let replica = &self.shared.replica;
        if request.member == *replica.member() {
            return TransferResponse::ok(self.term);
        }
        if !replica.cluster().contains(&request.member) {
            return TransferResponse::rejected(ResponseError::ProtocolError, self.term);
        }

        // Catch the target up to the log tail, then step down.
        let deadline = Instant::now() + replica.config().election_timeout;
        loop {
            if !self.shared.is_active() {
                return TransferResponse::rejected(ResponseError::IllegalMemberState, self.term);
            }
            let last = replica
                .log()
                .last_entry()
                .map(|(index, _)| index)
                .unwrap_or(Index::ZERO);
            let matched = self
                .progress
                .lock()
                .get(&request.member)
                .map(|p| p.matched)
                .unwrap_or(Index::ZERO);
            if matched >= last {
                break;
            }
            if Instant::now() >= deadline {
                warn!(target = %request.member, "transfer target failed to catch up");
                return TransferResponse::rejected(ResponseError::ProtocolError, self.term);
            }
            let caught_up = replicate_to_peer(
                Arc::clone(replica),
                Arc::clone(&self.shared.active),
                self.term,
                Arc::clone(&self.progress),
                request.member.clone(),
            )
            .await;
            if !caught_up {
                tokio::time::sleep(replica.config().heartbeat_interval / 2).await;
            }
        }
        info!(target = %request.member, term = %self.term, "transferring leadership; stepping down");
        replica.step(&self.shared.active, RoleType::Follower);
        TransferResponse::ok(self.term)
    }

    async fn command(&self, request: CommandRequest, responses: mpsc::Sender<CommandResponse>) {
        let replica = &self.shared.replica;
        let entry = match self.append_local(EntryPayload::Command(request.payload)) {
            Ok(entry) => entry,
            Err(e) => {
                error!(error = %e, "failed to append command; stepping down");
                let _ = responses
                    .send(CommandResponse::rejected(
                        ResponseError::ProtocolError,
                        self.term,
                        None,
                    ))
                    .await;
                replica.step(&self.shared.active, RoleType::Follower);
                return;
            }
        };
        debug!(index = %entry.index, "command appended");

        let waiter = replica.register_applied_waiter(entry.index);
        self.replicate_now.notify_one();

        match waiter.await {
            Ok(Ok(output)) => {
                let _ = responses
                    .send(CommandResponse::ok(self.term, entry.index, output))
                    .await;
            }
            Ok(Err(e)) => {
                let error = match e {
                    crate::error::RaftError::Application { .. } => ResponseError::ApplicationError,
                    crate::error::RaftError::NoLeader | crate::error::RaftError::Closed => {
                        ResponseError::NoLeader
                    }
                    _ => ResponseError::ProtocolError,
                };
                let _ = responses
                    .send(CommandResponse::rejected(
                        error,
                        replica.term(),
                        replica.leader(),
                    ))
                    .await;
            }
            Err(_) => {
                let _ = responses
                    .send(CommandResponse::rejected(
                        ResponseError::NoLeader,
                        replica.term(),
                        replica.leader(),
                    ))
                    .await;
            }
        }
    }

    async fn query(&self, request: QueryRequest, responses: mpsc::Sender<QueryResponse>) {
        match request.consistency {
            ReadConsistency::Sequential => {
                self.serve_query(&request, &responses).await;
            }
            ReadConsistency::LinearizableLease => {
                // The lease window stays below the election timeout; an
                // expired lease falls back to a quorum round.
                let lease = self.shared.replica.config().lease_duration();
                let lease_fresh = self
                    .last_quorum_ack
                    .lock()
                    .map(|ack| ack.elapsed() < lease)
                    .unwrap_or(false);
                if lease_fresh || self.confirm_leadership().await {
                    self.serve_query(&request, &responses).await;
                } else {
                    let _ = responses
                        .send(QueryResponse::rejected(ResponseError::NoLeader))
                        .await;
                }
            }
            ReadConsistency::Linearizable => {
                if self.confirm_leadership().await {
                    self.serve_query(&request, &responses).await;
                } else {
                    let _ = responses
                        .send(QueryResponse::rejected(ResponseError::NoLeader))
                        .await;
                }
            }
        }
    }
}

/// Heartbeat and replication driver.
///
/// Every tick (or explicit nudge after a local append) replicates to all
/// peers, refreshes the quorum-ack timestamp, and tries to advance the
/// commit index.
async fn heartbeat_loop(
    replica: Arc<Replica>,
    active: Arc<AtomicBool>,
    term: Term,
    progress: Arc<Mutex<HashMap<MemberId, Progress>>>,
    replicate_now: Arc<Notify>,
    last_quorum_ack: Arc<Mutex<Option<Instant>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(replica.config().heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = replicate_now.notified() => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
                continue;
            }
        }
        if !active.load(Ordering::Acquire) {
            return;
        }

        let peers = replica.cluster().peers();
        let rounds = peers.into_iter().map(|peer| {
            replicate_to_peer(
                Arc::clone(&replica),
                Arc::clone(&active),
                term,
                Arc::clone(&progress),
                peer,
            )
        });
        let successes = futures::future::join_all(rounds)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();

        if !active.load(Ordering::Acquire) {
            return;
        }
        if successes + 1 >= replica.cluster().quorum() {
            *last_quorum_ack.lock() = Some(Instant::now());
        }
        advance_commit(&replica, term, &progress);
    }
}

/// Send one AppendRequest to a peer: entries from its next index (bounded
/// by the batch budget), or an empty heartbeat when it is caught up.
async fn replicate_to_peer(
    replica: Arc<Replica>,
    active: Arc<AtomicBool>,
    term: Term,
    progress: Arc<Mutex<HashMap<MemberId, Progress>>>,
    peer: MemberId,
) -> bool {
    let next = match progress.lock().get(&peer) {
        Some(p) => p.next,
        None => return false,
    };
    let log = replica.log();
    let prev_log_index = next.prev().unwrap_or(Index::ZERO);
    let prev_log_term = if prev_log_index == Index::ZERO {
        Term::ZERO
    } else {
        match log.entry(prev_log_index) {
            Ok(Some(entry)) => entry.term,
            Ok(None) => match log.last_entry() {
                // Compacted away; only the snapshot boundary can match.
                Some((index, t)) if index == prev_log_index => t,
                _ => Term::ZERO,
            },
            Err(e) => {
                warn!(error = %e, index = %prev_log_index, "log read failed");
                return false;
            }
        }
    };

    let last = log.last_entry().map(|(index, _)| index).unwrap_or(Index::ZERO);
    let mut entries = Vec::new();
    if next <= last {
        match log.entries(next, last.next()) {
            Ok(available) => {
                let budget = replica.config().max_batch_size;
                let mut size = 0usize;
                for entry in available {
                    size += entry.payload.size();
                    entries.push(entry);
                    if size >= budget {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "log range read failed");
                return false;
            }
        }
    }
    let sent_last = entries.last().map(|e| e.index).unwrap_or(prev_log_index);

    let request = AppendRequest {
        term,
        leader: replica.member().clone(),
        prev_log_index,
        prev_log_term,
        entries,
        commit_index: replica.commit_index(),
    };

    match replica.client().append(request, &peer).await {
        Err(e) => {
            debug!(peer = %peer, error = %e, "append to peer failed");
            false
        }
        Ok(response) => {
            if response.term > term {
                debug!(peer = %peer, term = %response.term, "peer reported greater term; stepping down");
                if active.load(Ordering::Acquire) {
                    if let Err(e) = replica.step_down(Some(response.term), None) {
                        warn!(error = %e, "failed to adopt greater term");
                    }
                }
                return false;
            }
            let mut progress = progress.lock();
            let Some(p) = progress.get_mut(&peer) else {
                return false;
            };
            if response.succeeded {
                p.matched = p.matched.max(sent_last);
                p.next = p.matched.next();
                true
            } else {
                // Back off to the peer's hint and retry on the next round.
                let floor = Index(1);
                let backed_off = next.prev().unwrap_or(floor);
                p.next = response.last_log_index.next().min(backed_off).max(floor);
                debug!(peer = %peer, next = %p.next, "consistency check failed; backing off");
                false
            }
        }
    }
}

/// Advance the commit index to the largest index a quorum has matched,
/// provided the entry there carries the leader's term.
fn advance_commit(
    replica: &Arc<Replica>,
    term: Term,
    progress: &Arc<Mutex<HashMap<MemberId, Progress>>>,
) {
    let last = replica
        .log()
        .last_entry()
        .map(|(index, _)| index)
        .unwrap_or(Index::ZERO);
    let mut indexes: Vec<Index> = progress.lock().values().map(|p| p.matched).collect();
    indexes.push(last);
    indexes.sort_unstable_by(|a, b| b.cmp(a));

    let quorum = replica.cluster().quorum();
    let Some(candidate) = indexes.get(quorum - 1).copied() else {
        return;
    };
    if candidate <= replica.commit_index() {
        return;
    }
    // Entries below the candidate carry older or equal terms, so if the
    // candidate itself is from a prior term nothing above the current
    // commit is safe yet.
    match replica.log().entry(candidate) {
        Ok(Some(entry)) if entry.term == term => {
            let previous = replica.commit(candidate);
            debug!(from = %previous, to = %candidate, "commit index advanced");
        }
        Ok(_) => {}
        Err(e) => {
            warn!(error = %e, index = %candidate, "log read failed during commit advancement");
        }
    }
}
