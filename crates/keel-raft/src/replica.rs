//! The shared protocol state holder.
//!
//! A [`Replica`] owns the mutable consensus state of one cluster member:
//! term, vote, leader, commit index, lifecycle status, and the current
//! role. Roles consult and mutate the state through the methods here; the
//! state lock is internal and is never held across peer I/O, log waits, or
//! listener callbacks.
//!
//! # Locking
//!
//! Two locks order the world: the role-transition lock and the state lock,
//! always acquired in that order. Every mutator acquires the state lock
//! per call; compound critical sections (election round bookkeeping,
//! step-down with a term adoption) are dedicated methods so callers never
//! hold a lock across an await point.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::client::PeerClient;
use crate::cluster::Cluster;
use crate::config::ProtocolConfig;
use crate::error::{RaftError, Result};
use crate::event::{Event, EventSink};
use crate::roles::{Role, RoleFactories};
use crate::state_machine::StateMachine;
use crate::store::{LogStore, MetadataStore};
use crate::types::*;

/// Mutable protocol state guarded by the state lock.
struct ProtocolState {
    term: Term,
    voted_for: Option<MemberId>,
    leader: Option<MemberId>,
    commit_index: Index,
    first_commit_index: Option<Index>,
    status: Status,
    role: RoleType,
}

struct RoleSlot {
    role: Option<Arc<dyn Role>>,
}

/// One member of a consensus cluster.
pub struct Replica {
    cluster: Cluster,
    config: ProtocolConfig,
    client: Arc<dyn PeerClient>,
    log: Arc<dyn LogStore>,
    metadata: Arc<dyn MetadataStore>,
    state_machine: tokio::sync::Mutex<Box<dyn StateMachine>>,
    roles: RoleFactories,

    state: RwLock<ProtocolState>,
    /// Serializes role transitions; ordered before the state lock.
    slot: Mutex<RoleSlot>,

    listeners: Arc<Mutex<Vec<EventSink>>>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,

    commit_tx: watch::Sender<Index>,
    applied_tx: watch::Sender<Index>,
    pending_applies: Mutex<HashMap<Index, oneshot::Sender<Result<Bytes>>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Replica {
    /// Construct a replica, restoring term and vote from the metadata
    /// store. The replica starts `Stopped`; call [`Replica::init`] from
    /// within a tokio runtime to bring it up as a follower.
    pub fn new(
        cluster: Cluster,
        config: ProtocolConfig,
        client: Arc<dyn PeerClient>,
        log: Arc<dyn LogStore>,
        metadata: Arc<dyn MetadataStore>,
        state_machine: Box<dyn StateMachine>,
        roles: RoleFactories,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let (term, voted_for) = metadata.load()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commit_tx, _) = watch::channel(Index::ZERO);
        let (applied_tx, _) = watch::channel(Index::ZERO);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            cluster,
            config,
            client,
            log,
            metadata,
            state_machine: tokio::sync::Mutex::new(state_machine),
            roles,
            state: RwLock::new(ProtocolState {
                term,
                voted_for,
                leader: None,
                commit_index: Index::ZERO,
                first_commit_index: None,
                status: Status::Stopped,
                role: RoleType::Follower,
            }),
            slot: Mutex::new(RoleSlot { role: None }),
            listeners: Arc::new(Mutex::new(Vec::new())),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            commit_tx,
            applied_tx,
            pending_applies: Mutex::new(HashMap::new()),
            shutdown_tx,
        }))
    }

    // ---- lifecycle ----

    /// Transition `Stopped → Running` and start the follower role.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write();
            if state.status != Status::Stopped {
                return Ok(());
            }
            state.status = Status::Running;
            let _ = self.events_tx.send(Event::Status(Status::Running));
        }
        self.spawn_event_dispatcher();
        let _ = self.shutdown_tx.send(false);
        self.spawn_apply_task();
        self.set_role(RoleType::Follower);
        info!(member = %self.cluster.member(), "replica initialized");
        Ok(())
    }

    /// Stop the current role and transition to `Stopped`. Durable fields
    /// remain persisted.
    pub fn close(&self) -> Result<()> {
        {
            let mut slot = self.slot.lock();
            if let Some(role) = slot.role.take() {
                role.stop();
            }
        }
        {
            let mut state = self.state.write();
            if state.status == Status::Stopped {
                return Ok(());
            }
            state.status = Status::Stopped;
            let _ = self.events_tx.send(Event::Status(Status::Stopped));
        }
        let _ = self.shutdown_tx.send(true);
        for (_, tx) in self.pending_applies.lock().drain() {
            let _ = tx.send(Err(RaftError::Closed));
        }
        info!(member = %self.cluster.member(), "replica closed");
        Ok(())
    }

    /// Register a listener for status and role events. Events arrive in
    /// the order the serialized state mutations emitted them.
    pub fn watch(&self, sink: impl Fn(Event) + Send + Sync + 'static) {
        self.listeners.lock().push(Box::new(sink));
    }

    // ---- snapshot reads ----

    pub fn status(&self) -> Status {
        self.state.read().status
    }

    pub fn term(&self) -> Term {
        self.state.read().term
    }

    pub fn leader(&self) -> Option<MemberId> {
        self.state.read().leader.clone()
    }

    pub fn last_voted_for(&self) -> Option<MemberId> {
        self.state.read().voted_for.clone()
    }

    pub fn commit_index(&self) -> Index {
        self.state.read().commit_index
    }

    pub fn role(&self) -> RoleType {
        self.state.read().role
    }

    pub fn member(&self) -> &MemberId {
        self.cluster.member()
    }

    pub fn members(&self) -> Vec<MemberId> {
        self.cluster.members()
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub(crate) fn client(&self) -> &Arc<dyn PeerClient> {
        &self.client
    }

    pub(crate) fn log(&self) -> &Arc<dyn LogStore> {
        &self.log
    }

    pub(crate) fn state_machine(&self) -> &tokio::sync::Mutex<Box<dyn StateMachine>> {
        &self.state_machine
    }

    // ---- mutators ----

    /// Adopt a new term. Fails on regression; advancing persists the term
    /// with a cleared vote before touching memory, then resets the vote
    /// and leader.
    pub fn set_term(&self, term: Term) -> Result<()> {
        let mut state = self.state.write();
        self.set_term_locked(&mut state, term)
    }

    fn set_term_locked(&self, state: &mut ProtocolState, term: Term) -> Result<()> {
        if term < state.term {
            return Err(RaftError::TermRegression {
                current: state.term,
                requested: term,
            });
        }
        if term > state.term {
            self.metadata.store(term, None)?;
            state.term = term;
            state.voted_for = None;
            state.leader = None;
            debug!(term = %term, "term advanced");
        }
        Ok(())
    }

    /// Record this replica's vote for the current term. At most one vote
    /// per term; re-recording the same vote is a no-op.
    pub fn set_last_voted_for(&self, member: MemberId) -> Result<()> {
        let mut state = self.state.write();
        self.set_vote_locked(&mut state, member)
    }

    fn set_vote_locked(&self, state: &mut ProtocolState, member: MemberId) -> Result<()> {
        if member.is_empty() {
            return Err(RaftError::InvalidVote { member });
        }
        if !self.cluster.contains(&member) {
            return Err(RaftError::UnknownMember { member });
        }
        match &state.voted_for {
            Some(existing) if *existing == member => Ok(()),
            Some(existing) => Err(RaftError::AlreadyVoted {
                term: state.term,
                voted_for: existing.clone(),
            }),
            None => {
                self.metadata.store(state.term, Some(&member))?;
                debug!(candidate = %member, term = %state.term, "vote recorded");
                state.voted_for = Some(member);
                Ok(())
            }
        }
    }

    /// Record or clear the leader of the current term. The leader may be
    /// set at most once per term; clearing is always allowed.
    pub fn set_leader(&self, leader: Option<MemberId>) -> Result<()> {
        let mut state = self.state.write();
        match leader {
            None => {
                state.leader = None;
                Ok(())
            }
            Some(member) => {
                if !self.cluster.contains(&member) {
                    return Err(RaftError::UnknownMember { member });
                }
                match &state.leader {
                    Some(existing) if *existing == member => Ok(()),
                    Some(existing) => Err(RaftError::LeaderConflict {
                        term: state.term,
                        leader: existing.clone(),
                    }),
                    None => {
                        info!(leader = %member, term = %state.term, "leader learned");
                        state.leader = Some(member);
                        Ok(())
                    }
                }
            }
        }
    }

    /// Record the first commit index observed after startup; used to gate
    /// the `Ready` transition. Write-once, later calls are ignored.
    pub fn set_commit_index(&self, index: Index) {
        let mut state = self.state.write();
        if state.first_commit_index.is_none() {
            state.first_commit_index = Some(index);
            debug!(index = %index, "first commit index recorded");
        }
    }

    /// Advance the commit index. Returns the previous value when
    /// advancing, or the unchanged current value otherwise. Transitions
    /// `Running → Ready` once the first commit index is reached.
    pub fn commit(&self, index: Index) -> Index {
        let mut state = self.state.write();
        if index <= state.commit_index {
            return state.commit_index;
        }
        let previous = state.commit_index;
        state.commit_index = index;
        if state.status == Status::Running {
            if let Some(first) = state.first_commit_index {
                if index >= first {
                    state.status = Status::Ready;
                    let _ = self.events_tx.send(Event::Status(Status::Ready));
                    info!(commit = %index, "replica caught up; ready");
                }
            }
        }
        self.commit_tx.send_replace(index);
        previous
    }

    // ---- role transitions ----

    /// Stop the current role and start `role_type` from the factory map.
    /// A request for the already-current role is a no-op.
    pub fn set_role(self: &Arc<Self>, role_type: RoleType) {
        let mut slot = self.slot.lock();
        self.change_role(&mut slot, role_type);
    }

    fn change_role(self: &Arc<Self>, slot: &mut RoleSlot, role_type: RoleType) {
        if slot.role.as_ref().map(|r| r.role_type()) == Some(role_type) {
            return;
        }
        let Some(factory) = self.roles.get(role_type) else {
            warn!(role = %role_type, "no factory registered for role");
            return;
        };
        if let Some(old) = slot.role.take() {
            old.stop();
        }
        let role = factory(Arc::clone(self));
        {
            let mut state = self.state.write();
            state.role = role_type;
            let _ = self.events_tx.send(Event::Role(role_type));
        }
        info!(role = %role_type, term = %self.term(), "role transition");
        if let Err(e) = role.start() {
            error!(role = %role_type, error = %e, "role failed to start");
        }
        slot.role = Some(role);
    }

    /// Transition requested by a running role. Aborts if the requester
    /// was already stopped by a concurrent transition.
    pub(crate) fn step(self: &Arc<Self>, active: &AtomicBool, role_type: RoleType) -> bool {
        let mut slot = self.slot.lock();
        if !active.load(Ordering::Acquire) {
            return false;
        }
        self.change_role(&mut slot, role_type);
        true
    }

    /// Promote a candidate to leader, re-validating under the transition
    /// lock that the election term still stands and no leader emerged.
    pub(crate) fn step_to_leader(
        self: &Arc<Self>,
        active: &AtomicBool,
        election_term: Term,
    ) -> bool {
        let mut slot = self.slot.lock();
        if !active.load(Ordering::Acquire) {
            return false;
        }
        {
            let state = self.state.read();
            if state.term != election_term || state.leader.is_some() {
                return false;
            }
        }
        self.change_role(&mut slot, RoleType::Leader);
        true
    }

    /// Adopt `term` (and optionally the leader that proved it) and revert
    /// to follower, all under the transition lock so no concurrent
    /// transition interleaves.
    pub(crate) fn step_down(
        self: &Arc<Self>,
        term: Option<Term>,
        leader: Option<MemberId>,
    ) -> Result<()> {
        let mut slot = self.slot.lock();
        let result = match term {
            Some(t) => self.set_term(t),
            None => Ok(()),
        }
        .and_then(|_| match leader {
            Some(l) => self.set_leader(Some(l)),
            None => Ok(()),
        });
        self.change_role(&mut slot, RoleType::Follower);
        result
    }

    /// Term + self-vote bookkeeping for one election round, in a single
    /// critical section.
    pub(crate) fn begin_election_round(&self) -> Result<Term> {
        let mut state = self.state.write();
        let next = state.term.next();
        self.set_term_locked(&mut state, next)?;
        self.set_vote_locked(&mut state, self.cluster.member().clone())?;
        Ok(next)
    }

    /// Adopt a greater term and/or record the leader of the current term.
    /// Returns whether anything changed.
    pub(crate) fn update_term_and_leader(
        &self,
        term: Term,
        leader: Option<&MemberId>,
    ) -> Result<bool> {
        let mut state = self.state.write();
        let mut updated = false;
        if term > state.term {
            self.set_term_locked(&mut state, term)?;
            updated = true;
        }
        if let Some(leader) = leader {
            if term == state.term && state.leader.is_none() {
                if self.cluster.contains(leader) {
                    state.leader = Some(leader.clone());
                    updated = true;
                } else {
                    warn!(leader = %leader, "ignoring unknown leader");
                }
            }
        }
        Ok(updated)
    }

    // ---- apply plumbing ----

    /// Wait until the state machine has applied up to `index`.
    pub(crate) async fn wait_applied(&self, index: Index) -> Result<()> {
        let mut rx = self.applied_tx.subscribe();
        loop {
            if *rx.borrow_and_update() >= index {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(RaftError::Closed);
            }
        }
    }

    /// Register interest in the apply result of the entry at `index`.
    pub(crate) fn register_applied_waiter(
        &self,
        index: Index,
    ) -> oneshot::Receiver<Result<Bytes>> {
        let (tx, rx) = oneshot::channel();
        self.pending_applies.lock().insert(index, tx);
        rx
    }

    /// Fail all registered apply waiters; used when leadership is lost.
    pub(crate) fn cancel_applied_waiters(&self) {
        for (_, tx) in self.pending_applies.lock().drain() {
            let _ = tx.send(Err(RaftError::NoLeader));
        }
    }

    /// Fast-forward the applied watermark past a snapshot boundary.
    pub(crate) fn note_applied(&self, index: Index) {
        self.applied_tx.send_if_modified(|current| {
            if index > *current {
                *current = index;
                true
            } else {
                false
            }
        });
    }

    fn spawn_event_dispatcher(&self) {
        let Some(mut events_rx) = self.events_rx.lock().take() else {
            return;
        };
        let listeners = Arc::clone(&self.listeners);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                for sink in listeners.lock().iter() {
                    sink(event);
                }
            }
        });
    }

    fn spawn_apply_task(self: &Arc<Self>) {
        let replica = Arc::clone(self);
        let mut commit_rx = self.commit_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = commit_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                        continue;
                    }
                }
                replica.apply_committed().await;
            }
        });
    }

    /// Apply entries `(applied, commit]` to the state machine, in order,
    /// resolving any registered waiters.
    async fn apply_committed(&self) {
        loop {
            let commit = self.commit_index();
            let applied = *self.applied_tx.borrow();
            if applied >= commit {
                return;
            }
            let mut next = applied.next();
            let first = self.log.first_index();
            if next < first {
                // Prefix replaced by a snapshot; the state machine was
                // restored when it was installed.
                next = first;
                if let Some(boundary) = first.prev() {
                    self.note_applied(boundary);
                }
                continue;
            }
            match self.log.entry(next) {
                Ok(Some(entry)) => {
                    let result = {
                        let mut sm = self.state_machine.lock().await;
                        sm.apply(&entry).await
                    };
                    let waiter = self.pending_applies.lock().remove(&entry.index);
                    match result {
                        Ok(output) => {
                            if let Some(tx) = waiter {
                                let _ = tx.send(Ok(output));
                            }
                        }
                        Err(e) => {
                            error!(index = %entry.index, error = %e, "state machine apply failed");
                            if let Some(tx) = waiter {
                                let _ = tx.send(Err(e));
                            }
                        }
                    }
                    self.note_applied(next);
                }
                Ok(None) => return,
                Err(e) => {
                    error!(index = %next, error = %e, "failed to read committed entry");
                    return;
                }
            }
        }
    }

    // ---- RPC dispatch ----

    fn current_role(&self) -> Option<Arc<dyn Role>> {
        self.slot.lock().role.clone()
    }

    pub async fn join(&self, request: JoinRequest) -> JoinResponse {
        match self.current_role() {
            Some(role) => role.join(request).await,
            None => JoinResponse::illegal_member_state(),
        }
    }

    pub async fn leave(&self, request: LeaveRequest) -> LeaveResponse {
        match self.current_role() {
            Some(role) => role.leave(request).await,
            None => LeaveResponse::illegal_member_state(),
        }
    }

    pub async fn configure(&self, request: ConfigureRequest) -> ConfigureResponse {
        match self.current_role() {
            Some(role) => role.configure(request).await,
            None => ConfigureResponse::illegal_member_state(),
        }
    }

    pub async fn reconfigure(&self, request: ReconfigureRequest) -> ReconfigureResponse {
        match self.current_role() {
            Some(role) => role.reconfigure(request).await,
            None => ReconfigureResponse::illegal_member_state(),
        }
    }

    pub async fn poll(&self, request: PollRequest) -> PollResponse {
        match self.current_role() {
            Some(role) => role.poll(request).await,
            None => PollResponse::illegal_member_state(),
        }
    }

    pub async fn vote(&self, request: VoteRequest) -> VoteResponse {
        match self.current_role() {
            Some(role) => role.vote(request).await,
            None => VoteResponse::illegal_member_state(),
        }
    }

    pub async fn transfer(&self, request: TransferRequest) -> TransferResponse {
        match self.current_role() {
            Some(role) => role.transfer(request).await,
            None => TransferResponse::illegal_member_state(),
        }
    }

    pub async fn append(&self, request: AppendRequest) -> AppendResponse {
        match self.current_role() {
            Some(role) => role.append(request).await,
            None => AppendResponse::illegal_member_state(),
        }
    }

    pub async fn install(&self, chunks: mpsc::Receiver<InstallRequest>) -> InstallResponse {
        match self.current_role() {
            Some(role) => role.install(chunks).await,
            None => InstallResponse::illegal_member_state(),
        }
    }

    pub async fn command(&self, request: CommandRequest, responses: mpsc::Sender<CommandResponse>) {
        match self.current_role() {
            Some(role) => role.command(request, responses).await,
            None => {
                let _ = responses.send(CommandResponse::illegal_member_state()).await;
            }
        }
    }

    pub async fn query(&self, request: QueryRequest, responses: mpsc::Sender<QueryResponse>) {
        match self.current_role() {
            Some(role) => role.query(request, responses).await,
            None => {
                let _ = responses.send(QueryResponse::illegal_member_state()).await;
            }
        }
    }
}
