//! Per-role protocol state machines.
//!
//! Every role exposes the full RPC surface; the trait's default method
//! bodies reject with `ILLEGAL_MEMBER_STATE`, and each role overrides only
//! the handlers it services. The shared follower-side logic lives in
//! [`passive`], the shared voter logic in [`active`]; concrete roles
//! compose them by delegation.

pub(crate) mod active;
pub(crate) mod passive;

mod candidate;
mod follower;
mod leader;

pub use candidate::CandidateRole;
pub use follower::FollowerRole;
pub use leader::LeaderRole;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::error::Result;
use crate::replica::Replica;
use crate::types::*;

/// One behavior of a replica: follower, candidate, or leader.
///
/// `start` must not block; long-running work (timers, elections,
/// replication) is spawned onto the runtime. `stop` marks the role
/// inactive so in-flight asynchronous callbacks observe the deactivation
/// and become no-ops.
#[async_trait]
pub trait Role: Send + Sync {
    fn role_type(&self) -> RoleType;

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {}

    async fn join(&self, _request: JoinRequest) -> JoinResponse {
        JoinResponse::illegal_member_state()
    }

    async fn leave(&self, _request: LeaveRequest) -> LeaveResponse {
        LeaveResponse::illegal_member_state()
    }

    async fn configure(&self, _request: ConfigureRequest) -> ConfigureResponse {
        ConfigureResponse::illegal_member_state()
    }

    async fn reconfigure(&self, _request: ReconfigureRequest) -> ReconfigureResponse {
        ReconfigureResponse::illegal_member_state()
    }

    async fn poll(&self, _request: PollRequest) -> PollResponse {
        PollResponse::illegal_member_state()
    }

    async fn vote(&self, _request: VoteRequest) -> VoteResponse {
        VoteResponse::illegal_member_state()
    }

    async fn transfer(&self, _request: TransferRequest) -> TransferResponse {
        TransferResponse::illegal_member_state()
    }

    async fn append(&self, _request: AppendRequest) -> AppendResponse {
        AppendResponse::illegal_member_state()
    }

    async fn install(&self, _chunks: mpsc::Receiver<InstallRequest>) -> InstallResponse {
        InstallResponse::illegal_member_state()
    }

    async fn command(&self, _request: CommandRequest, responses: mpsc::Sender<CommandResponse>) {
        let _ = responses.send(CommandResponse::illegal_member_state()).await;
    }

    async fn query(&self, _request: QueryRequest, responses: mpsc::Sender<QueryResponse>) {
        let _ = responses.send(QueryResponse::illegal_member_state()).await;
    }
}

/// Constructor for a role, given the shared replica handle.
pub type RoleFactory = Box<dyn Fn(Arc<Replica>) -> Arc<dyn Role> + Send + Sync>;

/// Mapping from role type to constructor, passed at replica construction.
#[derive(Default)]
pub struct RoleFactories {
    factories: HashMap<RoleType, RoleFactory>,
}

impl RoleFactories {
    /// An empty map; requests are rejected until roles are registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard follower/candidate/leader wiring.
    pub fn standard() -> Self {
        let mut factories = Self::new();
        factories.register(RoleType::Follower, |replica| {
            Arc::new(FollowerRole::new(replica)) as Arc<dyn Role>
        });
        factories.register(RoleType::Candidate, |replica| {
            Arc::new(CandidateRole::new(replica)) as Arc<dyn Role>
        });
        factories.register(RoleType::Leader, |replica| {
            Arc::new(LeaderRole::new(replica)) as Arc<dyn Role>
        });
        factories
    }

    pub fn register(
        &mut self,
        role_type: RoleType,
        factory: impl Fn(Arc<Replica>) -> Arc<dyn Role> + Send + Sync + 'static,
    ) {
        self.factories.insert(role_type, Box::new(factory));
    }

    pub(crate) fn get(&self, role_type: RoleType) -> Option<&RoleFactory> {
        self.factories.get(&role_type)
    }
}

/// State every concrete role carries: the replica handle, the activity
/// flag re-checked by asynchronous callbacks, and the shutdown signal for
/// the role's background tasks.
pub(crate) struct RoleShared {
    pub(crate) replica: Arc<Replica>,
    pub(crate) active: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl RoleShared {
    pub(crate) fn new(replica: Arc<Replica>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            replica,
            active: Arc::new(AtomicBool::new(true)),
            shutdown_tx,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
    }

    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}
