//! Typed peer-to-peer RPC client boundary.
//!
//! The wire transport (encoding, connections, retries) lives outside the
//! core; roles send requests to named peers through [`PeerClient`]. The
//! [`LoopbackNetwork`] implementation wires replicas together in-process
//! for tests and single-machine clusters.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{RaftError, Result};
use crate::replica::Replica;
use crate::types::*;

/// Sends typed requests to named peers.
///
/// Implementations are stateless with respect to callers; a failure is
/// reported per call and absorbed by the caller's quorum arithmetic.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn vote(&self, request: VoteRequest, peer: &MemberId) -> Result<VoteResponse>;

    async fn poll(&self, request: PollRequest, peer: &MemberId) -> Result<PollResponse>;

    async fn append(&self, request: AppendRequest, peer: &MemberId) -> Result<AppendResponse>;

    /// Stream snapshot chunks to a peer; resolves with the final response.
    async fn install(
        &self,
        chunks: mpsc::Receiver<InstallRequest>,
        peer: &MemberId,
    ) -> Result<InstallResponse>;

    async fn transfer(&self, request: TransferRequest, peer: &MemberId)
        -> Result<TransferResponse>;

    async fn configure(
        &self,
        request: ConfigureRequest,
        peer: &MemberId,
    ) -> Result<ConfigureResponse>;

    async fn reconfigure(
        &self,
        request: ReconfigureRequest,
        peer: &MemberId,
    ) -> Result<ReconfigureResponse>;

    async fn join(&self, request: JoinRequest, peer: &MemberId) -> Result<JoinResponse>;

    async fn leave(&self, request: LeaveRequest, peer: &MemberId) -> Result<LeaveResponse>;

    /// Forward a command; responses stream back through `responses`.
    async fn command(
        &self,
        request: CommandRequest,
        peer: &MemberId,
        responses: mpsc::Sender<CommandResponse>,
    ) -> Result<()>;

    /// Forward a query; responses stream back through `responses`.
    async fn query(
        &self,
        request: QueryRequest,
        peer: &MemberId,
        responses: mpsc::Sender<QueryResponse>,
    ) -> Result<()>;
}

/// Client for a replica with no reachable peers.
///
/// Every send fails with [`RaftError::PeerUnavailable`]; useful for
/// exercising the protocol state without a cluster.
#[derive(Debug, Default)]
pub struct UnreachablePeerClient;

macro_rules! unreachable_send {
    ($self:ident, $peer:ident) => {
        Err(RaftError::PeerUnavailable {
            member: $peer.clone(),
        })
    };
}

#[async_trait]
impl PeerClient for UnreachablePeerClient {
    async fn vote(&self, _request: VoteRequest, peer: &MemberId) -> Result<VoteResponse> {
        unreachable_send!(self, peer)
    }

    async fn poll(&self, _request: PollRequest, peer: &MemberId) -> Result<PollResponse> {
        unreachable_send!(self, peer)
    }

    async fn append(&self, _request: AppendRequest, peer: &MemberId) -> Result<AppendResponse> {
        unreachable_send!(self, peer)
    }

    async fn install(
        &self,
        _chunks: mpsc::Receiver<InstallRequest>,
        peer: &MemberId,
    ) -> Result<InstallResponse> {
        unreachable_send!(self, peer)
    }

    async fn transfer(
        &self,
        _request: TransferRequest,
        peer: &MemberId,
    ) -> Result<TransferResponse> {
        unreachable_send!(self, peer)
    }

    async fn configure(
        &self,
        _request: ConfigureRequest,
        peer: &MemberId,
    ) -> Result<ConfigureResponse> {
        unreachable_send!(self, peer)
    }

    async fn reconfigure(
        &self,
        _request: ReconfigureRequest,
        peer: &MemberId,
    ) -> Result<ReconfigureResponse> {
        unreachable_send!(self, peer)
    }

    async fn join(&self, _request: JoinRequest, peer: &MemberId) -> Result<JoinResponse> {
        unreachable_send!(self, peer)
    }

    async fn leave(&self, _request: LeaveRequest, peer: &MemberId) -> Result<LeaveResponse> {
        unreachable_send!(self, peer)
    }

    async fn command(
        &self,
        _request: CommandRequest,
        peer: &MemberId,
        _responses: mpsc::Sender<CommandResponse>,
    ) -> Result<()> {
        unreachable_send!(self, peer)
    }

    async fn query(
        &self,
        _request: QueryRequest,
        peer: &MemberId,
        _responses: mpsc::Sender<QueryResponse>,
    ) -> Result<()> {
        unreachable_send!(self, peer)
    }
}

/// In-process network connecting replicas directly.
///
/// Supports disconnecting a member to simulate a partition and
/// reconnecting it to heal.
#[derive(Default)]
pub struct LoopbackNetwork {
    replicas: RwLock<HashMap<MemberId, Arc<Replica>>>,
    disconnected: RwLock<HashSet<MemberId>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a replica as reachable under its member id.
    pub fn register(&self, member: MemberId, replica: Arc<Replica>) {
        self.replicas.write().insert(member, replica);
    }

    /// Cut the member off from all traffic, both directions.
    pub fn disconnect(&self, member: &MemberId) {
        self.disconnected.write().insert(member.clone());
    }

    /// Restore a previously disconnected member.
    pub fn reconnect(&self, member: &MemberId) {
        self.disconnected.write().remove(member);
    }

    /// Client handle for one member of the network.
    pub fn client(self: &Arc<Self>, local: MemberId) -> Arc<LoopbackClient> {
        Arc::new(LoopbackClient {
            network: Arc::clone(self),
            local,
        })
    }

    fn route(&self, from: &MemberId, to: &MemberId) -> Result<Arc<Replica>> {
        let disconnected = self.disconnected.read();
        if disconnected.contains(from) || disconnected.contains(to) {
            return Err(RaftError::PeerUnavailable { member: to.clone() });
        }
        drop(disconnected);
        self.replicas
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| RaftError::PeerUnavailable { member: to.clone() })
    }
}

/// One member's view of a [`LoopbackNetwork`].
pub struct LoopbackClient {
    network: Arc<LoopbackNetwork>,
    local: MemberId,
}

#[async_trait]
impl PeerClient for LoopbackClient {
    async fn vote(&self, request: VoteRequest, peer: &MemberId) -> Result<VoteResponse> {
        let replica = self.network.route(&self.local, peer)?;
        Ok(replica.vote(request).await)
    }

    async fn poll(&self, request: PollRequest, peer: &MemberId) -> Result<PollResponse> {
        let replica = self.network.route(&self.local, peer)?;
        Ok(replica.poll(request).await)
    }

    async fn append(&self, request: AppendRequest, peer: &MemberId) -> Result<AppendResponse> {
        let replica = self.network.route(&self.local, peer)?;
        Ok(replica.append(request).await)
    }

    async fn install(
        &self,
        chunks: mpsc::Receiver<InstallRequest>,
        peer: &MemberId,
    ) -> Result<InstallResponse> {
        let replica = self.network.route(&self.local, peer)?;
        Ok(replica.install(chunks).await)
    }

    async fn transfer(
        &self,
        request: TransferRequest,
        peer: &MemberId,
    ) -> Result<TransferResponse> {
        let replica = self.network.route(&self.local, peer)?;
        Ok(replica.transfer(request).await)
    }

    async fn configure(
        &self,
        request: ConfigureRequest,
        peer: &MemberId,
    ) -> Result<ConfigureResponse> {
        let replica = self.network.route(&self.local, peer)?;
        Ok(replica.configure(request).await)
    }

    async fn reconfigure(
        &self,
        request: ReconfigureRequest,
        peer: &MemberId,
    ) -> Result<ReconfigureResponse> {
        let replica = self.network.route(&self.local, peer)?;
        Ok(replica.reconfigure(request).await)
    }

    async fn join(&self, request: JoinRequest, peer: &MemberId) -> Result<JoinResponse> {
        let replica = self.network.route(&self.local, peer)?;
        Ok(replica.join(request).await)
    }

    async fn leave(&self, request: LeaveRequest, peer: &MemberId) -> Result<LeaveResponse> {
        let replica = self.network.route(&self.local, peer)?;
        Ok(replica.leave(request).await)
    }

    async fn command(
        &self,
        request: CommandRequest,
        peer: &MemberId,
        responses: mpsc::Sender<CommandResponse>,
    ) -> Result<()> {
        let replica = self.network.route(&self.local, peer)?;
        replica.command(request, responses).await;
        Ok(())
    }

    async fn query(
        &self,
        request: QueryRequest,
        peer: &MemberId,
        responses: mpsc::Sender<QueryResponse>,
    ) -> Result<()> {
        let replica = self.network.route(&self.local, peer)?;
        replica.query(request, responses).await;
        Ok(())
    }
}
