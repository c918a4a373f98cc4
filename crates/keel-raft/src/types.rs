//! Core protocol types: terms, indexes, log entries, and the RPC surface.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol term (monotonically non-decreasing logical clock).
///
/// Each term has at most one leader. A replica starting an election
/// increments its term by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log index (1-indexed; 0 is the sentinel for "before the log").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Index(pub u64);

impl Index {
    pub const ZERO: Index = Index(0);

    pub fn next(self) -> Index {
        Index(self.0 + 1)
    }

    pub fn prev(self) -> Option<Index> {
        if self.0 > 0 {
            Some(Index(self.0 - 1))
        } else {
            None
        }
    }

    pub fn plus(self, n: u64) -> Index {
        Index(self.0 + n)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a cluster member.
///
/// A string to support DNS names, UUIDs, or host:port combinations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        MemberId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a log entry carries.
///
/// Leaders append a `Noop` at the start of their term to commit any
/// entries left over from prior terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    Noop,
    Command(Bytes),
}

impl EntryPayload {
    /// Payload size in bytes, used for append batching.
    pub fn size(&self) -> usize {
        match self {
            EntryPayload::Noop => 0,
            EntryPayload::Command(data) => data.len(),
        }
    }
}

/// A replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: Index,
    pub term: Term,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn new(index: Index, term: Term, payload: EntryPayload) -> Self {
        Self {
            index,
            term,
            payload,
        }
    }
}

/// Lifecycle status of a replica.
///
/// A replica is `Running` once initialized and `Ready` once its commit
/// index has caught up to the first commit index observed after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stopped,
    Running,
    Ready,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Stopped => write!(f, "stopped"),
            Status::Running => write!(f, "running"),
            Status::Ready => write!(f, "ready"),
        }
    }
}

/// The replica's current behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleType {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for RoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleType::Follower => write!(f, "follower"),
            RoleType::Candidate => write!(f, "candidate"),
            RoleType::Leader => write!(f, "leader"),
        }
    }
}

/// Whether an RPC was serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Client-visible error states carried in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseError {
    /// The replica knows no leader to serve or forward the request.
    NoLeader,
    /// The current role does not serve this RPC.
    IllegalMemberState,
    /// The request was malformed or not valid in the current state.
    ProtocolError,
    /// The state machine rejected the command or query.
    ApplicationError,
}

/// Consistency level requested for a query.
///
/// `Sequential` may be served by a follower from locally applied state;
/// the linearizable levels are routed through the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConsistency {
    Sequential,
    LinearizableLease,
    Linearizable,
}

/// Request to join the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub member: MemberId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub status: ResponseStatus,
    pub error: Option<ResponseError>,
    pub term: Term,
    pub index: Index,
    pub members: Vec<MemberId>,
}

impl JoinResponse {
    pub fn illegal_member_state() -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(ResponseError::IllegalMemberState),
            term: Term::ZERO,
            index: Index::ZERO,
            members: Vec::new(),
        }
    }
}

/// Request to leave the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub member: MemberId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveResponse {
    pub status: ResponseStatus,
    pub error: Option<ResponseError>,
    pub term: Term,
    pub index: Index,
    pub members: Vec<MemberId>,
}

impl LeaveResponse {
    pub fn illegal_member_state() -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(ResponseError::IllegalMemberState),
            term: Term::ZERO,
            index: Index::ZERO,
            members: Vec::new(),
        }
    }
}

/// Leader-originated configuration push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureRequest {
    pub term: Term,
    pub leader: MemberId,
    pub index: Index,
    pub members: Vec<MemberId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureResponse {
    pub status: ResponseStatus,
    pub error: Option<ResponseError>,
    pub term: Term,
}

impl ConfigureResponse {
    pub fn ok(term: Term) -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
            term,
        }
    }

    pub fn rejected(error: ResponseError, term: Term) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(error),
            term,
        }
    }

    pub fn illegal_member_state() -> Self {
        Self::rejected(ResponseError::IllegalMemberState, Term::ZERO)
    }
}

/// Request to change the voting membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconfigureRequest {
    pub member: MemberId,
    pub index: Index,
    pub term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconfigureResponse {
    pub status: ResponseStatus,
    pub error: Option<ResponseError>,
    pub term: Term,
    pub index: Index,
    pub members: Vec<MemberId>,
}

impl ReconfigureResponse {
    pub fn illegal_member_state() -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(ResponseError::IllegalMemberState),
            term: Term::ZERO,
            index: Index::ZERO,
            members: Vec::new(),
        }
    }
}

/// Non-binding pre-vote sent before disrupting the cluster with an election.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRequest {
    pub term: Term,
    pub candidate: MemberId,
    pub last_log_index: Index,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    pub status: ResponseStatus,
    pub error: Option<ResponseError>,
    pub term: Term,
    pub accepted: bool,
}

impl PollResponse {
    pub fn ok(term: Term, accepted: bool) -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
            term,
            accepted,
        }
    }

    pub fn illegal_member_state() -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(ResponseError::IllegalMemberState),
            term: Term::ZERO,
            accepted: false,
        }
    }
}

/// Binding vote request sent by a candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: MemberId,
    pub last_log_index: Index,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub status: ResponseStatus,
    pub error: Option<ResponseError>,
    pub term: Term,
    pub voted: bool,
}

impl VoteResponse {
    pub fn ok(term: Term, voted: bool) -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
            term,
            voted,
        }
    }

    pub fn illegal_member_state() -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(ResponseError::IllegalMemberState),
            term: Term::ZERO,
            voted: false,
        }
    }
}

/// Request for orderly leadership transfer to another member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub member: MemberId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResponse {
    pub status: ResponseStatus,
    pub error: Option<ResponseError>,
    pub term: Term,
}

impl TransferResponse {
    pub fn ok(term: Term) -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
            term,
        }
    }

    pub fn rejected(error: ResponseError, term: Term) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(error),
            term,
        }
    }

    pub fn illegal_member_state() -> Self {
        Self::rejected(ResponseError::IllegalMemberState, Term::ZERO)
    }
}

/// Log replication request from the leader.
///
/// An empty `entries` list is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: Term,
    pub leader: MemberId,
    pub prev_log_index: Index,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub commit_index: Index,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub status: ResponseStatus,
    pub error: Option<ResponseError>,
    pub term: Term,
    pub succeeded: bool,
    /// The responder's last log index; on rejection this is the hint the
    /// leader uses to back its next index off.
    pub last_log_index: Index,
}

impl AppendResponse {
    pub fn ok(term: Term, succeeded: bool, last_log_index: Index) -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
            term,
            succeeded,
            last_log_index,
        }
    }

    pub fn illegal_member_state() -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(ResponseError::IllegalMemberState),
            term: Term::ZERO,
            succeeded: false,
            last_log_index: Index::ZERO,
        }
    }
}

/// One chunk of a streamed snapshot install.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRequest {
    pub term: Term,
    pub leader: MemberId,
    /// Index of the last entry covered by the snapshot.
    pub last_index: Index,
    /// Term of the entry at `last_index`.
    pub last_term: Term,
    pub offset: u64,
    pub data: Bytes,
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallResponse {
    pub status: ResponseStatus,
    pub error: Option<ResponseError>,
    pub term: Term,
}

impl InstallResponse {
    pub fn ok(term: Term) -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
            term,
        }
    }

    pub fn rejected(error: ResponseError, term: Term) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(error),
            term,
        }
    }

    pub fn illegal_member_state() -> Self {
        Self::rejected(ResponseError::IllegalMemberState, Term::ZERO)
    }
}

/// Client command to be replicated through the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub payload: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: ResponseStatus,
    pub error: Option<ResponseError>,
    pub term: Term,
    /// Hint for redirecting the client when this replica is not the leader.
    pub leader: Option<MemberId>,
    /// Log index the command was committed at.
    pub index: Index,
    pub payload: Bytes,
}

impl CommandResponse {
    pub fn ok(term: Term, index: Index, payload: Bytes) -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
            term,
            leader: None,
            index,
            payload,
        }
    }

    pub fn rejected(error: ResponseError, term: Term, leader: Option<MemberId>) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(error),
            term,
            leader,
            index: Index::ZERO,
            payload: Bytes::new(),
        }
    }

    pub fn illegal_member_state() -> Self {
        Self::rejected(ResponseError::IllegalMemberState, Term::ZERO, None)
    }
}

/// Client query against applied state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub payload: Bytes,
    pub consistency: ReadConsistency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: ResponseStatus,
    pub error: Option<ResponseError>,
    pub payload: Bytes,
}

impl QueryResponse {
    pub fn ok(payload: Bytes) -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
            payload,
        }
    }

    pub fn rejected(error: ResponseError) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(error),
            payload: Bytes::new(),
        }
    }

    pub fn illegal_member_state() -> Self {
        Self::rejected(ResponseError::IllegalMemberState)
    }
}
