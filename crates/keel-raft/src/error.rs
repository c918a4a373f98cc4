//! Error types for the consensus core.

use thiserror::Error;

use crate::types::{Index, MemberId, RoleType, Term};

/// Errors surfaced by the protocol state holder and the roles.
#[derive(Error, Debug)]
pub enum RaftError {
    /// Attempt to move the term backwards.
    #[error("cannot decrease term from {current} to {requested}")]
    TermRegression { current: Term, requested: Term },

    /// A different vote was already cast in this term.
    #[error("already voted for {voted_for} in term {term}")]
    AlreadyVoted { term: Term, voted_for: MemberId },

    /// The vote target is empty or otherwise unusable.
    #[error("invalid vote for {member:?}")]
    InvalidVote { member: MemberId },

    /// A different leader was already recorded for this term.
    #[error("leader {leader} already known for term {term}")]
    LeaderConflict { term: Term, leader: MemberId },

    /// The named member is not part of the cluster.
    #[error("unknown cluster member {member}")]
    UnknownMember { member: MemberId },

    /// Metadata store failure; fatal to the current role round.
    #[error("metadata store: {reason}")]
    Metadata { reason: String },

    /// Log store failure; fatal to the current role round.
    #[error("log store: {reason}")]
    Log { reason: String },

    /// A log append did not continue the sequence.
    #[error("log entry at {index} does not follow the last entry at {last}")]
    OutOfSequence { index: Index, last: Index },

    /// No leader is known to serve or forward the request.
    #[error("no known leader")]
    NoLeader,

    /// The current role does not serve this RPC.
    #[error("{role} does not serve this request")]
    IllegalMemberState { role: RoleType },

    /// The peer could not be reached.
    #[error("peer {member} unreachable")]
    PeerUnavailable { member: MemberId },

    /// Malformed or out-of-state request.
    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// The state machine rejected a command or query.
    #[error("application error: {reason}")]
    Application { reason: String },

    /// Invalid configuration.
    #[error("configuration: {reason}")]
    Config { reason: String },

    /// The replica is stopped.
    #[error("replica is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, RaftError>;
