//! keel-raft: the Raft consensus core of a keel storage replica.
//!
//! The crate holds the shared protocol state of one cluster member and
//! the per-role state machines that drive leader election, log
//! replication, and commit advancement:
//!
//! - [`Replica`] owns the safety-critical state (monotonic term,
//!   at-most-one vote per term, immutable leader per term, monotonic
//!   commit index) behind an internal reader/writer lock, and dispatches
//!   inbound RPCs to the current role.
//! - [`roles`] implements the follower, candidate, and leader behaviors
//!   on top of shared passive (replication target) and active (voter)
//!   logic.
//!
//! Durable persistence, the state machine manager, and the wire transport
//! are collaborators behind the [`MetadataStore`], [`LogStore`],
//! [`StateMachine`], and [`PeerClient`] boundaries.

pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod event;
pub mod replica;
pub mod roles;
pub mod state_machine;
pub mod store;
pub mod types;

pub use client::{LoopbackClient, LoopbackNetwork, PeerClient, UnreachablePeerClient};
pub use cluster::{Cluster, Member};
pub use config::ProtocolConfig;
pub use error::{RaftError, Result};
pub use event::Event;
pub use replica::Replica;
pub use roles::{Role, RoleFactories};
pub use state_machine::{NoopStateMachine, StateMachine};
pub use store::{LogStore, MemoryLogStore, MemoryMetadataStore, MetadataStore};
pub use types::*;
