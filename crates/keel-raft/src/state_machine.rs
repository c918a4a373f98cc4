//! Boundary to the state machine manager.
//!
//! The manager that owns user-visible state lives outside the core; the
//! core drives it with committed entries and local queries through this
//! trait.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::types::LogEntry;

/// Applies committed entries and serves queries over applied state.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Apply a committed entry, returning the output for the client that
    /// proposed it.
    async fn apply(&mut self, entry: &LogEntry) -> Result<Bytes>;

    /// Answer a query against the currently applied state.
    async fn query(&self, payload: &Bytes) -> Result<Bytes>;

    /// Replace the applied state with a received snapshot.
    async fn restore(&mut self, data: Bytes) -> Result<()>;
}

/// State machine that discards everything; used when the core runs
/// without a manager attached.
#[derive(Debug, Default)]
pub struct NoopStateMachine;

#[async_trait]
impl StateMachine for NoopStateMachine {
    async fn apply(&mut self, _entry: &LogEntry) -> Result<Bytes> {
        Ok(Bytes::new())
    }

    async fn query(&self, _payload: &Bytes) -> Result<Bytes> {
        Ok(Bytes::new())
    }

    async fn restore(&mut self, _data: Bytes) -> Result<()> {
        Ok(())
    }
}
