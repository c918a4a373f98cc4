//! Storage boundaries: durable metadata and the replicated log.
//!
//! The consensus core talks to persistence through these traits only.
//! Implementations provide their own concurrency: appends are serialized,
//! reads may run concurrently. The in-memory implementations back the test
//! harness and single-process deployments.

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{RaftError, Result};
use crate::types::{Index, LogEntry, MemberId, Term};

/// Durable persistence for the term and vote, restored on restart.
pub trait MetadataStore: Send + Sync {
    /// Load the persisted `(term, voted_for)` pair.
    fn load(&self) -> Result<(Term, Option<MemberId>)>;

    /// Atomically persist the term and vote.
    ///
    /// Called before the in-memory state is updated; a failure leaves the
    /// in-memory state untouched.
    fn store(&self, term: Term, voted_for: Option<&MemberId>) -> Result<()>;
}

/// Append-only replicated log.
pub trait LogStore: Send + Sync {
    /// Append an entry. The entry's index must directly follow the last
    /// entry (or the snapshot boundary for an empty log).
    fn append(&self, entry: LogEntry) -> Result<Index>;

    /// Delete all entries at `from` and beyond.
    fn truncate(&self, from: Index) -> Result<()>;

    /// Index and term of the last entry, including the snapshot boundary
    /// when the log has been compacted away.
    fn last_entry(&self) -> Option<(Index, Term)>;

    /// First index still present in the log.
    fn first_index(&self) -> Index;

    /// Read a single entry.
    fn entry(&self, index: Index) -> Result<Option<LogEntry>>;

    /// Read entries in `[from, to)`, in index order.
    fn entries(&self, from: Index, to: Index) -> Result<Vec<LogEntry>>;

    /// Replace the log prefix with a snapshot boundary: everything up to
    /// and including `last_index` is discarded and the next append
    /// continues at `last_index + 1`.
    fn reset(&self, last_index: Index, last_term: Term) -> Result<()>;
}

/// The record the metadata store round-trips through its durable medium.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataRecord {
    term: Term,
    voted_for: Option<MemberId>,
}

/// In-memory metadata store.
///
/// Encodes the record the same way a file-backed store would, so restart
/// tests exercise the full round-trip.
#[derive(Default)]
pub struct MemoryMetadataStore {
    record: RwLock<Option<Bytes>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn load(&self) -> Result<(Term, Option<MemberId>)> {
        match self.record.read().as_ref() {
            None => Ok((Term::ZERO, None)),
            Some(raw) => {
                let record: MetadataRecord =
                    bincode::deserialize(raw).map_err(|e| RaftError::Metadata {
                        reason: e.to_string(),
                    })?;
                Ok((record.term, record.voted_for))
            }
        }
    }

    fn store(&self, term: Term, voted_for: Option<&MemberId>) -> Result<()> {
        let record = MetadataRecord {
            term,
            voted_for: voted_for.cloned(),
        };
        let raw = bincode::serialize(&record).map_err(|e| RaftError::Metadata {
            reason: e.to_string(),
        })?;
        *self.record.write() = Some(Bytes::from(raw));
        Ok(())
    }
}

/// In-memory log store backed by an ordered map.
#[derive(Default)]
pub struct MemoryLogStore {
    inner: RwLock<LogInner>,
}

#[derive(Default)]
struct LogInner {
    entries: BTreeMap<Index, LogEntry>,
    /// Snapshot boundary: last compacted `(index, term)`.
    base: Option<(Index, Term)>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryLogStore {
    fn append(&self, entry: LogEntry) -> Result<Index> {
        let mut inner = self.inner.write();
        let last = inner
            .entries
            .keys()
            .next_back()
            .copied()
            .or(inner.base.map(|(i, _)| i))
            .unwrap_or(Index::ZERO);
        if entry.index != last.next() {
            return Err(RaftError::OutOfSequence {
                index: entry.index,
                last,
            });
        }
        let index = entry.index;
        inner.entries.insert(index, entry);
        Ok(index)
    }

    fn truncate(&self, from: Index) -> Result<()> {
        let mut inner = self.inner.write();
        inner.entries.split_off(&from);
        Ok(())
    }

    fn last_entry(&self) -> Option<(Index, Term)> {
        let inner = self.inner.read();
        inner
            .entries
            .iter()
            .next_back()
            .map(|(i, e)| (*i, e.term))
            .or(inner.base)
    }

    fn first_index(&self) -> Index {
        let inner = self.inner.read();
        inner
            .entries
            .keys()
            .next()
            .copied()
            .or(inner.base.map(|(i, _)| i.next()))
            .unwrap_or(Index(1))
    }

    fn entry(&self, index: Index) -> Result<Option<LogEntry>> {
        Ok(self.inner.read().entries.get(&index).cloned())
    }

    fn entries(&self, from: Index, to: Index) -> Result<Vec<LogEntry>> {
        let inner = self.inner.read();
        Ok(inner.entries.range(from..to).map(|(_, e)| e.clone()).collect())
    }

    fn reset(&self, last_index: Index, last_term: Term) -> Result<()> {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.base = Some((last_index, last_term));
        Ok(())
    }
}
