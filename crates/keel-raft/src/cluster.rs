//! Static cluster membership.

use std::collections::BTreeMap;

use crate::error::{RaftError, Result};
use crate::types::MemberId;

/// Address descriptor of a single cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: MemberId,
    pub host: String,
    pub port: u16,
}

impl Member {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: MemberId::new(id),
            host: host.into(),
            port,
        }
    }
}

/// The voting membership of the cluster, including the local member.
///
/// Membership composition is stable for the lifetime of the replica;
/// reconfiguration happens out of band.
#[derive(Debug, Clone)]
pub struct Cluster {
    member: MemberId,
    members: BTreeMap<MemberId, Member>,
}

impl Cluster {
    pub fn new(member: MemberId, members: Vec<Member>) -> Result<Self> {
        let members: BTreeMap<_, _> = members.into_iter().map(|m| (m.id.clone(), m)).collect();
        if !members.contains_key(&member) {
            return Err(RaftError::UnknownMember { member });
        }
        Ok(Self { member, members })
    }

    /// This replica's id.
    pub fn member(&self) -> &MemberId {
        &self.member
    }

    /// All voting member ids, in stable order.
    pub fn members(&self) -> Vec<MemberId> {
        self.members.keys().cloned().collect()
    }

    /// Ids of every member except the local one.
    pub fn peers(&self) -> Vec<MemberId> {
        self.members
            .keys()
            .filter(|id| **id != self.member)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &MemberId) -> Option<&Member> {
        self.members.get(id)
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.members.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Majority size over the voting membership: `⌊N/2⌋ + 1`.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_members() -> Vec<Member> {
        vec![
            Member::new("foo", "foo", 5678),
            Member::new("bar", "bar", 5679),
            Member::new("baz", "baz", 5680),
        ]
    }

    #[test]
    fn quorum_sizes() {
        let cluster = Cluster::new(MemberId::new("foo"), three_members()).unwrap();
        assert_eq!(cluster.quorum(), 2);

        let single = Cluster::new(
            MemberId::new("foo"),
            vec![Member::new("foo", "foo", 5678)],
        )
        .unwrap();
        assert_eq!(single.quorum(), 1);
    }

    #[test]
    fn local_member_must_be_configured() {
        let err = Cluster::new(MemberId::new("qux"), three_members());
        assert!(err.is_err());
    }

    #[test]
    fn peers_excludes_local() {
        let cluster = Cluster::new(MemberId::new("foo"), three_members()).unwrap();
        let peers = cluster.peers();
        assert_eq!(peers.len(), 2);
        assert!(!peers.contains(&MemberId::new("foo")));
    }
}
