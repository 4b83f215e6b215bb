//! Group identity and membership.

use std::fmt;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

/// Raft member identifier; also the transport address key.
pub type MemberId = u64;

/// Name of the group used when callers do not pick one.
pub const DEFAULT_GROUP_NAME: &str = "default";

/// Identifies one independent Raft group.
///
/// `seed` is the creation sequence of the name: destroying and re-creating a
/// group with the same name yields a different id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsensusGroupId {
    name: String,
    seed: u64,
}

impl ConsensusGroupId {
    pub fn new(name: impl Into<String>, seed: u64) -> Self {
        Self {
            name: name.into(),
            seed,
        }
    }

    pub fn default_group() -> Self {
        Self::new(DEFAULT_GROUP_NAME, 0)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl fmt::Display for ConsensusGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.seed)
    }
}

/// Member set of a group. Majorities are only well defined for an odd count.
#[derive(Debug, Clone)]
pub struct GroupTopology {
    members: Vec<MemberId>,
}

impl GroupTopology {
    pub fn new(mut members: Vec<MemberId>) -> Result<Self> {
        ensure!(!members.is_empty(), "group requires at least one member");
        members.sort_unstable();
        let before = members.len();
        members.dedup();
        ensure!(members.len() == before, "group members must be unique");
        ensure!(
            members.len() % 2 == 1,
            "group must have an odd number of members"
        );
        Ok(Self { members })
    }

    pub fn ids(&self) -> &[MemberId] {
        &self.members
    }

    pub fn contains(&self, member: MemberId) -> bool {
        self.members.binary_search(&member).is_ok()
    }

    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_rejects_even_and_duplicate_members() {
        assert!(GroupTopology::new(vec![]).is_err());
        assert!(GroupTopology::new(vec![1, 2]).is_err());
        assert!(GroupTopology::new(vec![1, 1, 2]).is_err());

        let topology = GroupTopology::new(vec![3, 1, 2]).unwrap();
        assert_eq!(topology.ids(), &[1, 2, 3]);
        assert_eq!(topology.majority(), 2);
        assert!(topology.contains(2));
        assert!(!topology.contains(4));
    }

    #[test]
    fn group_id_display_includes_seed() {
        let id = ConsensusGroupId::new("locks", 4);
        assert_eq!(id.to_string(), "locks#4");
        assert_ne!(id, ConsensusGroupId::new("locks", 5));
        assert_eq!(ConsensusGroupId::default_group().name(), DEFAULT_GROUP_NAME);
    }
}
