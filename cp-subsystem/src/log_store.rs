//! Per-group raft log.
//!
//! Thin wrapper over the engine's `MemStorage`: the engine reads through the
//! [`raft::Storage`] trait, the group worker writes through the methods here
//! while handling a `Ready`. Appending entries that conflict with the stored
//! tail truncates the tail first, so a follower converges on the leader's log.

use anyhow::{Context, Result};
use raft::Storage;
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::storage::{GetEntriesContext, MemStorage};

use crate::group::MemberId;

#[derive(Clone)]
pub struct LogStore {
    storage: MemStorage,
}

impl LogStore {
    pub fn new(voters: &[MemberId]) -> Self {
        Self {
            storage: MemStorage::new_with_conf_state(ConfState::from((voters.to_vec(), vec![]))),
        }
    }

    /// Handle shared with the engine.
    pub fn storage(&self) -> MemStorage {
        self.storage.clone()
    }

    pub fn set_hard_state(&self, hard_state: HardState) {
        self.storage.wl().set_hardstate(hard_state);
    }

    pub fn hard_state(&self) -> Result<HardState> {
        Ok(self
            .storage
            .initial_state()
            .context("read raft state")?
            .hard_state)
    }

    pub fn set_commit(&self, index: u64) {
        self.storage.wl().mut_hard_state().set_commit(index);
    }

    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.storage
            .wl()
            .append(entries)
            .context("append log entries")
    }

    pub fn apply_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        self.storage
            .wl()
            .apply_snapshot(snapshot)
            .context("apply snapshot")
    }

    pub fn first_index(&self) -> Result<u64> {
        self.storage.first_index().context("read first index")
    }

    pub fn last_index(&self) -> Result<u64> {
        self.storage.last_index().context("read last index")
    }

    pub fn term(&self, index: u64) -> Result<u64> {
        self.storage
            .term(index)
            .with_context(|| format!("read term of entry {index}"))
    }

    /// Entries in `[low, high)`.
    pub fn entries(&self, low: u64, high: u64) -> Result<Vec<Entry>> {
        self.storage
            .entries(low, high, u64::MAX, GetEntriesContext::empty(false))
            .with_context(|| format!("read entries [{low}, {high})"))
    }
}
