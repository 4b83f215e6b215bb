//! Read routing.
//!
//! A linearizable read must observe every operation committed before it
//! started. The leader confirms it still leads with a ReadIndex round and
//! serves the read once its applied index has caught up with the confirmed
//! read index. Local reads skip all of that and read whatever the contacted
//! member has applied.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::command::Operation;
use crate::error::CpError;
use crate::group::MemberId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPolicy {
    #[default]
    Linearizable,
    Local,
}

impl fmt::Display for QueryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linearizable => write!(f, "linearizable"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Checks whether a member may take the query at all.
pub fn admit(
    policy: QueryPolicy,
    operation: &Operation,
    is_leader: bool,
    leader_hint: Option<MemberId>,
) -> Result<(), CpError> {
    if !operation.is_read_only() {
        return Err(CpError::invalid_argument(format!(
            "{} cannot be served as a query",
            operation.kind()
        )));
    }
    if policy == QueryPolicy::Linearizable && !is_leader {
        return Err(CpError::not_leader(leader_hint));
    }
    Ok(())
}

/// Linearizable reads in flight on the leader.
///
/// A read moves through three stages: queued until the leader can start a
/// ReadIndex round, waiting for quorum confirmation, then waiting for apply
/// to reach the confirmed index.
#[derive(Debug)]
pub struct ReadQueue<T> {
    next_ctx: u64,
    queued: Vec<T>,
    unconfirmed: HashMap<u64, T>,
    confirmed: BTreeMap<u64, Vec<T>>,
}

impl<T> Default for ReadQueue<T> {
    fn default() -> Self {
        Self {
            next_ctx: 1,
            queued: Vec::new(),
            unconfirmed: HashMap::new(),
            confirmed: BTreeMap::new(),
        }
    }
}

impl<T> ReadQueue<T> {
    pub fn push(&mut self, read: T) {
        self.queued.push(read);
    }

    /// Assigns a context to every queued read. The caller starts one
    /// ReadIndex round per returned context.
    pub fn issue(&mut self) -> Vec<u64> {
        let mut contexts = Vec::with_capacity(self.queued.len());
        for read in self.queued.drain(..) {
            let ctx = self.next_ctx;
            self.next_ctx += 1;
            self.unconfirmed.insert(ctx, read);
            contexts.push(ctx);
        }
        contexts
    }

    /// Records a quorum-confirmed read index. Unknown contexts are ignored.
    pub fn confirm(&mut self, request_ctx: &[u8], read_index: u64) {
        let Ok(bytes) = <[u8; 8]>::try_from(request_ctx) else {
            return;
        };
        if let Some(read) = self.unconfirmed.remove(&u64::from_be_bytes(bytes)) {
            self.confirmed.entry(read_index).or_default().push(read);
        }
    }

    /// Confirmed reads whose read index has been applied.
    pub fn ready(&mut self, applied_index: u64) -> Vec<T> {
        let pending = self.confirmed.split_off(&applied_index.saturating_add(1));
        let ready = std::mem::replace(&mut self.confirmed, pending);
        ready.into_values().flatten().collect()
    }

    /// Removes every read, e.g. when leadership is lost.
    pub fn drain(&mut self) -> Vec<T> {
        let mut reads: Vec<T> = self.queued.drain(..).collect();
        reads.extend(self.unconfirmed.drain().map(|(_, read)| read));
        reads.extend(std::mem::take(&mut self.confirmed).into_values().flatten());
        reads
    }

    pub fn len(&self) -> usize {
        self.queued.len()
            + self.unconfirmed.len()
            + self.confirmed.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
