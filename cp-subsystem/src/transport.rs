//! Message transport between group members.
//!
//! The core only needs a way to hand a raft [`Message`] to another member of
//! the same group and an inbox per `(group, member)`. [`LocalNetwork`] wires
//! members of one process together and can cut links to simulate partitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use raft::prelude::Message;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::group::{ConsensusGroupId, MemberId};

pub type Inbox = UnboundedReceiver<Message>;

/// Delivery contract used by group workers.
///
/// Delivery is best effort; raft retransmits whatever gets lost.
pub trait Transport: Send + Sync + 'static {
    /// Opens the inbox of `member` for `group`, replacing any previous one.
    fn attach(&self, group: &ConsensusGroupId, member: MemberId) -> Inbox;

    fn detach(&self, group: &ConsensusGroupId, member: MemberId);

    fn send(&self, group: &ConsensusGroupId, message: Message);
}

#[derive(Default)]
struct NetworkState {
    inboxes: HashMap<(ConsensusGroupId, MemberId), UnboundedSender<Message>>,
    cut_links: HashSet<(MemberId, MemberId)>,
    isolated: HashSet<MemberId>,
}

impl NetworkState {
    fn reachable(&self, from: MemberId, to: MemberId) -> bool {
        from == to
            || !(self.isolated.contains(&from)
                || self.isolated.contains(&to)
                || self.cut_links.contains(&(from, to)))
    }
}

/// In-process network shared by all members of a test or demo cluster.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, NetworkState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, NetworkState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops all traffic between the two sides, in both directions.
    pub fn partition(&self, left: &[MemberId], right: &[MemberId]) {
        let mut state = self.write();
        for &a in left {
            for &b in right {
                state.cut_links.insert((a, b));
                state.cut_links.insert((b, a));
            }
        }
    }

    /// Drops all traffic to and from `member`.
    pub fn isolate(&self, member: MemberId) {
        self.write().isolated.insert(member);
    }

    pub fn heal(&self) {
        let mut state = self.write();
        state.cut_links.clear();
        state.isolated.clear();
    }

    pub fn is_reachable(&self, from: MemberId, to: MemberId) -> bool {
        self.read().reachable(from, to)
    }
}

impl Transport for LocalNetwork {
    fn attach(&self, group: &ConsensusGroupId, member: MemberId) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.write().inboxes.insert((group.clone(), member), tx);
        rx
    }

    fn detach(&self, group: &ConsensusGroupId, member: MemberId) {
        self.write().inboxes.remove(&(group.clone(), member));
    }

    fn send(&self, group: &ConsensusGroupId, message: Message) {
        let state = self.read();
        if !state.reachable(message.from, message.to) {
            trace!(%group, from = message.from, to = message.to, "link down, dropping message");
            return;
        }
        match state.inboxes.get(&(group.clone(), message.to)) {
            Some(inbox) => {
                let to = message.to;
                if inbox.send(message).is_err() {
                    trace!(%group, to, "inbox closed, dropping message");
                }
            }
            None => trace!(%group, to = message.to, "no inbox, dropping message"),
        }
    }
}
