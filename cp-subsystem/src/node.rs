//! Raft engine of one group member.
//!
//! This module wraps the tikv/raft library. [`RaftNode`] combines the raw
//! Raft state machine (elections, log matching, ReadIndex) with the group's
//! [`LogStore`] and the replicated [`StateMachine`]. It is purely
//! synchronous: the group worker in [`crate::runtime`] drives it by calling
//! `tick`, `step` and `poll_ready`, and tests drive it directly.

use anyhow::{Context, Result};
use raft::prelude::{Entry, EntryType, Message, RawNode, ReadState};
use raft::storage::MemStorage;
use raft::{INVALID_ID, StateRole};
use slog::{Logger, o};

use crate::command::{CommandPayload, Invocation};
use crate::config::CpConfig;
use crate::group::MemberId;
use crate::log_store::LogStore;
use crate::state_machine::{ApplyOutput, StateMachine};

/// Creates a logger that discards all output.
///
/// The tikv/raft library requires a slog logger; we log at the group worker
/// level with `tracing` instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// A committed entry that went through the state machine.
#[derive(Debug)]
pub struct AppliedEntry {
    pub index: u64,
    pub term: u64,
    pub invocation: Invocation,
    pub output: ApplyOutput,
}

/// Output from processing a Raft ready state.
///
/// Bundles both phases of Raft processing (Ready + LightReady) into a single
/// value:
/// - **messages**: Raft messages to send to other members
/// - **applied**: committed entries applied locally, in log order
/// - **read_states**: ReadIndex requests confirmed by a quorum
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<AppliedEntry>,
    pub read_states: Vec<ReadState>,
}

/// A Raft member of one CP group with its replicated state machine.
pub struct RaftNode {
    id: MemberId,
    raw: RawNode<MemStorage>,
    log: LogStore,
    machine: StateMachine,
    applied_index: u64,
}

impl RaftNode {
    pub fn new(id: MemberId, voters: &[MemberId], config: &CpConfig) -> Result<Self> {
        let cfg = config.raft_config(id);
        let log = LogStore::new(voters);
        let logger = silent_logger();
        let raw = RawNode::new(&cfg, log.storage(), &logger)
            .with_context(|| format!("failed to construct RawNode {id}"))?;
        Ok(Self {
            id,
            raw,
            log,
            machine: StateMachine::new(config.state_machine_options()),
            applied_index: 0,
        })
    }

    pub fn tick(&mut self) {
        self.raw.tick();
    }

    /// Starts an election right away instead of waiting for the timeout.
    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    pub fn is_leader(&self) -> bool {
        self.role() == StateRole::Leader
    }

    pub fn leader_id(&self) -> Option<MemberId> {
        match self.raw.raft.leader_id {
            INVALID_ID => None,
            id => Some(id),
        }
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn commit_index(&self) -> u64 {
        self.raw.raft.raft_log.committed
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn last_index(&self) -> u64 {
        self.raw.raft.raft_log.last_index()
    }

    /// Whether a ReadIndex request issued now would be answered.
    ///
    /// A fresh leader must commit an entry of its own term first.
    pub fn can_serve_reads(&self) -> bool {
        let log = &self.raw.raft.raft_log;
        self.is_leader() && matches!(log.term(log.committed), Ok(term) if term == self.term())
    }

    /// Appends `payload` to the leader's log and returns its `(index, term)`.
    pub fn propose(&mut self, payload: &CommandPayload) -> Result<(u64, u64)> {
        let data = payload.encode().context("encode command failed")?;
        self.raw.propose(vec![], data).context("propose failed")?;
        Ok((self.last_index(), self.term()))
    }

    /// Starts a ReadIndex round tagged with `ctx`.
    pub fn read_index(&mut self, ctx: u64) {
        self.raw.read_index(ctx.to_be_bytes().to_vec());
    }

    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    /// Persists, applies and collects whatever the engine has ready.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut applied = Vec::new();
        let mut outbound = Vec::new();

        if !ready.snapshot().is_empty() {
            self.log.apply_snapshot(ready.snapshot().clone())?;
        }
        self.log.append(ready.entries())?;
        if let Some(hard_state) = ready.hs() {
            self.log.set_hard_state(hard_state.clone());
        }

        let read_states = ready.take_read_states();
        applied.extend(self.apply_entries(ready.take_committed_entries())?);
        outbound.extend(ready.take_messages());
        outbound.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);
        if let Some(commit) = light_ready.commit_index() {
            self.log.set_commit(commit);
        }
        applied.extend(self.apply_entries(light_ready.take_committed_entries())?);
        outbound.extend(light_ready.take_messages());
        self.raw.advance_apply();

        Ok(Some(ReadyBundle {
            messages: outbound,
            applied,
            read_states,
        }))
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<Vec<AppliedEntry>> {
        let mut applied = Vec::new();
        for entry in entries {
            self.applied_index = entry.index;
            // Leader no-ops and conf changes carry nothing for the state machine.
            if entry.data.is_empty() || entry.entry_type() != EntryType::EntryNormal {
                continue;
            }
            let payload = CommandPayload::decode(&entry.data)
                .with_context(|| format!("decode entry {}", entry.index))?;
            let invocation = payload.invocation;
            let output = self.machine.apply(payload);
            applied.push(AppliedEntry {
                index: entry.index,
                term: entry.term,
                invocation,
                output,
            });
        }
        Ok(applied)
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.machine
    }

    pub fn log(&self) -> &LogStore {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap, HashSet};

    use rand::Rng;

    use super::*;
    use crate::command::{AtomicRefOp, LatchOp, OpValue, Operation};

    struct TestCluster {
        nodes: HashMap<u64, RaftNode>,
        isolated: HashSet<u64>,
    }

    impl TestCluster {
        fn new(n: usize) -> Result<Self> {
            let ids: Vec<u64> = (1..=n as u64).collect();
            let config = CpConfig::default();
            let mut nodes = HashMap::new();
            for &id in &ids {
                nodes.insert(id, RaftNode::new(id, &ids, &config)?);
            }
            Ok(Self {
                nodes,
                isolated: HashSet::new(),
            })
        }

        fn node_mut(&mut self, id: u64) -> &mut RaftNode {
            self.nodes.get_mut(&id).expect("node not found")
        }

        fn node(&self, id: u64) -> &RaftNode {
            self.nodes.get(&id).expect("node not found")
        }

        fn tick_all(&mut self) {
            for node in self.nodes.values_mut() {
                node.tick();
            }
        }

        fn reachable(&self, msg: &Message) -> bool {
            !self.isolated.contains(&msg.from) && !self.isolated.contains(&msg.to)
        }

        /// Delivers messages until the cluster goes quiet. Messages that
        /// touch an isolated node are dropped.
        fn deliver_messages(&mut self) -> Result<usize> {
            let mut total_delivered = 0;
            loop {
                let mut messages = Vec::new();
                for node in self.nodes.values_mut() {
                    if let Some(bundle) = node.poll_ready()? {
                        messages.extend(bundle.messages);
                    }
                }
                messages.retain(|msg| self.reachable(msg));
                if messages.is_empty() {
                    break;
                }
                total_delivered += messages.len();
                for msg in messages {
                    if let Some(node) = self.nodes.get_mut(&msg.to) {
                        node.step(msg)?;
                    }
                }
            }
            Ok(total_delivered)
        }

        fn stabilize(&mut self, rounds: usize) -> Result<()> {
            for _ in 0..rounds {
                self.tick_all();
                self.deliver_messages()?;
            }
            Ok(())
        }

        fn leaders(&self) -> Vec<u64> {
            let mut leaders: Vec<u64> = self
                .nodes
                .iter()
                .filter(|(_, n)| n.is_leader())
                .map(|(id, _)| *id)
                .collect();
            leaders.sort_unstable();
            leaders
        }

        fn assert_single_leader(&self) -> u64 {
            let leaders = self.leaders();
            assert_eq!(leaders.len(), 1, "expected exactly one leader, found: {leaders:?}");
            leaders[0]
        }

        fn propose(&mut self, id: u64, operation: Operation) -> Result<(u64, u64)> {
            let payload = CommandPayload {
                invocation: Invocation::sessionless(),
                operation,
                timestamp_ms: 0,
            };
            self.node_mut(id).propose(&payload)
        }

        fn read_ref(&self, id: u64, name: &str) -> Option<Vec<u8>> {
            match self
                .node(id)
                .state_machine()
                .query(&Operation::atomic_ref(name, AtomicRefOp::Get))
            {
                Ok(OpValue::Value(value)) => value,
                other => panic!("unexpected query result {other:?}"),
            }
        }
    }

    fn set(name: &str, value: &str) -> Operation {
        Operation::atomic_ref(
            name,
            AtomicRefOp::Set {
                value: Some(value.as_bytes().to_vec()),
            },
        )
    }

    #[test]
    fn test_basic_three_node_election() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        for id in 1..=3 {
            assert_eq!(cluster.node(id).role(), StateRole::Follower);
            assert_eq!(cluster.node(id).leader_id(), None);
        }

        cluster.node_mut(1).campaign()?;
        cluster.deliver_messages()?;

        assert_eq!(cluster.assert_single_leader(), 1);
        for id in 1..=3 {
            assert_eq!(cluster.node(id).leader_id(), Some(1));
        }
        Ok(())
    }

    #[test]
    fn test_election_without_forced_campaign() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.stabilize(100)?;
        let leader = cluster.assert_single_leader();
        let term = cluster.node(leader).term();
        for id in 1..=3 {
            assert_eq!(cluster.node(id).leader_id(), Some(leader));
            assert_eq!(cluster.node(id).term(), term);
        }
        Ok(())
    }

    #[test]
    fn test_committed_entries_reach_every_replica() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.node_mut(1).campaign()?;
        cluster.deliver_messages()?;

        let (index, term) = cluster.propose(1, set("r", "a"))?;
        cluster.deliver_messages()?;

        assert_eq!(term, cluster.node(1).term());
        for id in 1..=3 {
            assert!(cluster.node(id).commit_index() >= index);
            assert_eq!(cluster.node(id).applied_index(), cluster.node(1).applied_index());
            assert_eq!(cluster.read_ref(id, "r"), Some(b"a".to_vec()));
        }
        assert_eq!(cluster.node(2).state_machine(), cluster.node(3).state_machine());
        Ok(())
    }

    #[test]
    fn test_isolated_leader_steps_down() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.node_mut(1).campaign()?;
        cluster.deliver_messages()?;
        assert_eq!(cluster.assert_single_leader(), 1);

        cluster.isolated.insert(1);
        cluster.stabilize(60)?;

        assert!(!cluster.node(1).is_leader(), "check quorum should demote node 1");
        let leaders = cluster.leaders();
        assert_eq!(leaders.len(), 1);
        assert_ne!(leaders[0], 1);
        Ok(())
    }

    #[test]
    fn test_failover_keeps_committed_and_drops_uncommitted() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.node_mut(1).campaign()?;
        cluster.deliver_messages()?;
        cluster.propose(1, set("r", "committed"))?;
        cluster.deliver_messages()?;

        // The leader is cut off; its next entry never reaches a majority.
        cluster.isolated.insert(1);
        let (phantom_index, _) =
            cluster.propose(1, Operation::latch("phantom", LatchOp::TrySetCount { count: 7 }))?;
        cluster.stabilize(60)?;
        let new_leader = cluster
            .leaders()
            .into_iter()
            .find(|id| *id != 1)
            .expect("majority side elects a leader");
        cluster.propose(new_leader, set("r", "after-failover"))?;
        cluster.deliver_messages()?;

        cluster.isolated.clear();
        cluster.stabilize(20)?;

        let leader = cluster.assert_single_leader();
        assert_ne!(leader, 1);
        for id in 1..=3 {
            let node = cluster.node(id);
            assert!(node.state_machine().latch("phantom").is_none());
            assert_eq!(cluster.read_ref(id, "r"), Some(b"after-failover".to_vec()));
        }
        // Node 1's tail was overwritten by the new leader's entries.
        let old_tail_term = cluster.node(1).log().term(phantom_index)?;
        assert_eq!(old_tail_term, cluster.node(leader).log().term(phantom_index)?);
        assert_eq!(cluster.node(1).state_machine(), cluster.node(leader).state_machine());
        Ok(())
    }

    #[test]
    fn test_at_most_one_leader_per_term_under_random_partitions() -> Result<()> {
        let mut rng = rand::thread_rng();
        let mut cluster = TestCluster::new(5)?;
        let mut leader_by_term: BTreeMap<u64, u64> = BTreeMap::new();

        for step in 0..400 {
            if step % 25 == 0 {
                cluster.isolated.clear();
                for id in 1..=5 {
                    if rng.gen_bool(0.3) {
                        cluster.isolated.insert(id);
                    }
                }
            }
            cluster.tick_all();
            cluster.deliver_messages()?;

            for id in cluster.leaders() {
                let term = cluster.node(id).term();
                let previous = *leader_by_term.entry(term).or_insert(id);
                assert_eq!(previous, id, "two leaders in term {term}");
            }
        }

        cluster.isolated.clear();
        cluster.stabilize(60)?;
        cluster.assert_single_leader();
        Ok(())
    }

    #[test]
    fn test_read_index_requires_leader_commit() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        assert!(!cluster.node(1).can_serve_reads());
        cluster.node_mut(1).campaign()?;
        cluster.deliver_messages()?;
        assert!(cluster.node(1).can_serve_reads());
        assert!(!cluster.node(2).can_serve_reads());

        cluster.node_mut(1).read_index(42);
        let mut confirmed = Vec::new();
        for _ in 0..5 {
            let mut messages = Vec::new();
            for node in cluster.nodes.values_mut() {
                if let Some(bundle) = node.poll_ready()? {
                    confirmed.extend(bundle.read_states);
                    messages.extend(bundle.messages);
                }
            }
            for msg in messages {
                cluster.node_mut(msg.to).step(msg)?;
            }
        }

        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].request_ctx, 42u64.to_be_bytes().to_vec());
        assert!(confirmed[0].index <= cluster.node(1).applied_index());
        Ok(())
    }
}
