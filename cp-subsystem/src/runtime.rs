//! Group worker and its handle.
//!
//! Each member runs one tokio task per CP group. The task owns the group's
//! [`RaftNode`] (engine, log store and state machine), so every log mutation
//! and every apply for a group happens on that task. Callers talk to it
//! through a [`GroupHandle`]:
//!
//! - **requests** arrive on an unbounded mpsc channel and are answered over a
//!   `oneshot`
//! - **raft messages** from peers arrive on the group's transport inbox
//! - **ticks** drive elections and heartbeats
//! - **expiry checks** make the leader propose `ExpireSessions` and
//!   `ExpireWaitKeys` entries; replicas never consult a clock while applying
//!
//! A submitted operation is proposed, tracked by its `(index, term)` and
//! answered when its entry is applied. Blocking operations that park in a
//! replica get a second `oneshot` that a later apply resolves.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use raft::StateRole;
use raft::prelude::Message;
use serde::Serialize;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

use crate::command::{CommandPayload, Invocation, InvocationUid, Operation};
use crate::config::CpConfig;
use crate::datastructures::Applied;
use crate::error::{CommitOutcome, CpError};
use crate::group::{ConsensusGroupId, GroupTopology, MemberId};
use crate::node::{AppliedEntry, RaftNode};
use crate::query::{self, QueryPolicy, ReadQueue};
use crate::transport::{Inbox, Transport};

/// Snapshot of a member's view of its group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub group: ConsensusGroupId,
    pub member: MemberId,
    #[serde(serialize_with = "serialize_role")]
    pub role: StateRole,
    pub leader: Option<MemberId>,
    pub term: u64,
    pub commit_index: u64,
    pub applied_index: u64,
    pub last_index: u64,
    pub sessions: usize,
}

fn serialize_role<S: serde::Serializer>(
    role: &StateRole,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{role:?}"))
}

enum Reply {
    Outcome(CommitOutcome),
    /// Committed, but the caller waits in a replica queue.
    Parked(oneshot::Receiver<CommitOutcome>),
}

enum Request {
    Submit {
        invocation: Invocation,
        operation: Operation,
        respond_to: oneshot::Sender<Reply>,
    },
    Query {
        operation: Operation,
        policy: QueryPolicy,
        respond_to: oneshot::Sender<CommitOutcome>,
    },
    Status {
        respond_to: oneshot::Sender<GroupStatus>,
    },
    Campaign {
        respond_to: oneshot::Sender<Result<()>>,
    },
    EndpointDisconnected {
        endpoint: String,
    },
    Shutdown,
}

/// Cloneable client side of a group worker.
#[derive(Clone)]
pub struct GroupHandle {
    group: ConsensusGroupId,
    member: MemberId,
    request_tx: mpsc::UnboundedSender<Request>,
    submit_timeout: Duration,
}

impl GroupHandle {
    pub fn group(&self) -> &ConsensusGroupId {
        &self.group
    }

    pub fn member(&self) -> MemberId {
        self.member
    }

    /// Replicates `operation` and returns once it is applied.
    ///
    /// The timeout covers the way to commit. A committed operation parked in
    /// a replica (acquire, await) waits until the replica answers it.
    pub async fn submit(&self, invocation: Invocation, operation: Operation) -> CommitOutcome {
        let retryable = invocation.is_retry_safe() || operation.is_read_only();
        let (respond_to, response) = oneshot::channel();
        let request = Request::Submit {
            invocation,
            operation,
            respond_to,
        };
        if self.request_tx.send(request).is_err() {
            return CommitOutcome::Failed(CpError::GroupShutdown);
        }
        match timeout(self.submit_timeout, response).await {
            Ok(Ok(Reply::Outcome(outcome))) => outcome,
            Ok(Ok(Reply::Parked(waiter))) => waiter
                .await
                .unwrap_or(CommitOutcome::Indeterminate { retryable }),
            Ok(Err(_)) | Err(_) => CommitOutcome::Indeterminate { retryable },
        }
    }

    pub async fn query(&self, operation: Operation, policy: QueryPolicy) -> CommitOutcome {
        let (respond_to, response) = oneshot::channel();
        let request = Request::Query {
            operation,
            policy,
            respond_to,
        };
        if self.request_tx.send(request).is_err() {
            return CommitOutcome::Failed(CpError::GroupShutdown);
        }
        match timeout(self.submit_timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) | Err(_) => CommitOutcome::Indeterminate { retryable: true },
        }
    }

    pub async fn status(&self) -> Result<GroupStatus> {
        let (respond_to, response) = oneshot::channel();
        self.request_tx
            .send(Request::Status { respond_to })
            .context("failed to send status request")?;
        response.await.context("status response channel closed")
    }

    /// Makes this member start an election.
    pub async fn campaign(&self) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.request_tx
            .send(Request::Campaign { respond_to })
            .context("failed to send campaign request")?;
        response.await.context("campaign response channel closed")?
    }

    pub fn endpoint_disconnected(&self, endpoint: impl Into<String>) -> Result<()> {
        self.request_tx
            .send(Request::EndpointDisconnected {
                endpoint: endpoint.into(),
            })
            .context("failed to send endpoint notification")
    }

    pub fn shutdown(&self) -> Result<()> {
        self.request_tx
            .send(Request::Shutdown)
            .context("failed to send shutdown")
    }
}

/// Starts the worker of `member` for `group`.
pub fn spawn_group(
    group: ConsensusGroupId,
    member: MemberId,
    topology: &GroupTopology,
    config: &CpConfig,
    transport: Arc<dyn Transport>,
) -> Result<(GroupHandle, JoinHandle<()>)> {
    anyhow::ensure!(
        topology.contains(member),
        "member {member} is not part of group {group}"
    );
    let mut node = RaftNode::new(member, topology.ids(), config)
        .with_context(|| format!("failed to start raft node for {group}"))?;
    if topology.ids().len() == 1 {
        node.campaign()?;
    }

    let inbox = transport.attach(&group, member);
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let handle = GroupHandle {
        group: group.clone(),
        member,
        request_tx,
        submit_timeout: config.submit_timeout(),
    };

    let worker = Worker::new(group, node, config, transport, request_rx, inbox);
    let task = tokio::spawn(async move {
        let group = worker.group.clone();
        if let Err(err) = worker.run().await {
            error!(%group, member, error = ?err, "group worker crashed");
        }
    });
    Ok((handle, task))
}

struct PendingProposal {
    term: u64,
    retryable: bool,
    respond_to: oneshot::Sender<Reply>,
}

struct PendingRead {
    operation: Operation,
    respond_to: oneshot::Sender<CommitOutcome>,
}

struct Worker {
    group: ConsensusGroupId,
    node: RaftNode,
    transport: Arc<dyn Transport>,
    request_rx: mpsc::UnboundedReceiver<Request>,
    inbox: Inbox,
    tick_interval: Duration,
    expiry_interval: Duration,
    proposals: BTreeMap<u64, PendingProposal>,
    parked: HashMap<InvocationUid, oneshot::Sender<CommitOutcome>>,
    reads: ReadQueue<PendingRead>,
    last_role: StateRole,
    last_term: u64,
    /// Wall clock at which this member last became leader.
    leader_since_ms: u64,
}

impl Worker {
    fn new(
        group: ConsensusGroupId,
        node: RaftNode,
        config: &CpConfig,
        transport: Arc<dyn Transport>,
        request_rx: mpsc::UnboundedReceiver<Request>,
        inbox: Inbox,
    ) -> Self {
        let last_role = node.role();
        let last_term = node.term();
        Self {
            group,
            node,
            transport,
            request_rx,
            inbox,
            tick_interval: config.tick_interval(),
            expiry_interval: config.expiry_check_interval(),
            proposals: BTreeMap::new(),
            parked: HashMap::new(),
            reads: ReadQueue::default(),
            last_role,
            last_term,
            leader_since_ms: now_ms(),
        }
    }

    async fn run(mut self) -> Result<()> {
        info!(group = %self.group, member = self.node.id(), "group worker started");
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut expiry = interval(self.expiry_interval);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                request = self.request_rx.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => self.handle_request(request),
                },
                Some(msg) = self.inbox.recv() => {
                    if let Err(err) = self.node.step(msg) {
                        debug!(
                            group = %self.group,
                            member = self.node.id(),
                            error = %err,
                            "dropped raft message"
                        );
                    }
                }
                _ = ticker.tick() => self.node.tick(),
                _ = expiry.tick() => self.propose_expiries(),
            }

            self.issue_reads();
            self.process_ready()?;
        }

        self.transport.detach(&self.group, self.node.id());
        info!(group = %self.group, member = self.node.id(), "group worker stopped");
        Ok(())
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Submit {
                invocation,
                operation,
                respond_to,
            } => self.submit(invocation, operation, respond_to),
            Request::Query {
                operation,
                policy,
                respond_to,
            } => self.query(operation, policy, respond_to),
            Request::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            Request::Campaign { respond_to } => {
                info!(
                    group = %self.group,
                    member = self.node.id(),
                    role = ?self.node.role(),
                    "campaign requested"
                );
                let _ = respond_to.send(self.node.campaign());
            }
            Request::EndpointDisconnected { endpoint } => self.expire_endpoint(&endpoint),
            Request::Shutdown => {}
        }
    }

    fn submit(
        &mut self,
        invocation: Invocation,
        operation: Operation,
        respond_to: oneshot::Sender<Reply>,
    ) {
        if matches!(
            operation,
            Operation::ExpireSessions { .. } | Operation::ExpireWaitKeys { .. }
        ) {
            let err = CpError::invalid_argument(format!(
                "{} is reserved for the leader",
                operation.kind()
            ));
            let _ = respond_to.send(Reply::Outcome(CommitOutcome::Failed(err)));
            return;
        }
        if !self.node.is_leader() {
            let err = CpError::not_leader(self.node.leader_id());
            let _ = respond_to.send(Reply::Outcome(CommitOutcome::Failed(err)));
            return;
        }

        let retryable = invocation.is_retry_safe() || operation.is_read_only();
        let kind = operation.kind();
        let payload = CommandPayload {
            invocation,
            operation,
            timestamp_ms: now_ms(),
        };
        match self.node.propose(&payload) {
            Ok((index, term)) => {
                debug!(group = %self.group, member = self.node.id(), index, term, kind, "proposed");
                self.proposals.insert(
                    index,
                    PendingProposal {
                        term,
                        retryable,
                        respond_to,
                    },
                );
            }
            Err(err) => {
                warn!(
                    group = %self.group,
                    member = self.node.id(),
                    kind,
                    error = %err,
                    "proposal rejected"
                );
                let err = if self.node.is_leader() {
                    CpError::internal(err)
                } else {
                    CpError::not_leader(self.node.leader_id())
                };
                let _ = respond_to.send(Reply::Outcome(CommitOutcome::Failed(err)));
            }
        }
    }

    fn query(
        &mut self,
        operation: Operation,
        policy: QueryPolicy,
        respond_to: oneshot::Sender<CommitOutcome>,
    ) {
        let admitted = query::admit(
            policy,
            &operation,
            self.node.is_leader(),
            self.node.leader_id(),
        );
        if let Err(err) = admitted {
            let _ = respond_to.send(CommitOutcome::Failed(err));
            return;
        }
        match policy {
            QueryPolicy::Local => {
                let _ = respond_to.send(self.node.state_machine().query(&operation).into());
            }
            QueryPolicy::Linearizable => self.reads.push(PendingRead {
                operation,
                respond_to,
            }),
        }
    }

    fn issue_reads(&mut self) {
        if self.reads.is_empty() || !self.node.can_serve_reads() {
            return;
        }
        for ctx in self.reads.issue() {
            self.node.read_index(ctx);
        }
    }

    /// Proposes an entry on behalf of this member rather than a client.
    fn propose_internal(&mut self, operation: Operation) {
        let kind = operation.kind();
        let payload = CommandPayload {
            invocation: Invocation::sessionless(),
            operation,
            timestamp_ms: now_ms(),
        };
        if let Err(err) = self.node.propose(&payload) {
            warn!(
                group = %self.group,
                member = self.node.id(),
                kind,
                error = %err,
                "internal proposal rejected"
            );
        }
    }

    fn propose_expiries(&mut self) {
        if !self.node.is_leader() {
            return;
        }
        let now = now_ms();
        let machine = self.node.state_machine();
        let sessions = machine.expired_sessions(now, self.leader_since_ms);
        let keys = machine.expired_wait_keys(now);

        if !sessions.is_empty() {
            info!(
                group = %self.group,
                member = self.node.id(),
                count = sessions.len(),
                "expiring sessions"
            );
            self.propose_internal(Operation::ExpireSessions { sessions });
        }
        if !keys.is_empty() {
            debug!(
                group = %self.group,
                member = self.node.id(),
                count = keys.len(),
                "expiring wait keys"
            );
            self.propose_internal(Operation::ExpireWaitKeys { keys });
        }
    }

    /// Proposes closing the endpoint's sessions. A follower's proposal is
    /// forwarded to the leader by raft; the session versions keep a stale
    /// view from closing anything that changed since.
    fn expire_endpoint(&mut self, endpoint: &str) {
        let sessions = self.node.state_machine().sessions_owned_by(endpoint);
        if sessions.is_empty() {
            return;
        }
        if !self.node.is_leader() && self.node.leader_id().is_none() {
            warn!(
                group = %self.group,
                member = self.node.id(),
                endpoint,
                "no leader to close sessions of departed endpoint"
            );
            return;
        }
        info!(
            group = %self.group,
            member = self.node.id(),
            endpoint,
            count = sessions.len(),
            leader = ?self.node.leader_id(),
            "closing sessions of departed endpoint"
        );
        self.propose_internal(Operation::ExpireSessions { sessions });
    }

    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg)?;
            }
            for entry in bundle.applied {
                self.on_applied(entry);
            }
            for read_state in bundle.read_states {
                self.reads.confirm(&read_state.request_ctx, read_state.index);
            }
            self.observe_role();
            self.resolve_stale_proposals();
            self.serve_reads();
        }
        self.observe_role();
        Ok(())
    }

    fn dispatch_message(&mut self, msg: Message) -> Result<()> {
        if msg.to == self.node.id() {
            return self.node.step(msg);
        }
        self.transport.send(&self.group, msg);
        Ok(())
    }

    fn on_applied(&mut self, entry: AppliedEntry) {
        let AppliedEntry {
            index,
            term,
            invocation,
            output,
        } = entry;

        for notification in output.notifications {
            if let Some(waiter) = self.parked.remove(&notification.uid) {
                let _ = waiter.send(notification.result.into());
            }
        }

        let Some(pending) = self.proposals.remove(&index) else {
            return;
        };
        if pending.term != term {
            let _ = pending.respond_to.send(Reply::Outcome(CommitOutcome::Indeterminate {
                retryable: pending.retryable,
            }));
            return;
        }
        let reply = match (output.applied, invocation.invocation_uid) {
            (Applied::Done(result), _) => Reply::Outcome(result.into()),
            (Applied::Waiting, Some(uid)) => {
                let (waiter, parked) = oneshot::channel();
                self.parked.insert(uid, waiter);
                Reply::Parked(parked)
            }
            (Applied::Waiting, None) => Reply::Outcome(CommitOutcome::Indeterminate {
                retryable: pending.retryable,
            }),
        };
        let _ = pending.respond_to.send(reply);
    }

    /// Proposals at or below the applied index that were not answered were
    /// overwritten by another leader's entries.
    fn resolve_stale_proposals(&mut self) {
        let open = self.proposals.split_off(&(self.node.applied_index() + 1));
        for (_, pending) in std::mem::replace(&mut self.proposals, open) {
            let _ = pending.respond_to.send(Reply::Outcome(CommitOutcome::Indeterminate {
                retryable: pending.retryable,
            }));
        }
    }

    fn serve_reads(&mut self) {
        for read in self.reads.ready(self.node.applied_index()) {
            let result = self.node.state_machine().query(&read.operation);
            let _ = read.respond_to.send(result.into());
        }
    }

    fn observe_role(&mut self) {
        let role = self.node.role();
        let term = self.node.term();
        if role == self.last_role && term == self.last_term {
            return;
        }
        if role != self.last_role {
            info!(
                group = %self.group,
                member = self.node.id(),
                term,
                leader = ?self.node.leader_id(),
                "role changed {:?} -> {:?}",
                self.last_role,
                role
            );
        }

        let was_leader = self.last_role == StateRole::Leader;
        if was_leader && (role != StateRole::Leader || term != self.last_term) {
            self.abandon_leadership();
        }
        if role == StateRole::Leader && !was_leader {
            self.leader_since_ms = now_ms();
        }
        self.last_role = role;
        self.last_term = term;
    }

    /// Pending proposals can no longer be tracked to a result.
    fn abandon_leadership(&mut self) {
        let hint = self.node.leader_id();
        let proposals = std::mem::take(&mut self.proposals);
        let reads = self.reads.drain();
        if !proposals.is_empty() || !reads.is_empty() {
            warn!(
                group = %self.group,
                member = self.node.id(),
                proposals = proposals.len(),
                reads = reads.len(),
                "lost leadership with requests in flight"
            );
        }
        for (_, pending) in proposals {
            let _ = pending.respond_to.send(Reply::Outcome(CommitOutcome::Indeterminate {
                retryable: pending.retryable,
            }));
        }
        for read in reads {
            let _ = read.respond_to.send(CommitOutcome::Failed(CpError::not_leader(hint)));
        }
    }

    fn status(&self) -> GroupStatus {
        GroupStatus {
            group: self.group.clone(),
            member: self.node.id(),
            role: self.node.role(),
            leader: self.node.leader_id(),
            term: self.node.term(),
            commit_index: self.node.commit_index(),
            applied_index: self.node.applied_index(),
            last_index: self.node.last_index(),
            sessions: self.node.state_machine().sessions().len(),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
