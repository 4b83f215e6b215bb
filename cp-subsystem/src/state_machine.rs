//! Apply loop of a CP group.
//!
//! Committed [`CommandPayload`]s are applied here strictly in log order. The
//! state machine validates the caller's session, consults the dedup cache,
//! dispatches on the operation tag and records the result. Everything is a
//! function of the payload sequence, so replicas that apply the same log end
//! up equal.

use crate::command::{
    CommandPayload, Invocation, InvocationUid, ObjectKind, OpValue, Operation, SessionGrant,
    SessionOp,
};
use crate::datastructures::{
    Applied, AtomicRefService, CountDownLatch, LatchService, Semaphore, SemaphoreService,
    SessionAware, WaitKeyOwner, WaiterNotification,
};
use crate::dedup::InvocationCache;
use crate::error::CpError;
use crate::session::{SessionId, SessionRegistry};

/// Tunables that affect apply results. All members must agree on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMachineOptions {
    pub session_ttl_ms: u64,
    pub dedup_capacity_per_session: usize,
    pub allow_negative_permits: bool,
}

/// Result of applying one committed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutput {
    pub applied: Applied,
    /// Parked calls answered by this entry.
    pub notifications: Vec<WaiterNotification>,
}

impl ApplyOutput {
    fn done(result: Result<OpValue, CpError>) -> Self {
        Self {
            applied: Applied::Done(result),
            notifications: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachine {
    sessions: SessionRegistry,
    invocations: InvocationCache,
    atomic_refs: AtomicRefService,
    semaphores: SemaphoreService,
    latches: LatchService,
}

impl StateMachine {
    pub fn new(options: StateMachineOptions) -> Self {
        Self {
            sessions: SessionRegistry::new(options.session_ttl_ms),
            invocations: InvocationCache::new(options.dedup_capacity_per_session),
            atomic_refs: AtomicRefService::default(),
            semaphores: SemaphoreService::new(options.allow_negative_permits),
            latches: LatchService::default(),
        }
    }

    pub fn apply(&mut self, payload: CommandPayload) -> ApplyOutput {
        let CommandPayload {
            invocation,
            operation,
            timestamp_ms,
        } = payload;

        if let Some(session) = invocation.session_id {
            if !self.sessions.is_active(session) {
                return ApplyOutput::done(Err(CpError::SessionExpired {
                    session_id: session,
                }));
            }
        }

        let kind = operation.kind();
        let dedup_key = match (invocation.session_id, invocation.invocation_uid) {
            (Some(session), Some(uid)) if !operation.is_read_only() => Some((session, uid)),
            _ => None,
        };
        if let Some((session, uid)) = dedup_key {
            if let Some(cached) = self.invocations.lookup(session, kind, uid) {
                return ApplyOutput::done(Ok(cached.clone()));
            }
        }

        let mut notifications = Vec::new();
        let applied = self.dispatch(operation, &invocation, timestamp_ms, &mut notifications);

        if let (Some((session, uid)), Applied::Done(Ok(value))) = (dedup_key, &applied) {
            self.remember(session, kind, uid, value);
        }
        for notification in &notifications {
            if let (Some(session), Ok(value)) = (notification.session_id, &notification.result) {
                self.remember(session, notification.kind, notification.uid, value);
            }
        }

        ApplyOutput {
            applied,
            notifications,
        }
    }

    fn remember(
        &mut self,
        session: SessionId,
        kind: &'static str,
        uid: InvocationUid,
        value: &OpValue,
    ) {
        if self.sessions.is_active(session) {
            self.invocations.record(session, kind, uid, value.clone());
        }
    }

    fn dispatch(
        &mut self,
        operation: Operation,
        invocation: &Invocation,
        now_ms: u64,
        notifications: &mut Vec<WaiterNotification>,
    ) -> Applied {
        match operation {
            Operation::Session(op) => self.apply_session(op, now_ms, notifications).into(),
            Operation::AtomicRef { name, op } => self.atomic_refs.apply(&name, op),
            Operation::Semaphore { name, op } => {
                self.semaphores
                    .apply(&name, op, invocation, now_ms, notifications)
            }
            Operation::Latch { name, op } => {
                self.latches.apply(&name, op, invocation, now_ms, notifications)
            }
            Operation::Destroy { kind, name } => {
                let destroyed = match kind {
                    ObjectKind::AtomicRef => self.atomic_refs.destroy(&name),
                    ObjectKind::Semaphore => self.semaphores.destroy(&name, notifications),
                    ObjectKind::Latch => self.latches.destroy(&name, notifications),
                };
                Applied::Done(Ok(OpValue::Bool(destroyed)))
            }
            Operation::ExpireSessions { sessions } => {
                let mut closed = 0;
                for (session, version) in sessions {
                    if self.sessions.close_if_version(session, version).is_some() {
                        self.release_session(session, notifications);
                        closed += 1;
                    }
                }
                Applied::Done(Ok(OpValue::Count(closed)))
            }
            Operation::ExpireWaitKeys { keys } => {
                for uid in keys {
                    for owner in self.wait_key_owners() {
                        owner.expire_wait_key(uid, notifications);
                    }
                }
                Applied::Done(Ok(OpValue::Unit))
            }
        }
    }

    fn apply_session(
        &mut self,
        op: SessionOp,
        now_ms: u64,
        notifications: &mut Vec<WaiterNotification>,
    ) -> Result<OpValue, CpError> {
        match op {
            SessionOp::Create { endpoint } => {
                let session_id = self.sessions.create(endpoint, now_ms).id;
                Ok(OpValue::Session(SessionGrant {
                    session_id,
                    ttl_ms: self.sessions.ttl_ms(),
                }))
            }
            SessionOp::Heartbeat { session_id } => self
                .sessions
                .heartbeat(session_id, now_ms)
                .map(|()| OpValue::Unit),
            SessionOp::Close { session_id } => match self.sessions.close(session_id) {
                Some(_) => {
                    self.release_session(session_id, notifications);
                    Ok(OpValue::Bool(true))
                }
                None => Ok(OpValue::Bool(false)),
            },
            SessionOp::GenerateThreadId => {
                Ok(OpValue::ThreadId(self.sessions.generate_thread_id()))
            }
        }
    }

    fn session_aware_services(&mut self) -> [&mut dyn SessionAware; 2] {
        [&mut self.semaphores, &mut self.latches]
    }

    fn wait_key_owners(&mut self) -> [&mut dyn WaitKeyOwner; 2] {
        [&mut self.semaphores, &mut self.latches]
    }

    fn release_session(&mut self, session: SessionId, notifications: &mut Vec<WaiterNotification>) {
        self.invocations.discard_session(session);
        for service in self.session_aware_services() {
            service.on_session_closed(session, notifications);
        }
    }

    /// Serves a read-only operation from local state.
    pub fn query(&self, operation: &Operation) -> Result<OpValue, CpError> {
        match operation {
            Operation::AtomicRef { name, op } if operation.is_read_only() => {
                self.atomic_refs.query(name, op)
            }
            Operation::Semaphore { name, op } if operation.is_read_only() => {
                self.semaphores.query(name, op)
            }
            Operation::Latch { name, op } if operation.is_read_only() => {
                self.latches.query(name, op)
            }
            _ => Err(CpError::invalid_argument(format!(
                "{} is not a read-only operation",
                operation.kind()
            ))),
        }
    }

    /// Sessions the leader should propose for expiry at `now_ms`.
    pub fn expired_sessions(&self, now_ms: u64, renewed_at_ms: u64) -> Vec<(SessionId, u64)> {
        self.sessions.expired(now_ms, renewed_at_ms)
    }

    pub fn sessions_owned_by(&self, endpoint: &str) -> Vec<(SessionId, u64)> {
        self.sessions.owned_by(endpoint)
    }

    /// Parked calls the leader should propose for timeout at `now_ms`.
    pub fn expired_wait_keys(&self, now_ms: u64) -> Vec<InvocationUid> {
        let mut keys = self.semaphores.expired_wait_keys(now_ms);
        keys.extend(self.latches.expired_wait_keys(now_ms));
        keys
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn semaphore(&self, name: &str) -> Option<&Semaphore> {
        self.semaphores.get(name)
    }

    pub fn latch(&self, name: &str) -> Option<&CountDownLatch> {
        self.latches.get(name)
    }
}
