//! Operations replicated through the Raft log.
//!
//! Every CP call is a value of [`Operation`]. The leader wraps it in a
//! [`CommandPayload`] together with the caller's [`Invocation`] and its own
//! clock reading, and that payload is what lands in the log. Apply never reads
//! a clock: `timestamp_ms` is the only notion of time a replica sees.

use std::fmt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::group::ConsensusGroupId;
use crate::session::SessionId;

pub type ThreadId = u64;

/// Client-generated token identifying one logical call across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InvocationUid(pub u128);

impl InvocationUid {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for InvocationUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Caller identity attached to an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub session_id: Option<SessionId>,
    pub thread_id: Option<ThreadId>,
    pub invocation_uid: Option<InvocationUid>,
}

impl Invocation {
    /// A call bound to a session; eligible for deduplication.
    pub fn new(session_id: SessionId, thread_id: ThreadId, invocation_uid: InvocationUid) -> Self {
        Self {
            session_id: Some(session_id),
            thread_id: Some(thread_id),
            invocation_uid: Some(invocation_uid),
        }
    }

    pub fn sessionless() -> Self {
        Self::default()
    }

    /// A session-less call that still needs an identity, e.g. a latch await.
    pub fn with_uid(invocation_uid: InvocationUid) -> Self {
        Self {
            invocation_uid: Some(invocation_uid),
            ..Self::default()
        }
    }

    /// Whether a retry after an indeterminate outcome is deduplicated.
    pub fn is_retry_safe(&self) -> bool {
        self.session_id.is_some() && self.invocation_uid.is_some()
    }
}

/// Kinds of replicated data structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    AtomicRef,
    Semaphore,
    Latch,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AtomicRef => write!(f, "atomic-ref"),
            Self::Semaphore => write!(f, "semaphore"),
            Self::Latch => write!(f, "latch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOp {
    Create { endpoint: String },
    Heartbeat { session_id: SessionId },
    Close { session_id: SessionId },
    GenerateThreadId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicRefOp {
    Get,
    Set { value: Option<Vec<u8>> },
    GetAndSet { value: Option<Vec<u8>> },
    CompareAndSet {
        expected: Option<Vec<u8>>,
        new: Option<Vec<u8>>,
    },
    Contains { value: Option<Vec<u8>> },
}

/// Semaphore operations. `timeout_ms: None` waits until granted,
/// `Some(0)` never waits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SemaphoreOp {
    Init { permits: u32 },
    Acquire { permits: u32, timeout_ms: Option<u64> },
    Release { permits: u32 },
    Drain,
    Increase { permits: u32 },
    Reduce { permits: u32 },
    AvailablePermits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatchOp {
    CountDown,
    TrySetCount { count: u32 },
    Await { timeout_ms: Option<u64> },
    GetCount,
    GetRound,
}

/// Tagged union of everything the state machine can apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Session(SessionOp),
    AtomicRef { name: String, op: AtomicRefOp },
    Semaphore { name: String, op: SemaphoreOp },
    Latch { name: String, op: LatchOp },
    Destroy { kind: ObjectKind, name: String },
    /// Leader-proposed; `(session, version)` pairs observed as expired.
    ExpireSessions { sessions: Vec<(SessionId, u64)> },
    /// Leader-proposed; waiters whose deadline passed.
    ExpireWaitKeys { keys: Vec<InvocationUid> },
}

impl Operation {
    pub fn atomic_ref(name: impl Into<String>, op: AtomicRefOp) -> Self {
        Self::AtomicRef {
            name: name.into(),
            op,
        }
    }

    pub fn semaphore(name: impl Into<String>, op: SemaphoreOp) -> Self {
        Self::Semaphore {
            name: name.into(),
            op,
        }
    }

    pub fn latch(name: impl Into<String>, op: LatchOp) -> Self {
        Self::Latch {
            name: name.into(),
            op,
        }
    }

    /// Whether the operation leaves every replica unchanged.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Self::AtomicRef {
                op: AtomicRefOp::Get | AtomicRefOp::Contains { .. },
                ..
            } | Self::Semaphore {
                op: SemaphoreOp::AvailablePermits,
                ..
            } | Self::Latch {
                op: LatchOp::GetCount | LatchOp::GetRound,
                ..
            }
        )
    }

    /// Stable name of the operation kind, used to key the dedup cache.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Session(SessionOp::Create { .. }) => "session.create",
            Self::Session(SessionOp::Heartbeat { .. }) => "session.heartbeat",
            Self::Session(SessionOp::Close { .. }) => "session.close",
            Self::Session(SessionOp::GenerateThreadId) => "session.generate-thread-id",
            Self::AtomicRef { op, .. } => match op {
                AtomicRefOp::Get => "atomic-ref.get",
                AtomicRefOp::Set { .. } => "atomic-ref.set",
                AtomicRefOp::GetAndSet { .. } => "atomic-ref.get-and-set",
                AtomicRefOp::CompareAndSet { .. } => "atomic-ref.compare-and-set",
                AtomicRefOp::Contains { .. } => "atomic-ref.contains",
            },
            Self::Semaphore { op, .. } => match op {
                SemaphoreOp::Init { .. } => "semaphore.init",
                SemaphoreOp::Acquire { .. } => "semaphore.acquire",
                SemaphoreOp::Release { .. } => "semaphore.release",
                SemaphoreOp::Drain => "semaphore.drain",
                SemaphoreOp::Increase { .. } => "semaphore.increase",
                SemaphoreOp::Reduce { .. } => "semaphore.reduce",
                SemaphoreOp::AvailablePermits => "semaphore.available-permits",
            },
            Self::Latch { op, .. } => match op {
                LatchOp::CountDown => "latch.count-down",
                LatchOp::TrySetCount { .. } => "latch.try-set-count",
                LatchOp::Await { .. } => "latch.await",
                LatchOp::GetCount => "latch.get-count",
                LatchOp::GetRound => "latch.get-round",
            },
            Self::Destroy { .. } => "destroy",
            Self::ExpireSessions { .. } => "expire-sessions",
            Self::ExpireWaitKeys { .. } => "expire-wait-keys",
        }
    }
}

/// Lease handed back by `SessionOp::Create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionGrant {
    pub session_id: SessionId,
    pub ttl_ms: u64,
}

/// Result value of an applied operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpValue {
    Unit,
    Bool(bool),
    Count(i64),
    Value(Option<Vec<u8>>),
    Session(SessionGrant),
    ThreadId(ThreadId),
}

impl OpValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_count(&self) -> Option<i64> {
        match self {
            Self::Count(value) => Some(*value),
            _ => None,
        }
    }
}

/// Inbound request as handed over by the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub group_id: ConsensusGroupId,
    pub invocation: Invocation,
    pub operation: Operation,
}

/// What actually gets written into a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub invocation: Invocation,
    pub operation: Operation,
    /// Leader wall clock at proposal time, in milliseconds since the epoch.
    pub timestamp_ms: u64,
}

impl CommandPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("encode command payload")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context("decode command payload")
    }
}
