//! Replicated data structures.
//!
//! Each structure is a deterministic state machine driven by the group's
//! apply loop. Blocking calls (semaphore acquire, latch await) do not block
//! anything here: they park a waiter in the replica's queue and a later apply
//! step releases it by emitting a [`WaiterNotification`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::command::{InvocationUid, OpValue};
use crate::error::CpError;
use crate::session::SessionId;

pub mod atomic_ref;
pub mod latch;
pub mod semaphore;

pub use atomic_ref::{AtomicRef, AtomicRefService};
pub use latch::{CountDownLatch, LatchService};
pub use semaphore::{Semaphore, SemaphoreService};

/// Result of applying an operation to a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Done(Result<OpValue, CpError>),
    /// The caller was queued and will be answered by a notification.
    Waiting,
}

impl From<Result<OpValue, CpError>> for Applied {
    fn from(result: Result<OpValue, CpError>) -> Self {
        Self::Done(result)
    }
}

/// A parked call answered by a later apply step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaiterNotification {
    pub uid: InvocationUid,
    pub session_id: Option<SessionId>,
    /// Operation kind of the parked call, for the dedup cache.
    pub kind: &'static str,
    pub result: Result<OpValue, CpError>,
}

/// Replicas that keep state on behalf of sessions.
///
/// The state machine calls every registered service when a session closes,
/// whether explicitly or through expiry.
pub trait SessionAware {
    fn on_session_closed(
        &mut self,
        session: SessionId,
        notifications: &mut Vec<WaiterNotification>,
    );
}

/// Replicas that park callers with a deadline.
pub trait WaitKeyOwner {
    /// Parked calls whose deadline is at or before `now_ms`.
    fn expired_wait_keys(&self, now_ms: u64) -> Vec<InvocationUid>;

    /// Answers the parked call with a timeout result, if it is still parked.
    fn expire_wait_key(&mut self, uid: InvocationUid, notifications: &mut Vec<WaiterNotification>);
}

/// Lazily created replicas of one kind, keyed by object name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replicas<T> {
    objects: BTreeMap<String, T>,
}

impl<T> Default for Replicas<T> {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
        }
    }
}

impl<T: Default> Replicas<T> {
    pub fn get_or_create(&mut self, name: &str) -> &mut T {
        self.objects.entry(name.to_string()).or_default()
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.objects.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<T> {
        self.objects.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &T)> {
        self.objects.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut T)> {
        self.objects.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

pub(crate) fn deadline(now_ms: u64, timeout_ms: Option<u64>) -> Option<u64> {
    timeout_ms.map(|timeout| now_ms.saturating_add(timeout))
}

pub(crate) fn require_uid(uid: Option<InvocationUid>) -> Result<InvocationUid, CpError> {
    uid.ok_or_else(|| CpError::invalid_argument("blocking call requires an invocation uid"))
}
