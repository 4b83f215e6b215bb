//! Counting semaphore with session-aware permit ownership.
//!
//! Permits acquired under a session are recorded per `(session, thread)` so
//! that closing the session returns them. Callers that cannot be served park
//! in a FIFO queue; releases grant queued acquires strictly in arrival order
//! and stop at the first one that does not fit.
//!
//! Capacity is what `init`, `increase` and `reduce` configured. Available plus
//! held permits never exceed it, so a sessionless release can only return
//! permits that a sessionless acquire or drain took out.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::{
    Applied, Replicas, SessionAware, WaitKeyOwner, WaiterNotification, deadline, require_uid,
};
use crate::command::{Invocation, InvocationUid, OpValue, SemaphoreOp, ThreadId};
use crate::error::CpError;
use crate::session::SessionId;

const ACQUIRE_KIND: &str = "semaphore.acquire";

type Holder = (SessionId, ThreadId);

fn holder_of(invocation: &Invocation) -> Option<Holder> {
    invocation
        .session_id
        .map(|session| (session, invocation.thread_id.unwrap_or_default()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct AcquireWaiter {
    uid: InvocationUid,
    holder: Option<Holder>,
    permits: u32,
    deadline_ms: Option<u64>,
}

impl AcquireWaiter {
    fn notification(&self, result: Result<OpValue, CpError>) -> WaiterNotification {
        WaiterNotification {
            uid: self.uid,
            session_id: self.holder.map(|(session, _)| session),
            kind: ACQUIRE_KIND,
            result,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Semaphore {
    initialized: bool,
    capacity: i64,
    available: i64,
    held: BTreeMap<Holder, u64>,
    waiters: VecDeque<AcquireWaiter>,
}

impl Semaphore {
    pub fn available(&self) -> i64 {
        self.available
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    /// Permits held by any session.
    pub fn held(&self) -> u64 {
        self.held.values().sum()
    }

    /// Permits currently held by `session` across all of its threads.
    pub fn held_by(&self, session: SessionId) -> u64 {
        self.held
            .range((session, ThreadId::MIN)..=(session, ThreadId::MAX))
            .map(|(_, permits)| permits)
            .sum()
    }

    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    pub fn init(&mut self, permits: u32, notifications: &mut Vec<WaiterNotification>) -> bool {
        if self.initialized {
            return false;
        }
        self.initialized = true;
        self.capacity = i64::from(permits);
        self.available = i64::from(permits);
        self.grant_waiters(notifications);
        true
    }

    pub fn acquire(
        &mut self,
        invocation: &Invocation,
        permits: u32,
        timeout_ms: Option<u64>,
        now_ms: u64,
    ) -> Applied {
        if permits == 0 {
            return Applied::Done(Err(CpError::invalid_argument("permits must be positive")));
        }
        if let Some(uid) = invocation.invocation_uid {
            if self.waiters.iter().any(|waiter| waiter.uid == uid) {
                return Applied::Waiting;
            }
        }

        let holder = holder_of(invocation);
        // Queued callers are served first; a new caller never overtakes them.
        if self.waiters.is_empty() && self.available >= i64::from(permits) {
            self.grant(holder, permits);
            return Applied::Done(Ok(OpValue::Bool(true)));
        }
        if timeout_ms == Some(0) {
            return Applied::Done(Ok(OpValue::Bool(false)));
        }

        match require_uid(invocation.invocation_uid) {
            Ok(uid) => {
                self.waiters.push_back(AcquireWaiter {
                    uid,
                    holder,
                    permits,
                    deadline_ms: deadline(now_ms, timeout_ms),
                });
                Applied::Waiting
            }
            Err(err) => Applied::Done(Err(err)),
        }
    }

    pub fn release(
        &mut self,
        invocation: &Invocation,
        permits: u32,
        notifications: &mut Vec<WaiterNotification>,
    ) -> Result<OpValue, CpError> {
        if permits == 0 {
            return Err(CpError::invalid_argument("permits must be positive"));
        }
        if let Some(holder) = holder_of(invocation) {
            let held = self.held.get(&holder).copied().unwrap_or(0);
            if held < u64::from(permits) {
                return Err(CpError::illegal_state(format!(
                    "session {} thread {} holds {held} permits, cannot release {permits}",
                    holder.0, holder.1
                )));
            }
            if held == u64::from(permits) {
                self.held.remove(&holder);
            } else {
                self.held.insert(holder, held - u64::from(permits));
            }
        } else {
            let outstanding = self.available + self.held() as i64;
            if outstanding + i64::from(permits) > self.capacity {
                return Err(CpError::illegal_state(format!(
                    "cannot release {permits} permits, {outstanding} of {} are already outstanding",
                    self.capacity
                )));
            }
        }
        self.available += i64::from(permits);
        self.grant_waiters(notifications);
        Ok(OpValue::Unit)
    }

    /// Takes every available permit; a negative count is reset to zero.
    pub fn drain(&mut self, invocation: &Invocation) -> i64 {
        let drained = self.available.max(0);
        self.available = 0;
        if drained > 0 {
            if let Some(holder) = holder_of(invocation) {
                *self.held.entry(holder).or_default() += drained as u64;
            }
        }
        drained
    }

    pub fn increase(&mut self, permits: u32, notifications: &mut Vec<WaiterNotification>) {
        self.initialized = true;
        self.capacity += i64::from(permits);
        self.available += i64::from(permits);
        self.grant_waiters(notifications);
    }

    pub fn reduce(&mut self, permits: u32, allow_negative: bool) -> Result<(), CpError> {
        let reduced = self.available - i64::from(permits);
        if reduced < 0 && !allow_negative {
            return Err(CpError::illegal_state(format!(
                "cannot reduce {} available permits by {permits}",
                self.available
            )));
        }
        self.initialized = true;
        self.capacity -= i64::from(permits);
        self.available = reduced;
        Ok(())
    }

    fn grant(&mut self, holder: Option<Holder>, permits: u32) {
        self.available -= i64::from(permits);
        if let Some(holder) = holder {
            *self.held.entry(holder).or_default() += u64::from(permits);
        }
    }

    fn grant_waiters(&mut self, notifications: &mut Vec<WaiterNotification>) {
        while let Some(front) = self.waiters.front() {
            if self.available < i64::from(front.permits) {
                break;
            }
            if let Some(waiter) = self.waiters.pop_front() {
                self.grant(waiter.holder, waiter.permits);
                notifications.push(waiter.notification(Ok(OpValue::Bool(true))));
            }
        }
    }

    fn close_session(&mut self, session: SessionId, notifications: &mut Vec<WaiterNotification>) {
        let released: u64 = self.held_by(session);
        self.held.retain(|(owner, _), _| *owner != session);

        let (cancelled, kept): (VecDeque<_>, VecDeque<_>) = self
            .waiters
            .drain(..)
            .partition(|waiter| matches!(waiter.holder, Some((owner, _)) if owner == session));
        self.waiters = kept;
        notifications.extend(cancelled.iter().map(|waiter| {
            waiter.notification(Err(CpError::SessionExpired { session_id: session }))
        }));

        self.available += released as i64;
        self.grant_waiters(notifications);
    }

    fn expire_waiter(&mut self, uid: InvocationUid, notifications: &mut Vec<WaiterNotification>) {
        let Some(position) = self.waiters.iter().position(|waiter| waiter.uid == uid) else {
            return;
        };
        if let Some(waiter) = self.waiters.remove(position) {
            notifications.push(waiter.notification(Ok(OpValue::Bool(false))));
        }
        // The removed waiter may have been blocking the head of the queue.
        self.grant_waiters(notifications);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreService {
    semaphores: Replicas<Semaphore>,
    allow_negative_permits: bool,
}

impl SemaphoreService {
    pub fn new(allow_negative_permits: bool) -> Self {
        Self {
            semaphores: Replicas::default(),
            allow_negative_permits,
        }
    }

    pub fn apply(
        &mut self,
        name: &str,
        op: SemaphoreOp,
        invocation: &Invocation,
        now_ms: u64,
        notifications: &mut Vec<WaiterNotification>,
    ) -> Applied {
        if matches!(op, SemaphoreOp::AvailablePermits) {
            return self.query(name, &op).into();
        }
        let allow_negative = self.allow_negative_permits;
        let semaphore = self.semaphores.get_or_create(name);
        match op {
            SemaphoreOp::Init { permits } => {
                Applied::Done(Ok(OpValue::Bool(semaphore.init(permits, notifications))))
            }
            SemaphoreOp::Acquire {
                permits,
                timeout_ms,
            } => semaphore.acquire(invocation, permits, timeout_ms, now_ms),
            SemaphoreOp::Release { permits } => {
                semaphore.release(invocation, permits, notifications).into()
            }
            SemaphoreOp::Drain => Applied::Done(Ok(OpValue::Count(semaphore.drain(invocation)))),
            SemaphoreOp::Increase { permits } => {
                semaphore.increase(permits, notifications);
                Applied::Done(Ok(OpValue::Unit))
            }
            SemaphoreOp::Reduce { permits } => semaphore
                .reduce(permits, allow_negative)
                .map(|()| OpValue::Unit)
                .into(),
            SemaphoreOp::AvailablePermits => {
                Applied::Done(Ok(OpValue::Count(semaphore.available())))
            }
        }
    }

    pub fn query(&self, name: &str, op: &SemaphoreOp) -> Result<OpValue, CpError> {
        match op {
            SemaphoreOp::AvailablePermits => Ok(OpValue::Count(
                self.semaphores.get(name).map(Semaphore::available).unwrap_or(0),
            )),
            _ => Err(CpError::invalid_argument("not a read-only semaphore operation")),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Semaphore> {
        self.semaphores.get(name)
    }

    pub fn destroy(&mut self, name: &str, notifications: &mut Vec<WaiterNotification>) -> bool {
        let Some(semaphore) = self.semaphores.remove(name) else {
            return false;
        };
        notifications.extend(semaphore.waiters.iter().map(|waiter| {
            waiter.notification(Err(CpError::ObjectDestroyed {
                name: name.to_string(),
            }))
        }));
        true
    }
}

impl SessionAware for SemaphoreService {
    fn on_session_closed(
        &mut self,
        session: SessionId,
        notifications: &mut Vec<WaiterNotification>,
    ) {
        for (_, semaphore) in self.semaphores.iter_mut() {
            semaphore.close_session(session, notifications);
        }
    }
}

impl WaitKeyOwner for SemaphoreService {
    fn expired_wait_keys(&self, now_ms: u64) -> Vec<InvocationUid> {
        self.semaphores
            .iter()
            .flat_map(|(_, semaphore)| semaphore.waiters.iter())
            .filter(|waiter| matches!(waiter.deadline_ms, Some(deadline) if deadline <= now_ms))
            .map(|waiter| waiter.uid)
            .collect()
    }

    fn expire_wait_key(&mut self, uid: InvocationUid, notifications: &mut Vec<WaiterNotification>) {
        for (_, semaphore) in self.semaphores.iter_mut() {
            semaphore.expire_waiter(uid, notifications);
        }
    }
}
