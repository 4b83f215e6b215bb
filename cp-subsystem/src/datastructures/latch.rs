//! Countdown latch.
//!
//! A round starts with `try_set_count` and ends when the count reaches zero.
//! The first session to count down owns the round; if that session closes
//! before the round ends, the latch cannot be trusted to open and its
//! awaiters are failed.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::{
    Applied, Replicas, SessionAware, WaitKeyOwner, WaiterNotification, deadline, require_uid,
};
use crate::command::{Invocation, InvocationUid, LatchOp, OpValue};
use crate::error::CpError;
use crate::session::SessionId;

const AWAIT_KIND: &str = "latch.await";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct AwaitWaiter {
    uid: InvocationUid,
    session_id: Option<SessionId>,
    deadline_ms: Option<u64>,
}

impl AwaitWaiter {
    fn notification(&self, result: Result<OpValue, CpError>) -> WaiterNotification {
        WaiterNotification {
            uid: self.uid,
            session_id: self.session_id,
            kind: AWAIT_KIND,
            result,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountDownLatch {
    count: u32,
    round: u64,
    owner: Option<SessionId>,
    waiters: VecDeque<AwaitWaiter>,
}

impl CountDownLatch {
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Session that started the current countdown, if any.
    pub fn owner(&self) -> Option<SessionId> {
        self.owner
    }

    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    /// Returns the remaining count.
    pub fn count_down(
        &mut self,
        session: Option<SessionId>,
        notifications: &mut Vec<WaiterNotification>,
    ) -> u32 {
        if self.count == 0 {
            return 0;
        }
        if self.owner.is_none() {
            self.owner = session;
        }
        self.count -= 1;
        if self.count == 0 {
            self.owner = None;
            notifications.extend(
                self.waiters
                    .drain(..)
                    .map(|waiter| waiter.notification(Ok(OpValue::Bool(true)))),
            );
        }
        self.count
    }

    /// Starts a new round. A zero count leaves the latch open and starts no
    /// round.
    pub fn try_set_count(&mut self, count: u32) -> Result<(), CpError> {
        if self.count > 0 {
            return Err(CpError::illegal_state(format!(
                "count is {}, a new count can only be set once it reaches zero",
                self.count
            )));
        }
        if count == 0 {
            return Ok(());
        }
        self.count = count;
        self.round += 1;
        self.owner = None;
        Ok(())
    }

    pub fn await_zero(
        &mut self,
        invocation: &Invocation,
        timeout_ms: Option<u64>,
        now_ms: u64,
    ) -> Applied {
        if self.count == 0 {
            return Applied::Done(Ok(OpValue::Bool(true)));
        }
        if timeout_ms == Some(0) {
            return Applied::Done(Ok(OpValue::Bool(false)));
        }
        let uid = match require_uid(invocation.invocation_uid) {
            Ok(uid) => uid,
            Err(err) => return Applied::Done(Err(err)),
        };
        if !self.waiters.iter().any(|waiter| waiter.uid == uid) {
            self.waiters.push_back(AwaitWaiter {
                uid,
                session_id: invocation.session_id,
                deadline_ms: deadline(now_ms, timeout_ms),
            });
        }
        Applied::Waiting
    }

    /// Drops ownership held by `session` and fails the round's awaiters.
    fn release_owner(
        &mut self,
        name: &str,
        session: SessionId,
        notifications: &mut Vec<WaiterNotification>,
    ) {
        if self.owner != Some(session) {
            return;
        }
        self.owner = None;
        notifications.extend(self.waiters.drain(..).map(|waiter| {
            waiter.notification(Err(CpError::OwnerDisconnected {
                name: name.to_string(),
                session_id: session,
            }))
        }));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatchService {
    latches: Replicas<CountDownLatch>,
}

impl LatchService {
    pub fn apply(
        &mut self,
        name: &str,
        op: LatchOp,
        invocation: &Invocation,
        now_ms: u64,
        notifications: &mut Vec<WaiterNotification>,
    ) -> Applied {
        match op {
            LatchOp::CountDown => {
                let latch = self.latches.get_or_create(name);
                let remaining = latch.count_down(invocation.session_id, notifications);
                Applied::Done(Ok(OpValue::Count(i64::from(remaining))))
            }
            LatchOp::TrySetCount { count } => self
                .latches
                .get_or_create(name)
                .try_set_count(count)
                .map(|()| OpValue::Bool(true))
                .into(),
            LatchOp::Await { timeout_ms } => {
                self.latches
                    .get_or_create(name)
                    .await_zero(invocation, timeout_ms, now_ms)
            }
            read => self.query(name, &read).into(),
        }
    }

    pub fn query(&self, name: &str, op: &LatchOp) -> Result<OpValue, CpError> {
        let latch = self.latches.get(name);
        match op {
            LatchOp::GetCount => Ok(OpValue::Count(
                latch.map(|latch| i64::from(latch.count())).unwrap_or(0),
            )),
            LatchOp::GetRound => Ok(OpValue::Count(
                latch.map(|latch| latch.round() as i64).unwrap_or(0),
            )),
            _ => Err(CpError::invalid_argument("not a read-only latch operation")),
        }
    }

    pub fn get(&self, name: &str) -> Option<&CountDownLatch> {
        self.latches.get(name)
    }

    pub fn destroy(&mut self, name: &str, notifications: &mut Vec<WaiterNotification>) -> bool {
        let Some(latch) = self.latches.remove(name) else {
            return false;
        };
        notifications.extend(latch.waiters.iter().map(|waiter| {
            waiter.notification(Err(CpError::ObjectDestroyed {
                name: name.to_string(),
            }))
        }));
        true
    }
}

impl SessionAware for LatchService {
    fn on_session_closed(
        &mut self,
        session: SessionId,
        notifications: &mut Vec<WaiterNotification>,
    ) {
        for (name, latch) in self.latches.iter_mut() {
            latch.release_owner(name, session, notifications);
        }
    }
}

impl WaitKeyOwner for LatchService {
    fn expired_wait_keys(&self, now_ms: u64) -> Vec<InvocationUid> {
        self.latches
            .iter()
            .flat_map(|(_, latch)| latch.waiters.iter())
            .filter(|waiter| matches!(waiter.deadline_ms, Some(deadline) if deadline <= now_ms))
            .map(|waiter| waiter.uid)
            .collect()
    }

    fn expire_wait_key(&mut self, uid: InvocationUid, notifications: &mut Vec<WaiterNotification>) {
        for (_, latch) in self.latches.iter_mut() {
            if let Some(position) = latch.waiters.iter().position(|waiter| waiter.uid == uid) {
                if let Some(waiter) = latch.waiters.remove(position) {
                    notifications.push(waiter.notification(Ok(OpValue::Bool(false))));
                }
            }
        }
    }
}
