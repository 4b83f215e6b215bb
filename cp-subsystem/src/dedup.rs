//! Per-session cache of applied invocations.
//!
//! A retry of `(session, invocation uid)` returns the recorded result instead
//! of applying the operation twice. Entries live as long as their session,
//! capped per session with oldest-first eviction. Eviction order depends
//! only on apply order, so replicas evict identically.

use std::collections::{HashMap, VecDeque};

use crate::command::{InvocationUid, OpValue};
use crate::session::SessionId;

type CacheKey = (&'static str, InvocationUid);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct SessionInvocations {
    results: HashMap<CacheKey, OpValue>,
    order: VecDeque<CacheKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationCache {
    sessions: HashMap<SessionId, SessionInvocations>,
    capacity_per_session: usize,
}

impl InvocationCache {
    pub fn new(capacity_per_session: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            capacity_per_session: capacity_per_session.max(1),
        }
    }

    pub fn lookup(
        &self,
        session: SessionId,
        kind: &'static str,
        uid: InvocationUid,
    ) -> Option<&OpValue> {
        self.sessions.get(&session)?.results.get(&(kind, uid))
    }

    pub fn record(
        &mut self,
        session: SessionId,
        kind: &'static str,
        uid: InvocationUid,
        value: OpValue,
    ) {
        let entry = self.sessions.entry(session).or_default();
        let key = (kind, uid);
        if entry.results.insert(key, value).is_none() {
            entry.order.push_back(key);
        }
        while entry.order.len() > self.capacity_per_session {
            if let Some(oldest) = entry.order.pop_front() {
                entry.results.remove(&oldest);
            }
        }
    }

    pub fn discard_session(&mut self, session: SessionId) {
        self.sessions.remove(&session);
    }

    pub fn session_len(&self, session: SessionId) -> usize {
        self.sessions
            .get(&session)
            .map(|entry| entry.results.len())
            .unwrap_or(0)
    }
}
