//! Replicated session registry.
//!
//! A session is a lease between a client endpoint and a group. Sessions are
//! created, renewed and closed only by applying committed log entries, so
//! every member agrees on which sessions exist. Expiry is detected by the
//! leader (see [`SessionRegistry::expired`]) and replicated back through the
//! log as `ExpireSessions`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::command::ThreadId;
use crate::error::CpError;

pub type SessionId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpSession {
    pub id: SessionId,
    pub endpoint: String,
    pub created_at_ms: u64,
    pub last_heartbeat_ms: u64,
    /// Bumped on every heartbeat; expiry proposals carry the version they saw.
    pub version: u64,
}

impl CpSession {
    pub fn expires_at_ms(&self, ttl_ms: u64) -> u64 {
        self.last_heartbeat_ms.saturating_add(ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, CpSession>,
    next_session_id: SessionId,
    next_thread_id: ThreadId,
    ttl_ms: u64,
}

impl SessionRegistry {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            sessions: BTreeMap::new(),
            next_session_id: 1,
            next_thread_id: 1,
            ttl_ms,
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn create(&mut self, endpoint: String, now_ms: u64) -> &CpSession {
        let id = self.next_session_id;
        self.next_session_id += 1;
        self.sessions.entry(id).or_insert(CpSession {
            id,
            endpoint,
            created_at_ms: now_ms,
            last_heartbeat_ms: now_ms,
            version: 0,
        })
    }

    pub fn heartbeat(&mut self, id: SessionId, now_ms: u64) -> Result<(), CpError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(CpError::SessionExpired { session_id: id })?;
        session.last_heartbeat_ms = session.last_heartbeat_ms.max(now_ms);
        session.version += 1;
        Ok(())
    }

    pub fn close(&mut self, id: SessionId) -> Option<CpSession> {
        self.sessions.remove(&id)
    }

    /// Closes the session only if nobody renewed it since `version` was read.
    pub fn close_if_version(&mut self, id: SessionId, version: u64) -> Option<CpSession> {
        match self.sessions.get(&id) {
            Some(session) if session.version == version => self.sessions.remove(&id),
            _ => None,
        }
    }

    pub fn get(&self, id: SessionId) -> Option<&CpSession> {
        self.sessions.get(&id)
    }

    pub fn is_active(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Sessions whose lease ran out at `now_ms`.
    ///
    /// Heartbeats older than `renewed_at_ms` count as received at that
    /// instant; a new leader passes its election time so that sessions are
    /// not punished for heartbeats lost during the leader change.
    pub fn expired(&self, now_ms: u64, renewed_at_ms: u64) -> Vec<(SessionId, u64)> {
        self.sessions
            .values()
            .filter(|session| {
                let last = session.last_heartbeat_ms.max(renewed_at_ms);
                now_ms >= last.saturating_add(self.ttl_ms)
            })
            .map(|session| (session.id, session.version))
            .collect()
    }

    pub fn owned_by(&self, endpoint: &str) -> Vec<(SessionId, u64)> {
        self.sessions
            .values()
            .filter(|session| session.endpoint == endpoint)
            .map(|session| (session.id, session.version))
            .collect()
    }

    pub fn generate_thread_id(&mut self) -> ThreadId {
        let id = self.next_thread_id;
        self.next_thread_id += 1;
        id
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_sequential_and_heartbeats_bump_version() {
        let mut registry = SessionRegistry::new(1_000);
        let first = registry.create("client-a".into(), 10).id;
        let second = registry.create("client-b".into(), 20).id;
        assert_eq!((first, second), (1, 2));

        registry.heartbeat(first, 500).unwrap();
        let session = registry.get(first).unwrap();
        assert_eq!(session.version, 1);
        assert_eq!(session.last_heartbeat_ms, 500);
        assert_eq!(session.expires_at_ms(registry.ttl_ms()), 1_500);

        assert_eq!(
            registry.heartbeat(99, 500),
            Err(CpError::SessionExpired { session_id: 99 })
        );
    }

    #[test]
    fn expiry_respects_ttl_and_leader_grace() {
        let mut registry = SessionRegistry::new(1_000);
        let id = registry.create("client".into(), 0).id;

        assert!(registry.expired(999, 0).is_empty());
        assert_eq!(registry.expired(1_000, 0), vec![(id, 0)]);
        // A leader elected at t=800 gives the session until t=1800.
        assert!(registry.expired(1_500, 800).is_empty());
    }

    #[test]
    fn stale_expiry_does_not_close_renewed_session() {
        let mut registry = SessionRegistry::new(1_000);
        let id = registry.create("client".into(), 0).id;
        let (_, seen_version) = registry.expired(2_000, 0)[0];

        registry.heartbeat(id, 2_100).unwrap();
        assert!(registry.close_if_version(id, seen_version).is_none());
        assert!(registry.is_active(id));
        assert!(registry.close_if_version(id, seen_version + 1).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn sessions_are_found_by_endpoint() {
        let mut registry = SessionRegistry::new(1_000);
        let a = registry.create("10.0.0.1:5701".into(), 0).id;
        registry.create("10.0.0.2:5701".into(), 0);
        let a2 = registry.create("10.0.0.1:5701".into(), 0).id;

        let owned: Vec<_> = registry
            .owned_by("10.0.0.1:5701")
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(owned, vec![a, a2]);
        assert_eq!(registry.generate_thread_id(), 1);
        assert_eq!(registry.generate_thread_id(), 2);
    }
}
