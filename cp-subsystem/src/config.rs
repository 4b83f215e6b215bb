//! Tunables shared by every member of the CP subsystem.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::group::MemberId;
use crate::state_machine::StateMachineOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpConfig {
    /// Wall-clock length of one raft tick.
    pub tick_interval_ms: u64,
    /// Ticks without a heartbeat before a follower campaigns.
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub max_inflight_msgs: usize,
    /// Lease length of a session without heartbeats.
    pub session_ttl_ms: u64,
    /// How often the leader looks for expired sessions and wait keys.
    pub expiry_check_interval_ms: u64,
    /// How long `submit` waits for a commit before reporting Indeterminate.
    pub submit_timeout_ms: u64,
    pub dedup_capacity_per_session: usize,
    /// Let `reducePermits` drive a semaphore below zero.
    pub allow_negative_permits: bool,
}

impl Default for CpConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            session_ttl_ms: 300_000,
            expiry_check_interval_ms: 1_000,
            submit_timeout_ms: 60_000,
            dedup_capacity_per_session: 1_024,
            allow_negative_permits: false,
        }
    }
}

impl CpConfig {
    /// Reads a JSON config file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.tick_interval_ms > 0, "tick_interval_ms must be positive");
        ensure!(self.heartbeat_tick > 0, "heartbeat_tick must be positive");
        ensure!(
            self.election_tick > self.heartbeat_tick,
            "election_tick ({}) must exceed heartbeat_tick ({})",
            self.election_tick,
            self.heartbeat_tick
        );
        ensure!(self.session_ttl_ms > 0, "session_ttl_ms must be positive");
        ensure!(
            self.expiry_check_interval_ms > 0,
            "expiry_check_interval_ms must be positive"
        );
        ensure!(self.submit_timeout_ms > 0, "submit_timeout_ms must be positive");
        ensure!(
            self.dedup_capacity_per_session > 0,
            "dedup_capacity_per_session must be positive"
        );
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_check_interval_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn state_machine_options(&self) -> StateMachineOptions {
        StateMachineOptions {
            session_ttl_ms: self.session_ttl_ms,
            dedup_capacity_per_session: self.dedup_capacity_per_session,
            allow_negative_permits: self.allow_negative_permits,
        }
    }

    pub fn raft_config(&self, id: MemberId) -> raft::Config {
        raft::Config {
            id,
            election_tick: self.election_tick,
            heartbeat_tick: self.heartbeat_tick,
            max_inflight_msgs: self.max_inflight_msgs,
            check_quorum: true,
            pre_vote: true,
            ..Default::default()
        }
    }
}
