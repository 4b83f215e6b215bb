//! Shared harness for the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use anyhow::{Result, bail};
use cp_subsystem::cluster::LocalCluster;
use cp_subsystem::command::{Invocation, InvocationUid, OpValue, Operation, SessionOp};
use cp_subsystem::config::CpConfig;
use cp_subsystem::error::CommitOutcome;
use cp_subsystem::group::ConsensusGroupId;
use cp_subsystem::session::SessionId;

pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Short ticks so elections settle in tens of milliseconds.
pub fn fast_config() -> CpConfig {
    CpConfig {
        tick_interval_ms: 10,
        election_tick: 10,
        heartbeat_tick: 3,
        expiry_check_interval_ms: 50,
        submit_timeout_ms: 2_000,
        ..CpConfig::default()
    }
}

pub struct Harness {
    pub cluster: LocalCluster,
    pub group: ConsensusGroupId,
}

impl Harness {
    pub async fn start(members: usize, config: CpConfig) -> Result<Self> {
        let ids: Vec<u64> = (1..=members as u64).collect();
        let cluster = LocalCluster::start(&ids, config)?;
        let group = ConsensusGroupId::default_group();
        cluster.create_group(&group).await?;
        cluster.wait_for_leader(&group, CALL_TIMEOUT).await?;
        Ok(Self { cluster, group })
    }

    pub async fn leader(&self) -> Result<u64> {
        self.cluster.wait_for_leader(&self.group, CALL_TIMEOUT).await
    }

    pub async fn execute(
        &self,
        invocation: Invocation,
        operation: Operation,
    ) -> Result<CommitOutcome> {
        self.cluster
            .execute(&self.group, invocation, operation, CALL_TIMEOUT)
            .await
    }

    /// Executes a session-less operation and unwraps its value.
    pub async fn call(&self, operation: Operation) -> Result<OpValue> {
        self.execute(Invocation::sessionless(), operation)
            .await?
            .into_result()
    }

    pub async fn open_session(&self, endpoint: &str) -> Result<SessionId> {
        let value = self
            .call(Operation::Session(SessionOp::Create {
                endpoint: endpoint.to_string(),
            }))
            .await?;
        match value {
            OpValue::Session(grant) => Ok(grant.session_id),
            other => bail!("unexpected session grant {other:?}"),
        }
    }

    pub async fn heartbeat(&self, session_id: SessionId) -> Result<OpValue> {
        self.call(Operation::Session(SessionOp::Heartbeat { session_id }))
            .await
    }

    pub async fn shutdown(&self) {
        self.cluster.shutdown().await;
    }
}

pub fn invocation(session: SessionId, thread: u64) -> Invocation {
    Invocation::new(session, thread, InvocationUid::random())
}

/// Polls `check` until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
