//! In-process cluster of CP members over a [`LocalNetwork`].
//!
//! Used by the demo binary and the integration tests. Requests sent through
//! [`LocalCluster::execute`] follow leader hints and retry while the outcome
//! is retryable, which is what a client proxy does on top of the core.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use raft::StateRole;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::command::{Invocation, Operation};
use crate::config::CpConfig;
use crate::error::{CommitOutcome, CpError};
use crate::group::{ConsensusGroupId, MemberId};
use crate::manager::GroupManager;
use crate::query::QueryPolicy;
use crate::transport::LocalNetwork;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct LocalCluster {
    network: LocalNetwork,
    managers: BTreeMap<MemberId, Arc<GroupManager>>,
}

impl LocalCluster {
    pub fn start(members: &[MemberId], config: CpConfig) -> Result<Self> {
        let network = LocalNetwork::new();
        let mut managers = BTreeMap::new();
        for &member in members {
            let manager = GroupManager::new(member, config.clone(), Arc::new(network.clone()))?;
            managers.insert(member, Arc::new(manager));
        }
        Ok(Self { network, managers })
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    pub fn members(&self) -> Vec<MemberId> {
        self.managers.keys().copied().collect()
    }

    pub fn manager(&self, member: MemberId) -> Result<&Arc<GroupManager>> {
        self.managers
            .get(&member)
            .with_context(|| format!("member {member} is not part of the cluster"))
    }

    /// Creates `group` on every member of the cluster.
    pub async fn create_group(&self, group: &ConsensusGroupId) -> Result<()> {
        let members = self.members();
        for manager in self.managers.values() {
            manager.create_group(group.clone(), members.clone()).await?;
        }
        Ok(())
    }

    /// Waits until one of `candidates` leads `group` and returns it.
    pub async fn wait_for_leader_among(
        &self,
        group: &ConsensusGroupId,
        candidates: &[MemberId],
        timeout: Duration,
    ) -> Result<MemberId> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut best: Option<(u64, MemberId)> = None;
            for &member in candidates {
                let status = self.manager(member)?.group_status(group).await?;
                if status.role != StateRole::Leader {
                    continue;
                }
                match best {
                    Some((term, _)) if term >= status.term => {}
                    _ => best = Some((status.term, member)),
                }
            }
            if let Some((_, leader)) = best {
                return Ok(leader);
            }
            if Instant::now() >= deadline {
                bail!("no leader elected for {group} within {timeout:?}");
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn wait_for_leader(
        &self,
        group: &ConsensusGroupId,
        timeout: Duration,
    ) -> Result<MemberId> {
        self.wait_for_leader_among(group, &self.members(), timeout).await
    }

    /// Submits through the leader, following hints and retrying retryable
    /// outcomes until `timeout` runs out.
    pub async fn execute(
        &self,
        group: &ConsensusGroupId,
        invocation: Invocation,
        operation: Operation,
        timeout: Duration,
    ) -> Result<CommitOutcome> {
        let deadline = Instant::now() + timeout;
        let members = self.members();
        let mut target = members.first().copied().context("cluster has no members")?;
        loop {
            let outcome = self
                .manager(target)?
                .execute(group, invocation, operation.clone())
                .await;
            let next = match &outcome {
                CommitOutcome::Failed(CpError::NotLeader {
                    leader_hint: Some(leader),
                }) => Some(*leader),
                CommitOutcome::Failed(CpError::NoLeaderElected) => {
                    Some(next_member(&members, target))
                }
                CommitOutcome::Indeterminate { retryable: true } => Some(target),
                _ => None,
            };
            match next {
                Some(member) if Instant::now() < deadline => {
                    debug!(%group, from = target, to = member, "retrying operation");
                    target = member;
                    sleep(POLL_INTERVAL).await;
                }
                _ => return Ok(outcome),
            }
        }
    }

    pub async fn query(
        &self,
        group: &ConsensusGroupId,
        member: MemberId,
        operation: Operation,
        policy: QueryPolicy,
    ) -> Result<CommitOutcome> {
        Ok(self.manager(member)?.query(group, operation, policy).await)
    }

    pub async fn shutdown(&self) {
        for manager in self.managers.values() {
            manager.shutdown().await;
        }
    }
}

fn next_member(members: &[MemberId], current: MemberId) -> MemberId {
    let position = members.iter().position(|&m| m == current).unwrap_or(0);
    members[(position + 1) % members.len()]
}
