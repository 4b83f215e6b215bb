//! Per-member registry of CP groups.
//!
//! A member may belong to several groups; each runs its own worker, log and
//! state machine. The manager routes requests to the right worker by
//! [`ConsensusGroupId`] and fans endpoint departures out to every group.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, ensure};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::command::{Invocation, Operation, OperationRequest};
use crate::config::CpConfig;
use crate::error::{CommitOutcome, CpError};
use crate::group::{ConsensusGroupId, GroupTopology, MemberId};
use crate::query::QueryPolicy;
use crate::runtime::{GroupHandle, GroupStatus, spawn_group};
use crate::transport::Transport;

struct ManagedGroup {
    handle: GroupHandle,
    topology: GroupTopology,
    task: JoinHandle<()>,
}

pub struct GroupManager {
    member: MemberId,
    config: CpConfig,
    transport: Arc<dyn Transport>,
    groups: RwLock<HashMap<ConsensusGroupId, ManagedGroup>>,
}

impl GroupManager {
    pub fn new(member: MemberId, config: CpConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            member,
            config,
            transport,
            groups: RwLock::new(HashMap::new()),
        })
    }

    pub fn member(&self) -> MemberId {
        self.member
    }

    pub fn config(&self) -> &CpConfig {
        &self.config
    }

    /// Starts this member's replica of `group`. Every member in `members`
    /// must create the group with the same id and member list.
    pub async fn create_group(
        &self,
        group: ConsensusGroupId,
        members: Vec<MemberId>,
    ) -> Result<GroupHandle> {
        let topology = GroupTopology::new(members)?;
        let mut groups = self.groups.write().await;
        ensure!(!groups.contains_key(&group), "group {group} already exists");

        let (handle, task) = spawn_group(
            group.clone(),
            self.member,
            &topology,
            &self.config,
            Arc::clone(&self.transport),
        )?;
        info!(%group, member = self.member, members = ?topology.ids(), "created group");
        groups.insert(
            group,
            ManagedGroup {
                handle: handle.clone(),
                topology,
                task,
            },
        );
        Ok(handle)
    }

    /// Stops this member's replica of `group`. Returns false if it was not
    /// running here.
    pub async fn destroy_group(&self, group: &ConsensusGroupId) -> Result<bool> {
        let Some(managed) = self.groups.write().await.remove(group) else {
            return Ok(false);
        };
        if managed.handle.shutdown().is_err() {
            warn!(%group, member = self.member, "group worker already stopped");
        }
        if let Err(err) = managed.task.await {
            warn!(%group, member = self.member, error = %err, "group worker did not stop cleanly");
        }
        self.transport.detach(group, self.member);
        info!(%group, member = self.member, "destroyed group");
        Ok(true)
    }

    pub async fn handle(&self, group: &ConsensusGroupId) -> Result<GroupHandle, CpError> {
        self.groups
            .read()
            .await
            .get(group)
            .map(|managed| managed.handle.clone())
            .ok_or_else(|| CpError::GroupNotFound {
                group: group.to_string(),
            })
    }

    pub async fn groups(&self) -> Vec<ConsensusGroupId> {
        let mut groups: Vec<_> = self.groups.read().await.keys().cloned().collect();
        groups.sort();
        groups
    }

    pub async fn members_of(&self, group: &ConsensusGroupId) -> Option<Vec<MemberId>> {
        self.groups
            .read()
            .await
            .get(group)
            .map(|managed| managed.topology.ids().to_vec())
    }

    pub async fn submit(&self, request: OperationRequest) -> CommitOutcome {
        let OperationRequest {
            group_id,
            invocation,
            operation,
        } = request;
        match self.handle(&group_id).await {
            Ok(handle) => handle.submit(invocation, operation).await,
            Err(err) => CommitOutcome::Failed(err),
        }
    }

    /// Shorthand for [`submit`](Self::submit) without building a request.
    pub async fn execute(
        &self,
        group: &ConsensusGroupId,
        invocation: Invocation,
        operation: Operation,
    ) -> CommitOutcome {
        match self.handle(group).await {
            Ok(handle) => handle.submit(invocation, operation).await,
            Err(err) => CommitOutcome::Failed(err),
        }
    }

    pub async fn query(
        &self,
        group: &ConsensusGroupId,
        operation: Operation,
        policy: QueryPolicy,
    ) -> CommitOutcome {
        match self.handle(group).await {
            Ok(handle) => handle.query(operation, policy).await,
            Err(err) => CommitOutcome::Failed(err),
        }
    }

    pub async fn group_status(&self, group: &ConsensusGroupId) -> Result<GroupStatus> {
        self.handle(group).await?.status().await
    }

    /// Closes the sessions of a departed client endpoint in every group
    /// this member belongs to. Followers hand the closure to their leader.
    pub async fn on_endpoint_disconnected(&self, endpoint: &str) {
        for (group, managed) in self.groups.read().await.iter() {
            if let Err(err) = managed.handle.endpoint_disconnected(endpoint) {
                warn!(
                    %group,
                    member = self.member,
                    error = %err,
                    "could not forward endpoint departure"
                );
            }
        }
    }

    pub async fn shutdown(&self) {
        for group in self.groups().await {
            if let Err(err) = self.destroy_group(&group).await {
                warn!(%group, member = self.member, error = %err, "failed to stop group");
            }
        }
    }
}
