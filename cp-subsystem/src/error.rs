//! Operation-level errors and outcomes that cross the core boundary.
//!
//! Consensus-internal failures (vote conflicts, rejected appends, log
//! truncation) never show up here. What does show up is the result of a
//! single client call: it either committed, definitely failed, or ended in an
//! indeterminate state that the caller has to resolve by retrying.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::OpValue;
use crate::group::MemberId;
use crate::session::SessionId;

/// Definite failures of a CP operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpError {
    /// The contacted member is not the group leader.
    #[error("not the leader; hint: {leader_hint:?}")]
    NotLeader { leader_hint: Option<MemberId> },

    /// No leader is currently known for the group.
    #[error("no leader elected")]
    NoLeaderElected,

    /// The session referenced by the call is closed or unknown.
    #[error("session {session_id} expired")]
    SessionExpired { session_id: SessionId },

    /// The operation is not allowed in the replica's current state.
    #[error("illegal state transition: {message}")]
    IllegalStateTransition { message: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("consensus group {group} not found")]
    GroupNotFound { group: String },

    #[error("consensus group is shutting down")]
    GroupShutdown,

    /// The named object was destroyed while the call waited on it.
    #[error("{name} was destroyed")]
    ObjectDestroyed { name: String },

    /// The session counting a latch down closed before the latch opened.
    #[error("countdown owner of {name} (session {session_id}) disconnected")]
    OwnerDisconnected { name: String, session_id: SessionId },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CpError {
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalStateTransition {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }

    /// Whether the caller can retry the same call, possibly elsewhere.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotLeader { .. } | Self::NoLeaderElected)
    }

    /// Builds the rejection for a member that is not leading the group.
    pub fn not_leader(leader_hint: Option<MemberId>) -> Self {
        match leader_hint {
            Some(_) => Self::NotLeader { leader_hint },
            None => Self::NoLeaderElected,
        }
    }
}

/// Result of `submit` and `query`.
///
/// Indeterminate is a regular variant rather than an error so that callers
/// have to decide what to do with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Committed and applied; carries the state machine's result.
    Committed(OpValue),
    /// Definitely not applied (or applied and rejected by the replica).
    Failed(CpError),
    /// The operation may or may not commit.
    ///
    /// `retryable` is set when a retry with the same invocation is safe:
    /// the call carries a session and invocation uid, or it is read-only.
    Indeterminate { retryable: bool },
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    pub fn value(&self) -> Option<&OpValue> {
        match self {
            Self::Committed(value) => Some(value),
            _ => None,
        }
    }

    /// Converts into a plain `Result`, folding Indeterminate into an error.
    pub fn into_result(self) -> anyhow::Result<OpValue> {
        match self {
            Self::Committed(value) => Ok(value),
            Self::Failed(err) => Err(err.into()),
            Self::Indeterminate { retryable } => {
                anyhow::bail!("indeterminate operation state (retryable: {retryable})")
            }
        }
    }
}

impl From<Result<OpValue, CpError>> for CommitOutcome {
    fn from(result: Result<OpValue, CpError>) -> Self {
        match result {
            Ok(value) => Self::Committed(value),
            Err(err) => Self::Failed(err),
        }
    }
}

/// Status codes handed to the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    NotLeader,
    SessionExpired,
    Indeterminate,
    Error,
}

/// Outbound result consumed by the encoding layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    pub value: Option<OpValue>,
    pub leader_hint: Option<MemberId>,
    pub message: Option<String>,
}

impl From<CommitOutcome> for Response {
    fn from(outcome: CommitOutcome) -> Self {
        match outcome {
            CommitOutcome::Committed(value) => Self {
                status: Status::Ok,
                value: Some(value),
                leader_hint: None,
                message: None,
            },
            CommitOutcome::Indeterminate { retryable } => Self {
                status: Status::Indeterminate,
                value: None,
                leader_hint: None,
                message: Some(format!("indeterminate operation state (retryable: {retryable})")),
            },
            CommitOutcome::Failed(err) => {
                let (status, leader_hint) = match &err {
                    CpError::NotLeader { leader_hint } => (Status::NotLeader, *leader_hint),
                    CpError::NoLeaderElected => (Status::NotLeader, None),
                    CpError::SessionExpired { .. } => (Status::SessionExpired, None),
                    _ => (Status::Error, None),
                };
                Self {
                    status,
                    value: None,
                    leader_hint,
                    message: Some(err.to_string()),
                }
            }
        }
    }
}
