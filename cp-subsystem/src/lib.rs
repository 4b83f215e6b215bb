//! CP subsystem: strongly consistent coordination primitives over Raft.
//!
//! A CP group is an independent Raft instance replicating a small state
//! machine that hosts atomic references, counting semaphores and countdown
//! latches. Every mutation goes through the group's log, so all members apply
//! the same operations in the same order. Sessions tie client endpoints to the
//! resources they hold and make retries of an invocation apply at most once.
//!
//! # Architecture
//!
//! - **Engine**: one [`node::RaftNode`] per group member wraps tikv/raft and
//!   applies committed entries to the [`state_machine::StateMachine`]
//! - **Worker**: one tokio task per group member ([`runtime`]) owns the
//!   engine, proposes requests, answers callers and runs the leader's expiry
//!   timers
//! - **Manager**: [`manager::GroupManager`] routes requests to groups by id
//! - **Transport**: [`transport::Transport`] moves raft messages; the crate
//!   ships an in-process [`transport::LocalNetwork`]
//!
//! Apply is deterministic: time only enters the state machine as the
//! leader's timestamp recorded in each entry.
//!
//! # Modules
//!
//! - [`command`]: operations and payloads replicated through the log
//! - [`session`], [`dedup`]: session registry and invocation cache
//! - [`datastructures`]: the replicated objects
//! - [`query`]: linearizable and local reads
//! - [`error`]: `CpError`, `CommitOutcome` and the outbound `Response`

pub mod cluster;
pub mod command;
pub mod config;
pub mod datastructures;
pub mod dedup;
pub mod error;
pub mod group;
pub mod log_store;
pub mod manager;
pub mod node;
pub mod query;
pub mod runtime;
pub mod session;
pub mod state_machine;
pub mod transport;
