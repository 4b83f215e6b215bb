//! Session lifecycle, deduplication and session-scoped resources.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{CALL_TIMEOUT, Harness, eventually, fast_config, invocation};
use cp_subsystem::command::{
    Invocation, InvocationUid, LatchOp, OpValue, Operation, SemaphoreOp, SessionOp,
};
use cp_subsystem::config::CpConfig;
use cp_subsystem::error::{CommitOutcome, CpError};
use cp_subsystem::query::QueryPolicy;
use tokio::time::timeout;

fn short_lease() -> CpConfig {
    CpConfig {
        session_ttl_ms: 400,
        ..fast_config()
    }
}

async fn available_permits(harness: &Harness, name: &str) -> Result<i64> {
    let value = harness
        .call(Operation::semaphore(name, SemaphoreOp::AvailablePermits))
        .await?;
    Ok(value.as_count().unwrap_or_default())
}

#[tokio::test]
async fn retried_invocation_is_applied_once() -> Result<()> {
    let harness = Harness::start(1, fast_config()).await?;
    let session = harness.open_session("client").await?;
    harness
        .call(Operation::latch("l", LatchOp::TrySetCount { count: 5 }))
        .await?;

    let retried = Invocation::new(session, 1, InvocationUid::random());
    let first = harness
        .execute(retried, Operation::latch("l", LatchOp::CountDown))
        .await?;
    let second = harness
        .execute(retried, Operation::latch("l", LatchOp::CountDown))
        .await?;

    assert_eq!(first, CommitOutcome::Committed(OpValue::Count(4)));
    assert_eq!(first, second);
    assert_eq!(
        harness.call(Operation::latch("l", LatchOp::GetCount)).await?,
        OpValue::Count(4)
    );
    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn closed_session_rejects_further_calls() -> Result<()> {
    let harness = Harness::start(1, fast_config()).await?;
    let session = harness.open_session("client").await?;

    let closed = harness
        .call(Operation::Session(SessionOp::Close { session_id: session }))
        .await?;
    assert_eq!(closed, OpValue::Bool(true));

    let outcome = harness
        .execute(invocation(session, 1), Operation::latch("l", LatchOp::CountDown))
        .await?;
    assert_eq!(
        outcome,
        CommitOutcome::Failed(CpError::SessionExpired { session_id: session })
    );
    assert!(harness.heartbeat(session).await.is_err());
    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn lease_expiry_frees_permits_for_waiters() -> Result<()> {
    let harness = Arc::new(Harness::start(1, short_lease()).await?);
    let holder = harness.open_session("holder").await?;
    let waiter = harness.open_session("waiter").await?;
    harness
        .call(Operation::semaphore("s", SemaphoreOp::Init { permits: 4 }))
        .await?;

    let acquire_all = Operation::semaphore(
        "s",
        SemaphoreOp::Acquire {
            permits: 4,
            timeout_ms: None,
        },
    );
    assert_eq!(
        harness
            .execute(invocation(holder, 1), acquire_all.clone())
            .await?,
        CommitOutcome::Committed(OpValue::Bool(true))
    );

    let blocked = {
        let harness = Arc::clone(&harness);
        tokio::spawn(async move { harness.execute(invocation(waiter, 1), acquire_all).await })
    };

    // Only the waiter keeps its session alive; the holder goes silent.
    timeout(CALL_TIMEOUT, async {
        while !blocked.is_finished() {
            harness.heartbeat(waiter).await?;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await??;
    let outcome = blocked.await??;

    assert_eq!(outcome, CommitOutcome::Committed(OpValue::Bool(true)));
    assert_eq!(available_permits(&harness, "s").await?, 0);
    assert!(harness.heartbeat(holder).await.is_err());
    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn departed_endpoint_loses_its_sessions() -> Result<()> {
    let harness = Harness::start(1, fast_config()).await?;
    let session = harness.open_session("10.0.0.7:5701").await?;
    harness
        .call(Operation::semaphore("s", SemaphoreOp::Init { permits: 2 }))
        .await?;
    harness
        .execute(
            invocation(session, 1),
            Operation::semaphore(
                "s",
                SemaphoreOp::Acquire {
                    permits: 2,
                    timeout_ms: None,
                },
            ),
        )
        .await?;
    assert_eq!(available_permits(&harness, "s").await?, 0);

    let leader = harness.leader().await?;
    harness
        .cluster
        .manager(leader)?
        .on_endpoint_disconnected("10.0.0.7:5701")
        .await;

    let harness_ref = &harness;
    eventually(CALL_TIMEOUT, move || async move {
        Ok::<_, anyhow::Error>(available_permits(harness_ref, "s").await? == 2)
    })
    .await?;
    let status = harness.cluster.manager(leader)?.group_status(&harness.group).await?;
    assert_eq!(status.sessions, 0);
    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn departure_reported_to_a_follower_reaches_the_leader() -> Result<()> {
    let harness = Harness::start(3, fast_config()).await?;
    let endpoint = "10.0.0.9:5701";
    let session = harness.open_session(endpoint).await?;
    harness
        .call(Operation::semaphore("s", SemaphoreOp::Init { permits: 2 }))
        .await?;
    let acquired = harness
        .execute(
            invocation(session, 1),
            Operation::semaphore(
                "s",
                SemaphoreOp::Acquire {
                    permits: 2,
                    timeout_ms: None,
                },
            ),
        )
        .await?;
    assert_eq!(acquired, CommitOutcome::Committed(OpValue::Bool(true)));

    let leader = harness.leader().await?;
    let follower = harness
        .cluster
        .members()
        .into_iter()
        .find(|&member| member != leader)
        .expect("three members");
    let follower_manager = harness.cluster.manager(follower)?;
    let leader_manager = harness.cluster.manager(leader)?;
    let group = &harness.group;

    // The follower has to know the session and the leader before it can
    // hand the closure over.
    let target = leader_manager.group_status(group).await?.commit_index;
    eventually(CALL_TIMEOUT, move || async move {
        let status = follower_manager.group_status(group).await?;
        Ok::<_, anyhow::Error>(status.applied_index >= target && status.leader == Some(leader))
    })
    .await?;

    follower_manager.on_endpoint_disconnected(endpoint).await;

    let harness_ref = &harness;
    eventually(CALL_TIMEOUT, move || async move {
        Ok::<_, anyhow::Error>(available_permits(harness_ref, "s").await? == 2)
    })
    .await?;
    let status = leader_manager.group_status(group).await?;
    assert_eq!(status.sessions, 0);
    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn thread_ids_are_unique_within_a_group() -> Result<()> {
    let harness = Harness::start(1, fast_config()).await?;
    let first = harness
        .call(Operation::Session(SessionOp::GenerateThreadId))
        .await?;
    let second = harness
        .call(Operation::Session(SessionOp::GenerateThreadId))
        .await?;
    assert_ne!(first, second);

    let local = harness
        .cluster
        .query(
            &harness.group,
            harness.leader().await?,
            Operation::latch("never-created", LatchOp::GetCount),
            QueryPolicy::Local,
        )
        .await?;
    assert_eq!(local, CommitOutcome::Committed(OpValue::Count(0)));
    harness.shutdown().await;
    Ok(())
}
