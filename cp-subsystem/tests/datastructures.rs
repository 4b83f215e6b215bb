//! Semantics of the replicated objects, exercised through a single-member
//! group so that every call commits immediately.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{CALL_TIMEOUT, Harness, fast_config, invocation};
use cp_subsystem::command::{
    AtomicRefOp, Invocation, InvocationUid, LatchOp, ObjectKind, OpValue, Operation, SemaphoreOp,
};
use cp_subsystem::error::{CommitOutcome, CpError};
use tokio::time::timeout;

fn bytes(s: &str) -> Option<Vec<u8>> {
    Some(s.as_bytes().to_vec())
}

#[tokio::test]
async fn atomic_reference_compare_and_set() -> Result<()> {
    let harness = Harness::start(1, fast_config()).await?;

    harness
        .call(Operation::atomic_ref("ref", AtomicRefOp::Set { value: bytes("a") }))
        .await?;
    let swapped = harness
        .call(Operation::atomic_ref(
            "ref",
            AtomicRefOp::CompareAndSet {
                expected: bytes("a"),
                new: bytes("b"),
            },
        ))
        .await?;
    let stale = harness
        .call(Operation::atomic_ref(
            "ref",
            AtomicRefOp::CompareAndSet {
                expected: bytes("a"),
                new: bytes("c"),
            },
        ))
        .await?;

    assert_eq!(swapped, OpValue::Bool(true));
    assert_eq!(stale, OpValue::Bool(false));
    assert_eq!(
        harness.call(Operation::atomic_ref("ref", AtomicRefOp::Get)).await?,
        OpValue::Value(bytes("b"))
    );

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn acquire_waits_for_enough_permits() -> Result<()> {
    let harness = Arc::new(Harness::start(1, fast_config()).await?);
    let session = harness.open_session("client").await?;
    let acquire = |permits| {
        Operation::semaphore(
            "s",
            SemaphoreOp::Acquire {
                permits,
                timeout_ms: None,
            },
        )
    };
    harness
        .call(Operation::semaphore("s", SemaphoreOp::Init { permits: 2 }))
        .await?;
    let held = harness.execute(invocation(session, 2), acquire(2)).await?;
    assert_eq!(held, CommitOutcome::Committed(OpValue::Bool(true)));

    let waiter = {
        let harness = Arc::clone(&harness);
        let operation = acquire(2);
        tokio::spawn(async move { harness.execute(invocation(session, 1), operation).await })
    };

    // The acquire is parked behind the holder.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());
    assert_eq!(
        harness
            .call(Operation::semaphore("s", SemaphoreOp::AvailablePermits))
            .await?,
        OpValue::Count(0)
    );

    // Nobody gave those permits out, so they cannot come back.
    let anonymous = harness
        .execute(
            Invocation::sessionless(),
            Operation::semaphore("s", SemaphoreOp::Release { permits: 1 }),
        )
        .await?;
    assert!(matches!(
        anonymous,
        CommitOutcome::Failed(CpError::IllegalStateTransition { .. })
    ));

    let released = harness
        .execute(
            invocation(session, 2),
            Operation::semaphore("s", SemaphoreOp::Release { permits: 2 }),
        )
        .await?;
    assert_eq!(released, CommitOutcome::Committed(OpValue::Unit));

    let outcome = timeout(CALL_TIMEOUT, waiter).await???;
    assert_eq!(outcome, CommitOutcome::Committed(OpValue::Bool(true)));
    assert_eq!(
        harness
            .call(Operation::semaphore("s", SemaphoreOp::AvailablePermits))
            .await?,
        OpValue::Count(0)
    );

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn acquire_times_out_with_false() -> Result<()> {
    let harness = Harness::start(1, fast_config()).await?;
    let session = harness.open_session("client").await?;
    harness
        .call(Operation::semaphore("s", SemaphoreOp::Init { permits: 0 }))
        .await?;

    let outcome = harness
        .execute(
            invocation(session, 1),
            Operation::semaphore(
                "s",
                SemaphoreOp::Acquire {
                    permits: 1,
                    timeout_ms: Some(100),
                },
            ),
        )
        .await?;

    assert_eq!(outcome, CommitOutcome::Committed(OpValue::Bool(false)));
    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn release_without_holding_fails_definitely() -> Result<()> {
    let harness = Harness::start(1, fast_config()).await?;
    let session = harness.open_session("client").await?;
    harness
        .call(Operation::semaphore("s", SemaphoreOp::Init { permits: 1 }))
        .await?;

    let outcome = harness
        .execute(
            invocation(session, 1),
            Operation::semaphore("s", SemaphoreOp::Release { permits: 1 }),
        )
        .await?;

    match outcome {
        CommitOutcome::Failed(err @ CpError::IllegalStateTransition { .. }) => {
            assert!(!err.is_retryable());
        }
        other => panic!("expected IllegalStateTransition, got {other:?}"),
    }
    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn latch_releases_awaiters_when_count_reaches_zero() -> Result<()> {
    let harness = Arc::new(Harness::start(1, fast_config()).await?);
    assert_eq!(
        harness
            .call(Operation::latch("gate", LatchOp::TrySetCount { count: 3 }))
            .await?,
        OpValue::Bool(true)
    );

    let mut awaiters = Vec::new();
    for _ in 0..2 {
        let harness = Arc::clone(&harness);
        awaiters.push(tokio::spawn(async move {
            harness
                .execute(
                    Invocation::with_uid(InvocationUid::random()),
                    Operation::latch("gate", LatchOp::Await { timeout_ms: None }),
                )
                .await
        }));
    }

    for expected in [2, 1] {
        let remaining = harness.call(Operation::latch("gate", LatchOp::CountDown)).await?;
        assert_eq!(remaining, OpValue::Count(expected));
    }
    // A reset attempt mid-round fails and leaves the count alone.
    let reset = harness
        .execute(
            Invocation::sessionless(),
            Operation::latch("gate", LatchOp::TrySetCount { count: 5 }),
        )
        .await?;
    assert!(matches!(
        reset,
        CommitOutcome::Failed(CpError::IllegalStateTransition { .. })
    ));
    assert_eq!(
        harness.call(Operation::latch("gate", LatchOp::GetCount)).await?,
        OpValue::Count(1)
    );

    harness.call(Operation::latch("gate", LatchOp::CountDown)).await?;
    for awaiter in awaiters {
        let outcome = timeout(CALL_TIMEOUT, awaiter).await???;
        assert_eq!(outcome, CommitOutcome::Committed(OpValue::Bool(true)));
    }
    assert_eq!(
        harness.call(Operation::latch("gate", LatchOp::GetRound)).await?,
        OpValue::Count(1)
    );

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn destroying_a_semaphore_fails_its_waiters() -> Result<()> {
    let harness = Arc::new(Harness::start(1, fast_config()).await?);
    let session = harness.open_session("client").await?;

    let waiter = {
        let harness = Arc::clone(&harness);
        tokio::spawn(async move {
            harness
                .execute(
                    invocation(session, 1),
                    Operation::semaphore(
                        "doomed",
                        SemaphoreOp::Acquire {
                            permits: 1,
                            timeout_ms: None,
                        },
                    ),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let destroyed = harness
        .call(Operation::Destroy {
            kind: ObjectKind::Semaphore,
            name: "doomed".into(),
        })
        .await?;
    assert_eq!(destroyed, OpValue::Bool(true));

    let outcome = timeout(CALL_TIMEOUT, waiter).await???;
    assert_eq!(
        outcome,
        CommitOutcome::Failed(CpError::ObjectDestroyed {
            name: "doomed".into()
        })
    );
    harness.shutdown().await;
    Ok(())
}
