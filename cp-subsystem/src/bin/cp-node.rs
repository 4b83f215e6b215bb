use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueHint};
use tracing::{info, warn};

use cp_subsystem::cluster::LocalCluster;
use cp_subsystem::command::{
    AtomicRefOp, Invocation, InvocationUid, LatchOp, OpValue, Operation, SemaphoreOp, SessionOp,
};
use cp_subsystem::config::CpConfig;
use cp_subsystem::error::{CommitOutcome, Response};
use cp_subsystem::group::ConsensusGroupId;
use cp_subsystem::query::QueryPolicy;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about = "Run an in-process CP group and exercise its data structures")]
struct Args {
    /// Member ids of the group.
    #[arg(long, value_delimiter = ',', default_value = "1,2,3")]
    members: Vec<u64>,

    /// JSON file with `CpConfig` overrides.
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    #[arg(long, default_value = cp_subsystem::group::DEFAULT_GROUP_NAME)]
    group: String,

    /// Cut the leader off after the first round and repeat on the new leader.
    #[arg(long)]
    failover: bool,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn print_outcome(label: &str, outcome: CommitOutcome) -> Result<()> {
    let response = Response::from(outcome);
    println!("{label:<28} {}", serde_json::to_string(&response)?);
    Ok(())
}

async fn open_session(
    cluster: &LocalCluster,
    group: &ConsensusGroupId,
    endpoint: &str,
) -> Result<u64> {
    let outcome = cluster
        .execute(
            group,
            Invocation::sessionless(),
            Operation::Session(SessionOp::Create {
                endpoint: endpoint.to_string(),
            }),
            CALL_TIMEOUT,
        )
        .await?;
    match outcome.into_result()? {
        OpValue::Session(grant) => Ok(grant.session_id),
        other => bail!("unexpected session grant {other:?}"),
    }
}

async fn exercise(cluster: &LocalCluster, group: &ConsensusGroupId, round: u32) -> Result<()> {
    let session = open_session(cluster, group, &format!("demo-client-{round}")).await?;
    info!(%group, session, round, "opened session");
    let call = move |operation: Operation| {
        cluster.execute(
            group,
            Invocation::new(session, 1, InvocationUid::random()),
            operation,
            CALL_TIMEOUT,
        )
    };

    let value = format!("round-{round}").into_bytes();
    print_outcome(
        "atomic-ref.set",
        call(Operation::atomic_ref("demo-ref", AtomicRefOp::Set { value: Some(value) })).await?,
    )?;
    print_outcome(
        "semaphore.init(2)",
        call(Operation::semaphore("demo-permits", SemaphoreOp::Init { permits: 2 })).await?,
    )?;
    print_outcome(
        "semaphore.acquire(1)",
        call(Operation::semaphore(
            "demo-permits",
            SemaphoreOp::Acquire {
                permits: 1,
                timeout_ms: Some(0),
            },
        ))
        .await?,
    )?;
    print_outcome(
        "latch.try-set-count(1)",
        call(Operation::latch("demo-latch", LatchOp::TrySetCount { count: 1 })).await?,
    )?;
    print_outcome(
        "latch.count-down",
        call(Operation::latch("demo-latch", LatchOp::CountDown)).await?,
    )?;

    let leader = cluster.wait_for_leader(group, CALL_TIMEOUT).await?;
    print_outcome(
        "atomic-ref.get",
        cluster
            .query(
                group,
                leader,
                Operation::atomic_ref("demo-ref", AtomicRefOp::Get),
                QueryPolicy::Linearizable,
            )
            .await?,
    )?;
    print_outcome(
        "session.close",
        call(Operation::Session(SessionOp::Close { session_id: session })).await?,
    )?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => CpConfig::load(path)?,
        None => CpConfig {
            tick_interval_ms: 20,
            ..CpConfig::default()
        },
    };

    let cluster = LocalCluster::start(&args.members, config).context("failed to start members")?;
    let group = ConsensusGroupId::new(args.group, 0);
    cluster.create_group(&group).await?;
    let leader = cluster.wait_for_leader(&group, CALL_TIMEOUT).await?;
    info!(%group, leader, "group is ready");

    exercise(&cluster, &group, 1).await?;

    if args.failover {
        if cluster.members().len() < 3 {
            warn!("failover needs at least three members, skipping");
        } else {
            info!(%group, leader, "isolating leader");
            cluster.network().isolate(leader);
            let survivors: Vec<u64> = cluster
                .members()
                .into_iter()
                .filter(|&m| m != leader)
                .collect();
            let new_leader = cluster
                .wait_for_leader_among(&group, &survivors, CALL_TIMEOUT)
                .await?;
            info!(%group, leader = new_leader, "new leader elected");
            cluster.network().heal();
            exercise(&cluster, &group, 2).await?;
        }
    }

    cluster.shutdown().await;
    Ok(())
}
