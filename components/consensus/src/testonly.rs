//! Test harnesses for the consensus engine.

use std::sync::{Arc, Mutex, PoisonError};

use onesided_transport::{testonly::Fabric, ReplicaId};
use zksync_concurrency::{ctx, sync, time};

use crate::{CommitHandler, Config, Consensus, ConsensusRunner, ProposeError};

/// Shared-memory region size used by test clusters.
pub const TEST_REGION: usize = 1 << 20;

/// Records every committed payload together with the role the replica had
/// at delivery time.
#[derive(Debug, Default)]
pub struct CommitLog(Mutex<Vec<(bool, Vec<u8>)>>);

impl CommitLog {
    /// Everything committed so far, in delivery order.
    pub fn entries(&self) -> Vec<(bool, Vec<u8>)> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Just the payloads, in delivery order.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.entries().into_iter().map(|(_, p)| p).collect()
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl CommitHandler for CommitLog {
    fn commit(&self, is_leader: bool, payload: &[u8]) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((is_leader, payload.to_vec()));
    }
}

/// One engine of a test cluster, with its recorded commits.
#[derive(Debug)]
pub struct TestReplica {
    /// The engine handle.
    pub consensus: Arc<Consensus>,
    /// Commits observed by this replica.
    pub commits: Arc<CommitLog>,
}

/// Builds a fully-meshed cluster over the in-process fabric. Runners must
/// be spawned by the caller (typically with `s.spawn_bg(runner.run(ctx))`).
pub fn cluster(
    raw_ids: &[u16],
    region_size: usize,
) -> anyhow::Result<(Vec<TestReplica>, Vec<ConsensusRunner>)> {
    cluster_opts(raw_ids, region_size, |_| {})
}

/// Like [`cluster`], with a configuration tweak applied to every replica.
pub fn cluster_opts(
    raw_ids: &[u16],
    region_size: usize,
    tweak: impl Fn(&mut Config),
) -> anyhow::Result<(Vec<TestReplica>, Vec<ConsensusRunner>)> {
    let ids: Vec<_> = raw_ids.iter().copied().map(ReplicaId).collect();
    let mut planes = Fabric::full_mesh(region_size, &ids)?;
    let mut replicas = Vec::new();
    let mut runners = Vec::new();
    for id in &ids {
        let mut cfg = Config {
            my_id: *id,
            peers: ids.iter().copied().filter(|p| p != id).collect(),
            outstanding: 1,
            max_payload_size: 1024,
            use_sideband: false,
        };
        tweak(&mut cfg);
        let commits = Arc::new(CommitLog::default());
        let (consensus, runner) = Consensus::new(
            cfg,
            planes.remove(id).expect("fabric covers every id"),
            commits.clone(),
        )?;
        replicas.push(TestReplica { consensus, commits });
        runners.push(runner);
    }
    Ok((replicas, runners))
}

/// Waits until the replica reports itself leader.
pub async fn wait_until_leader(ctx: &ctx::Ctx, replica: &TestReplica) -> ctx::OrCanceled<()> {
    let mut watch = replica.consensus.leader_subscribe();
    sync::wait_for(ctx, &mut watch, |leader| *leader).await?;
    Ok(())
}

/// Proposes `payload`, retrying the retriable outcomes (lock contention,
/// slow-path hiccups, recycling) until the engine accepts it.
pub async fn propose_until_ok(
    ctx: &ctx::Ctx,
    replica: &TestReplica,
    payload: &[u8],
) -> Result<(), ProposeError> {
    loop {
        match replica.consensus.propose(ctx, payload).await {
            Ok(()) => return Ok(()),
            Err(
                ProposeError::MutexUnavailable { .. }
                | ProposeError::FastPath
                | ProposeError::FastPathRecyclingTriggered
                | ProposeError::SlowPathCatchFuo
                | ProposeError::SlowPathUpdateFollowers
                | ProposeError::SlowPathCatchProposal
                | ProposeError::SlowPathUpdateProposal
                | ProposeError::SlowPathReadRemoteLogs
                | ProposeError::SlowPathWriteAdoptedValue
                | ProposeError::SlowPathWriteNewValue
                | ProposeError::SlowPathLogRecycled,
            ) => {
                ctx.sleep(time::Duration::milliseconds(1)).await?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Polls `pred` until it holds.
pub async fn wait_until(ctx: &ctx::Ctx, pred: impl Fn() -> bool) -> ctx::OrCanceled<()> {
    while !pred() {
        ctx.sleep(time::Duration::milliseconds(1)).await?;
    }
    Ok(())
}
