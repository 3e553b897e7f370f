use std::sync::Arc;

use onesided_log::{BlockingIterator, LiveIterator, Log, Parsed, Slot};
use onesided_replication::{
    CatchUp, CatchUpError, MajorityError, MajorityOp, Recycling, SlotReader,
};
use onesided_transport::{Connection, Kind, KindRouter, Planes, ReplicaId, Scratchpad};
use zksync_concurrency::{
    ctx,
    metrics::LatencyHistogramExt as _,
    scope, sync,
};

use crate::{
    config::Config,
    follower::Follower,
    heartbeat::LeaderHeartbeat,
    metrics::METRICS,
    permission::PermissionAsker,
    switcher::{Applier, Scanner},
    token::LeaderToken,
    CommitHandler,
};

/// Application-visible propose outcomes other than success. Never a fatal
/// abort: internal state has been rolled back before any of these is
/// returned, so callers can always retry (after redirecting to the
/// reported leader for `FollowerMode`, or backing off for
/// `MutexUnavailable` and `SlowPathLogRecycled`).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProposeError {
    /// The surrounding context was canceled.
    #[error(transparent)]
    Canceled(#[from] ctx::Canceled),
    /// Empty payloads are not accepted.
    #[error("empty payload")]
    EmptyPayload,
    /// The payload exceeds the configured maximum.
    #[error("payload of {len} bytes exceeds the maximum of {max}")]
    PayloadTooLarge {
        /// Size of the rejected payload.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The optimistic majority write failed; the engine has re-armed
    /// itself and the next propose takes the slow path.
    #[error("fast-path majority write failed")]
    FastPath,
    /// The log is nearly full; retry after backing off while the next
    /// slow-path propose recycles it.
    #[error("log space critical, recycling required")]
    FastPathRecyclingTriggered,
    /// Reading the remote first-undecided-offsets failed.
    #[error("slow path: catching up the first-undecided-offset failed")]
    SlowPathCatchFuo,
    /// Pushing the adopted first-undecided-offset to the followers failed.
    #[error("slow path: updating the followers failed")]
    SlowPathUpdateFollowers,
    /// Establishing a fresh proposal number failed.
    #[error("slow path: catching up the proposal number failed")]
    SlowPathCatchProposal,
    /// Publishing the established proposal number failed.
    #[error("slow path: updating the proposal number failed")]
    SlowPathUpdateProposal,
    /// Reading the remote logs at the first undecided slot failed.
    #[error("slow path: reading the remote logs failed")]
    SlowPathReadRemoteLogs,
    /// Majority-writing an adopted value failed.
    #[error("slow path: writing the adopted value failed")]
    SlowPathWriteAdoptedValue,
    /// Majority-writing the proposed value failed.
    #[error("slow path: writing the new value failed")]
    SlowPathWriteNewValue,
    /// The log was recycled instead of accepting the value; cursors and
    /// proposal state were re-derived, retry the propose.
    #[error("log was recycled, retry the propose")]
    SlowPathLogRecycled,
    /// The proposer lock is held by the follower loop; retry immediately.
    #[error("proposer lock unavailable")]
    MutexUnavailable {
        /// The leader this replica currently believes in.
        potential_leader: Option<ReplicaId>,
    },
    /// This replica is not the leader.
    #[error("not the leader")]
    FollowerMode {
        /// The leader this replica currently believes in.
        potential_leader: Option<ReplicaId>,
    },
}

/// State shared between the proposer and the follower loop, guarded by
/// one lock: the log, both traversal cursors, the replication machinery
/// and the propose state machine flags.
#[derive(Debug)]
pub(crate) struct Core {
    pub(crate) log: Log,
    pub(crate) accept_iter: BlockingIterator,
    pub(crate) commit_iter: LiveIterator,
    pub(crate) majw: MajorityOp,
    pub(crate) reader: SlotReader,
    pub(crate) catchup: CatchUp,
    pub(crate) recycling: Recycling,
    pub(crate) fast_path: bool,
    pub(crate) became_leader: bool,
    pub(crate) proposal_nr: u64,
}

impl Core {
    /// Re-creates both cursors at the current first-undecided-offset.
    pub(crate) fn rebuild_cursors(&mut self) {
        self.accept_iter = self.log.blocking_iterator();
        self.commit_iter = self.log.live_iterator();
    }

    /// One follower pass: sample replicated slots, advance the
    /// first-undecided-offset from their snapshots, deliver decided
    /// entries, apply a recycle request if one arrived.
    pub(crate) fn follower_step(&mut self, is_leader: bool, commit: &dyn CommitHandler) {
        let mut pending_recycle = false;
        let mut max_snapshot = self.log.header_first_undecided_offset();
        while let Some((offset, slot)) = self.accept_iter.sample_next() {
            if offset != 0 && slot.is_recycle_request() {
                // Everything below the request is decided; deliver it
                // before wiping the log.
                max_snapshot = max_snapshot.max(offset);
                pending_recycle = true;
                break;
            }
            max_snapshot = max_snapshot.max(slot.fuo_snapshot);
        }
        if max_snapshot > self.log.header_first_undecided_offset() {
            self.log.update_header_first_undecided_offset(max_snapshot);
        }
        let fuo = self.log.header_first_undecided_offset();
        while self.commit_iter.has_next(fuo) {
            let Some((_, slot)) = self.commit_iter.next() else {
                break;
            };
            commit.commit(is_leader, &slot.payload);
        }
        if pending_recycle {
            tracing::info!("applying a log recycle request");
            self.log.reset_fuo();
            self.log.bzero();
            self.rebuild_cursors();
        }
    }
}

/// The consensus engine handle. Created together with a
/// [`ConsensusRunner`] that drives the background loops; `propose` may be
/// called concurrently with the runner from any task.
#[derive(Debug)]
pub struct Consensus {
    cfg: Config,
    pub(crate) core: Arc<sync::Mutex<Core>>,
    token: Arc<LeaderToken>,
    is_leader: Arc<sync::watch::Sender<bool>>,
    paused: sync::watch::Sender<bool>,
    response_blocked: Arc<sync::watch::Sender<bool>>,
    hard_reset: Arc<sync::watch::Sender<bool>>,
    range: sync::watch::Sender<(u64, u64)>,
    commit: Arc<dyn CommitHandler>,
    sideband: Option<Arc<dyn Connection>>,
}

impl Consensus {
    /// Constructs the engine over the given planes. Returns the shared
    /// handle and the runner that must be spawned for the engine to make
    /// progress.
    pub fn new(
        cfg: Config,
        planes: Planes,
        commit: Arc<dyn CommitHandler>,
    ) -> anyhow::Result<(Arc<Self>, ConsensusRunner)> {
        cfg.validate()?;
        anyhow::ensure!(
            planes.replication.me == cfg.my_id && planes.background.me == cfg.my_id,
            "planes belong to a different replica"
        );
        let mut all = cfg.peers.clone();
        all.push(cfg.my_id);
        all.sort_unstable();

        let scratch = Arc::new(Scratchpad::new(planes.memory.clone(), &all)?);
        let log = Log::new(
            planes.memory.clone(),
            scratch.log_offset(),
            planes.memory.len() - scratch.log_offset(),
        )?;
        let core = Core {
            accept_iter: log.blocking_iterator(),
            commit_iter: log.live_iterator(),
            majw: MajorityOp::new(&planes.replication, Kind::EntryWrite, 1)?,
            reader: SlotReader::new(&planes.replication, scratch.clone(), log.clone())?,
            catchup: CatchUp::new(&planes.replication, scratch.clone(), log.clone())?,
            recycling: Recycling::new(&planes.replication, scratch.clone(), log.clone())?,
            log,
            fast_path: false,
            became_leader: false,
            proposal_nr: 0,
        };
        let core = Arc::new(sync::Mutex::new(core));

        let token = Arc::new(LeaderToken::new());
        let router = KindRouter::new(planes.background.cq.clone());
        let (asker, req_nr) = PermissionAsker::new(&planes.background, scratch.clone(), &router)?;

        let is_leader = Arc::new(sync::watch::channel(false).0);
        let want_leader = Arc::new(sync::watch::channel(false).0);
        let blocked = Arc::new(sync::watch::channel(false).0);
        let response_blocked = Arc::new(sync::watch::channel(false).0);
        let hard_reset = Arc::new(sync::watch::channel(false).0);
        let paused = sync::watch::channel(false).0;

        let heartbeat = LeaderHeartbeat::new(
            &planes.background,
            scratch.clone(),
            &router,
            want_leader.clone(),
            paused.subscribe(),
            response_blocked.clone(),
        )?;
        let scanner = Scanner::new(
            cfg.my_id,
            all,
            scratch.clone(),
            token.clone(),
            want_leader,
            req_nr,
        );
        let applier = Applier::new(
            cfg.my_id,
            token.clone(),
            asker,
            planes.replication.clone(),
            is_leader.clone(),
            blocked.clone(),
            hard_reset.clone(),
        );
        let follower = Follower::new(
            core.clone(),
            blocked.subscribe(),
            is_leader.subscribe(),
            commit.clone(),
        );

        let sideband = if cfg.use_sideband {
            anyhow::ensure!(
                planes.sideband.is_some(),
                "sideband requested but the transport provides none"
            );
            planes.sideband
        } else {
            None
        };

        let this = Arc::new(Self {
            cfg,
            core,
            token,
            is_leader,
            paused,
            response_blocked,
            hard_reset,
            range: sync::watch::channel((0, 0)).0,
            commit,
            sideband,
        });
        let runner = ConsensusRunner {
            heartbeat,
            scanner,
            applier,
            follower,
        };
        Ok((this, runner))
    }

    /// Submits a payload for replication. On `Ok`, the payload (or, on the
    /// first slow-path round after a leader change, a recovered value from
    /// the previous leader) has been decided and delivered to the commit
    /// handler.
    pub async fn propose(&self, ctx: &ctx::Ctx, payload: &[u8]) -> Result<(), ProposeError> {
        if payload.is_empty() {
            return Err(ProposeError::EmptyPayload);
        }
        if payload.len() > self.cfg.max_payload_size {
            return Err(ProposeError::PayloadTooLarge {
                len: payload.len(),
                max: self.cfg.max_payload_size,
            });
        }
        // Never block on the lock: the follower loop shares it, and
        // waiting here would let its servicing inflate tail latency.
        let Ok(mut core) = self.core.try_lock() else {
            return Err(ProposeError::MutexUnavailable {
                potential_leader: self.potential_leader(),
            });
        };
        let started = ctx.now();

        if !*self.is_leader.borrow() {
            tracing::trace!("rejecting the proposal, this replica is a follower");
            core.became_leader = true;
            core.fast_path = false;
            return Err(ProposeError::FollowerMode {
                potential_leader: self.potential_leader(),
            });
        }
        if core.became_leader {
            tracing::debug!("first proposal after accession, rebuilding the log cursors");
            core.became_leader = false;
            core.fast_path = false;
            core.accept_iter.reattach();
        }

        let token = self.token.clone();
        let me = self.cfg.my_id;
        let intact = move || token.load().requester() == me;

        let res = if core.fast_path {
            self.fast_propose(ctx, &mut core, payload, &intact).await
        } else {
            self.slow_propose(ctx, &mut core, payload, &intact).await
        };
        match &res {
            Ok(()) => METRICS.propose_latency.observe_latency(ctx.now() - started),
            Err(ProposeError::FastPath | ProposeError::FastPathRecyclingTriggered) => {
                core.fast_path = false;
            }
            Err(_) => {}
        }
        res
    }

    async fn fast_propose(
        &self,
        ctx: &ctx::Ctx,
        core: &mut Core,
        payload: &[u8],
        intact: &(dyn Fn() -> bool + Sync),
    ) -> Result<(), ProposeError> {
        if core.log.space_left_critical() {
            tracing::debug!("log space critical, recycling required before further appends");
            return Err(ProposeError::FastPathRecyclingTriggered);
        }
        let fuo = core.log.header_first_undecided_offset();
        let loc = core.log.append(core.proposal_nr, fuo, payload);
        let ok = core
            .majw
            .fast_write(
                ctx,
                loc.region_offset,
                loc.size as usize,
                loc.region_offset,
                self.cfg.outstanding,
                self.sideband.as_ref(),
                intact,
            )
            .await;
        if !ok {
            if !ctx.is_active() {
                return Err(ctx::Canceled.into());
            }
            tracing::debug!("fast-path majority write failed, recovering");
            let err = core.majw.fast_write_error();
            core.majw.recover(&err);
            return Err(ProposeError::FastPath);
        }
        self.range.send_replace(core.majw.range());
        self.finish_write(core, loc.offset, loc.size);
        METRICS.fast_path_proposes.inc();
        Ok(())
    }

    async fn slow_propose(
        &self,
        ctx: &ctx::Ctx,
        core: &mut Core,
        payload: &[u8],
        intact: &(dyn Fn() -> bool + Sync),
    ) -> Result<(), ProposeError> {
        METRICS.slow_path_proposes.inc();

        // Reconcile the cluster state before touching the log.
        if let Err(err) = core.catchup.catch_fuo(ctx, intact).await {
            return Err(catchup_error(core, err, ProposeError::SlowPathCatchFuo));
        }
        if let Err(err) = core.catchup.update_followers(ctx, intact).await {
            return Err(catchup_error(
                core,
                err,
                ProposeError::SlowPathUpdateFollowers,
            ));
        }
        loop {
            match core.catchup.catch_proposal(ctx, intact).await {
                Ok(()) => break,
                Err(CatchUpError::Retry) => continue,
                Err(CatchUpError::Majority(err)) => {
                    return Err(catchup_error(core, err, ProposeError::SlowPathCatchProposal));
                }
            }
        }
        if let Err(err) = core.catchup.update_with_current_proposal(ctx, intact).await {
            return Err(catchup_error(
                core,
                err,
                ProposeError::SlowPathUpdateProposal,
            ));
        }
        core.proposal_nr = core.catchup.proposal();
        tracing::debug!("established proposal number {}", core.proposal_nr);

        // Look for a value an earlier leader may have left at the first
        // undecided slot, locally or on a majority of peers.
        let local_fuo = core.log.header_first_undecided_offset();
        let remote = match core.reader.read_slot_at(ctx, local_fuo, intact).await {
            Ok(found) => found,
            Err(err) => {
                if let MajorityError::Canceled(canceled) = err {
                    return Err(canceled.into());
                }
                core.reader.recover(&err);
                return Err(ProposeError::SlowPathReadRemoteLogs);
            }
        };
        let mut freshest: Option<Slot> = match core.log.parse_at(local_fuo) {
            Parsed::Slot(slot) => Some(slot),
            Parsed::Empty | Parsed::Truncated { .. } => None,
        };
        for (pid, slot) in remote {
            tracing::trace!(
                "replica {pid} holds a slot at offset {local_fuo} with proposal {}",
                slot.proposal
            );
            if freshest.as_ref().map_or(true, |f| f.proposal < slot.proposal) {
                freshest = Some(slot);
            }
        }

        if let Some(fresh) = freshest {
            tracing::debug!("adopting the freshest value at offset {local_fuo}");
            let size = core.log.adopt(local_fuo, &fresh, core.proposal_nr);
            if let Err(err) = core
                .majw
                .write(
                    ctx,
                    core.log.region_offset(local_fuo),
                    size as usize,
                    core.log.region_offset(local_fuo),
                    intact,
                )
                .await
            {
                return Err(majw_error(core, err, ProposeError::SlowPathWriteAdoptedValue));
            }
            self.finish_write(core, local_fuo, size);
            core.fast_path = true;
            Ok(())
        } else {
            core.fast_path = true;
            if core.log.space_left_critical() {
                return self.recycle(ctx, core, intact).await;
            }
            tracing::debug!("proposing the new value in the slow path");
            let loc = core.log.append(core.proposal_nr, local_fuo, payload);
            if let Err(err) = core
                .majw
                .write(
                    ctx,
                    loc.region_offset,
                    loc.size as usize,
                    loc.region_offset,
                    intact,
                )
                .await
            {
                core.fast_path = false;
                return Err(majw_error(core, err, ProposeError::SlowPathWriteNewValue));
            }
            self.finish_write(core, loc.offset, loc.size);
            Ok(())
        }
    }

    /// Recycles the log: majority-writes a recycle request, resets the
    /// local log, waits for every peer to follow, and reports
    /// `SlowPathLogRecycled` so the caller re-proposes on the fresh log.
    async fn recycle(
        &self,
        ctx: &ctx::Ctx,
        core: &mut Core,
        intact: &(dyn Fn() -> bool + Sync),
    ) -> Result<(), ProposeError> {
        let local_fuo = core.log.header_first_undecided_offset();
        tracing::info!("log space critical at offset {local_fuo}, recycling");
        let request = core.recycling.request(core.proposal_nr, local_fuo);
        let loc = core
            .log
            .append(request.proposal, request.fuo_snapshot, &request.payload);
        if let Err(err) = core
            .majw
            .write(
                ctx,
                loc.region_offset,
                loc.size as usize,
                loc.region_offset,
                intact,
            )
            .await
        {
            core.fast_path = false;
            return Err(majw_error(core, err, ProposeError::SlowPathWriteNewValue));
        }
        core.log.reset_fuo();
        core.rebuild_cursors();
        if let Err(err) = core.recycling.wait_for_replies(ctx, intact).await {
            if let MajorityError::Canceled(canceled) = err {
                return Err(canceled.into());
            }
            tracing::warn!("waiting for recycle acknowledgements failed: {err}");
        }
        core.log.bzero();
        METRICS.log_recycles.inc();
        METRICS.first_undecided_offset.set(0);
        Err(ProposeError::SlowPathLogRecycled)
    }

    /// Advances the first-undecided-offset past a majority-written slot
    /// and delivers every newly decided entry, in offset order.
    fn finish_write(&self, core: &mut Core, offset: u64, size: u64) {
        let fuo = offset + size;
        core.log.update_header_first_undecided_offset(fuo);
        METRICS.first_undecided_offset.set(fuo);
        core.reader.adjust(size);
        if core.accept_iter.sample_next().is_some() {
            while core.commit_iter.has_next(fuo) {
                let Some((_, slot)) = core.commit_iter.next() else {
                    break;
                };
                self.commit.commit(true, &slot.payload);
            }
        }
    }

    /// The replica this one currently believes to be the leader.
    pub fn potential_leader(&self) -> Option<ReplicaId> {
        let leader = self.token.load().requester();
        (leader != ReplicaId(0)).then_some(leader)
    }

    /// Whether this replica currently holds write authority.
    pub fn is_leader(&self) -> bool {
        *self.is_leader.borrow()
    }

    /// A watch on leadership changes of this replica.
    pub fn leader_subscribe(&self) -> sync::watch::Receiver<bool> {
        self.is_leader.subscribe()
    }

    /// Whether heartbeat responses are currently blocked by the pause
    /// signal.
    pub fn blocked_response(&self) -> bool {
        *self.response_blocked.borrow()
    }

    /// Pauses or resumes the heartbeat loop. Pausing makes this replica
    /// retract its leadership candidacy, simulating a planned retraction.
    pub fn set_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
    }

    /// Requests a hard reset of every replication connection on the next
    /// applier pass. Used when rights switching alone cannot restore
    /// consistency.
    pub fn request_hard_reset(&self) {
        self.hard_reset.send_replace(true);
    }

    /// Sequence range confirmed by the latest fast-path write.
    pub fn proposed_replicated_range(&self) -> (u64, u64) {
        *self.range.borrow()
    }
}

fn catchup_error(core: &mut Core, err: MajorityError, outcome: ProposeError) -> ProposeError {
    if let MajorityError::Canceled(canceled) = err {
        return canceled.into();
    }
    tracing::debug!("slow-path catch-up failed: {err}");
    core.catchup.recover(&err);
    outcome
}

fn majw_error(core: &mut Core, err: MajorityError, outcome: ProposeError) -> ProposeError {
    if let MajorityError::Canceled(canceled) = err {
        return canceled.into();
    }
    tracing::debug!("slow-path majority write failed: {err}");
    core.majw.recover(&err);
    outcome
}

/// Drives the engine's background loops: heartbeat, permission scanner,
/// permission applier and the follower. Runs until canceled.
#[derive(Debug)]
pub struct ConsensusRunner {
    heartbeat: LeaderHeartbeat,
    scanner: Scanner,
    applier: Applier,
    follower: Follower,
}

impl ConsensusRunner {
    /// Runs the background loops until the context is canceled.
    pub async fn run(self, ctx: &ctx::Ctx) -> anyhow::Result<()> {
        let Self {
            heartbeat,
            scanner,
            applier,
            follower,
        } = self;
        let res: ctx::Result<()> = scope::run!(ctx, |ctx, s| async {
            s.spawn_bg(heartbeat.run(ctx));
            s.spawn_bg(scanner.run(ctx));
            s.spawn_bg(applier.run(ctx));
            s.spawn_bg(follower.run(ctx));
            ctx.canceled().await;
            Ok(())
        })
        .await;
        match res {
            Ok(()) | Err(ctx::Error::Canceled(_)) => Ok(()),
            Err(ctx::Error::Internal(err)) => Err(err),
        }
    }
}
