use std::{
    collections::BTreeSet,
    sync::Arc,
};

use onesided_transport::{
    max_id, Completion, CompletionQueue as _, Connection, Kind, KindQueue, KindRouter, Op, Plane,
    ReplicaId, Scratchpad, Tag,
};
use zksync_concurrency::{ctx, sync, time};

/// Cadence of the liveness loop.
const CADENCE: time::Duration = time::Duration::milliseconds(1);
/// Extra pause taken by replicas that do not currently see themselves as
/// the leader; only the would-be leader spins at full cadence.
const IDLE_PAUSE: time::Duration = time::Duration::milliseconds(50);
/// Score cap.
const HISTORY: i32 = 50;
/// Score boost for a freshly observed counter change.
const BOOST: i32 = 3;
/// A counter change only boosts the score if observed within this many
/// posting rounds; anything older is a stale read.
const POST_WINDOW: u64 = 3;
/// Minimum score a replica needs to qualify as the leader.
const MIN_LEADER_SCORE: i32 = 2;

#[derive(Clone, Copy, Debug, Default)]
struct ReadingStatus {
    value: u64,
    score: i32,
}

/// The liveness loop: bumps the local counter through the loopback, probes
/// every peer's counter with one-sided reads, and scores each replica by
/// how consistently its counter moves. The lowest-id replica whose score
/// clears the threshold is the leader; when that is this replica, the
/// `want_leader` signal is raised for the permission scanner to act on.
#[derive(Debug)]
pub(crate) struct LeaderHeartbeat {
    me: ReplicaId,
    conns: Vec<(ReplicaId, Arc<dyn Connection>)>,
    loopback: Arc<dyn Connection>,
    scratch: Arc<Scratchpad>,
    poller: KindQueue,
    /// All replica ids, ascending; leader choice scans them in order.
    ids: Vec<ReplicaId>,
    status: Vec<ReadingStatus>,
    outstanding: BTreeSet<ReplicaId>,
    post_ids: Vec<u64>,
    post_id: u64,
    read_seq: u64,
    counter: u64,
    entries: Vec<Completion>,
    want_leader: Arc<sync::watch::Sender<bool>>,
    paused: sync::watch::Receiver<bool>,
    response_blocked: Arc<sync::watch::Sender<bool>>,
}

impl LeaderHeartbeat {
    pub(crate) fn new(
        plane: &Plane,
        scratch: Arc<Scratchpad>,
        router: &Arc<KindRouter>,
        want_leader: Arc<sync::watch::Sender<bool>>,
        paused: sync::watch::Receiver<bool>,
        response_blocked: Arc<sync::watch::Sender<bool>>,
    ) -> anyhow::Result<Self> {
        let loopback = plane
            .loopback
            .clone()
            .ok_or_else(|| anyhow::format_err!("the background plane must have a loopback"))?;
        let mut ids = plane.remote_ids();
        ids.push(plane.me);
        ids.sort_unstable();
        let slots = max_id(&ids).index() + 1;
        let mut status = vec![ReadingStatus::default(); slots];
        // Seed the lowest id so the cluster boots with a deterministic
        // leader instead of waiting for scores to accumulate.
        status[ids[0].index()].score = HISTORY;
        Ok(Self {
            me: plane.me,
            conns: plane.peers.iter().map(|(id, c)| (*id, c.clone())).collect(),
            loopback,
            scratch,
            poller: router.handle(Kind::Heartbeat),
            ids,
            status,
            outstanding: BTreeSet::new(),
            post_ids: vec![0; slots],
            post_id: 0,
            read_seq: 0,
            counter: 0,
            entries: Vec::new(),
            want_leader,
            paused,
            response_blocked,
        })
    }

    pub(crate) async fn run(mut self, ctx: &ctx::Ctx) -> ctx::Result<()> {
        tracing::info!("starting the heartbeat loop");
        loop {
            if *self.paused.borrow() {
                tracing::info!("heartbeat paused, retracting leadership candidacy");
                self.response_blocked.send_replace(true);
                self.want_leader.send_replace(false);
                sync::wait_for(ctx, &mut self.paused, |paused| !*paused).await?;
                tracing::info!("heartbeat resumed");
                self.response_blocked.send_replace(false);
            }
            self.scan();
            if self.leader_id() == Some(self.me) {
                self.want_leader.send_replace(true);
            } else {
                ctx.sleep(IDLE_PAUSE).await?;
            }
            ctx.sleep(CADENCE).await?;
        }
    }

    /// One round: refresh the own counter, probe peers without an
    /// outstanding probe, fold in completions, update scores.
    fn scan(&mut self) {
        if !self.outstanding.contains(&self.me) {
            self.counter += 1;
            self.scratch
                .write_cell(self.scratch.heartbeat_source_offset(), self.counter);
            let tag = Tag::new(Kind::Heartbeat, self.me, self.read_seq);
            let addr =
                self.loopback.remote_base() + self.scratch.heartbeat_counter_offset() as u64;
            if self.loopback.post(
                Op::Write,
                tag,
                self.scratch.heartbeat_source_offset(),
                8,
                addr,
            ) {
                self.outstanding.insert(self.me);
            } else {
                tracing::warn!("posting the liveness counter update failed");
            }
        }

        let mut did_work = false;
        for (pid, conn) in &self.conns {
            if self.outstanding.contains(pid) {
                continue;
            }
            did_work = true;
            self.outstanding.insert(*pid);
            self.post_ids[pid.index()] = self.post_id;
            let tag = Tag::new(Kind::Heartbeat, *pid, self.read_seq);
            let addr = conn.remote_base() + self.scratch.heartbeat_counter_offset() as u64;
            if !conn.post(
                Op::Read,
                tag,
                self.scratch.heartbeat_read_offset(*pid),
                8,
                addr,
            ) {
                tracing::warn!("posting a liveness probe to replica {pid} failed");
            }
        }
        if did_work {
            self.post_id += 1;
        }
        self.read_seq += 1;

        let mut entries = std::mem::take(&mut self.entries);
        let max = self.outstanding.len().max(1);
        if !self.poller.poll(max, &mut entries) {
            tracing::warn!("heartbeat completion poll failed");
        }
        for entry in &entries {
            let Some(tag) = Tag::unpack(entry.tag) else {
                continue;
            };
            let pid = tag.replica;
            self.outstanding.remove(&pid);
            let Some(status) = self.status.get_mut(pid.index()) else {
                continue;
            };
            if !entry.ok {
                // A failed probe decays the score like an unchanged value.
                status.score = status.score.max(1) - 1;
                continue;
            }
            let value = if pid == self.me {
                self.scratch.read_cell(self.scratch.heartbeat_counter_offset())
            } else {
                self.scratch.read_cell(self.scratch.heartbeat_read_offset(pid))
            };
            if status.value == value {
                status.score = status.score.max(1) - 1;
            } else if self.post_id < self.post_ids[pid.index()] + POST_WINDOW {
                status.score = status.score.min(HISTORY - BOOST) + BOOST;
            }
            status.value = value;
        }
        self.entries = entries;
    }

    /// The lowest-id replica whose score clears the threshold; `None` when
    /// nobody qualifies.
    fn leader_id(&self) -> Option<ReplicaId> {
        self.ids
            .iter()
            .find(|id| self.status[id.index()].score > MIN_LEADER_SCORE)
            .copied()
    }
}
