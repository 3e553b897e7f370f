use std::sync::Arc;

use onesided_transport::{Completion, Connection, CompletionQueue, Kind, Op, Plane, ReplicaId, Tag};
use zksync_concurrency::{ctx, sync};

use crate::{
    error::{MajorityError, QuorumFailure},
    quorum::QuorumWaiter,
    tracker::FailureTracker,
};

/// Leadership is re-checked every this many poll iterations on the
/// leader-checked path, to bound the cost of an in-flight leader change.
const LEADER_CHECK_MASK: u64 = 1024 - 1;
/// Fast-path writes check less often; they rarely wait long.
const FAST_LEADER_CHECK_MASK: u64 = (1 << 14) - 1;

/// Orchestrates one-sided reads/writes against a fixed replica set,
/// combining a [`QuorumWaiter`] and a [`FailureTracker`] into a verdict.
#[derive(Debug)]
pub struct MajorityOp {
    me: ReplicaId,
    conns: Vec<(ReplicaId, Arc<dyn Connection>)>,
    cq: Arc<dyn CompletionQueue>,
    kind: Kind,
    waiter: QuorumWaiter,
    tracker: FailureTracker,
    quorum_size: usize,
    successes: Vec<ReplicaId>,
    entries: Vec<Completion>,
    range: (u64, u64),
}

impl MajorityOp {
    /// Constructs an operation requiring a majority of the cluster
    /// (self included) and tolerating a minority of failures.
    pub fn new(plane: &Plane, kind: Kind, next_id: u64) -> anyhow::Result<Self> {
        let total = plane.peers.len() + 1;
        Self::with_quorum(
            plane,
            plane.cq.clone(),
            kind,
            next_id,
            crate::majority(total) - 1,
            crate::minority(total),
        )
    }

    /// Constructs an operation with an explicit quorum size and failure
    /// budget, polling `cq` (which may be a routed view of the plane's
    /// queue).
    pub fn with_quorum(
        plane: &Plane,
        cq: Arc<dyn CompletionQueue>,
        kind: Kind,
        next_id: u64,
        quorum_size: usize,
        tolerated: usize,
    ) -> anyhow::Result<Self> {
        let remote_ids = plane.remote_ids();
        let waiter = QuorumWaiter::new(kind, &remote_ids, quorum_size, next_id)?;
        let mut tracker = FailureTracker::new(kind, &remote_ids, tolerated);
        tracker.track(waiter.req_id());
        Ok(Self {
            me: plane.me,
            conns: plane.peers.iter().map(|(id, c)| (*id, c.clone())).collect(),
            cq,
            kind,
            waiter,
            tracker,
            quorum_size,
            successes: Vec::new(),
            entries: Vec::new(),
            range: (0, 0),
        })
    }

    /// Sequence the next request will be posted under.
    pub fn req_id(&self) -> u64 {
        self.waiter.req_id()
    }

    /// Replicas that acknowledged the latest leader-checked operation.
    pub fn successes(&self) -> &[ReplicaId] {
        &self.successes
    }

    /// Highest sequence confirmed by a quorum so far.
    pub fn latest_replicated(&self) -> u64 {
        self.waiter.req_id()
    }

    /// Sequence range `(first, past-last)` confirmed by the latest fast
    /// write.
    pub fn range(&self) -> (u64, u64) {
        self.range
    }

    /// Re-arms the waiter and tracker at the failed request's sequence so
    /// a retry can proceed without reusing an in-flight sequence number.
    pub fn recover(&mut self, err: &MajorityError) {
        match err {
            MajorityError::Quorum { req, .. } => {
                self.tracker.reset();
                self.tracker.track(*req);
                self.waiter.reset(*req);
            }
            MajorityError::Canceled(_) => {}
        }
    }

    /// Writes `len` bytes at local region offset `local_offset` into every
    /// replica at `remote_offset`, waiting for a quorum. `leader_intact`
    /// is consulted periodically; losing leadership aborts the wait.
    pub async fn write(
        &mut self,
        ctx: &ctx::Ctx,
        local_offset: usize,
        len: usize,
        remote_offset: usize,
        leader_intact: &(dyn Fn() -> bool + Sync),
    ) -> Result<(), MajorityError> {
        self.successes.clear();
        let req = self.waiter.req_id();
        let next = self.waiter.next_req_id();
        for (pid, conn) in &self.conns {
            let tag = Tag::new(self.kind, *pid, req);
            let addr = conn.remote_base() + remote_offset as u64;
            if !conn.post(Op::Write, tag, local_offset, len, addr) {
                return Err(self.fail(req, QuorumFailure::PostRejected(*pid)));
            }
        }
        self.wait_quorum(ctx, req, next, leader_intact).await
    }

    /// Reads `len` bytes from every replica's `remote_offset` into
    /// per-replica local buffers, waiting for a quorum.
    pub async fn read(
        &mut self,
        ctx: &ctx::Ctx,
        local_offset_of: &(dyn Fn(ReplicaId) -> usize + Sync),
        len: usize,
        remote_offset: usize,
        leader_intact: &(dyn Fn() -> bool + Sync),
    ) -> Result<(), MajorityError> {
        self.successes.clear();
        let req = self.waiter.req_id();
        let next = self.waiter.next_req_id();
        for (pid, conn) in &self.conns {
            let tag = Tag::new(self.kind, *pid, req);
            let addr = conn.remote_base() + remote_offset as u64;
            if !conn.post(Op::Read, tag, local_offset_of(*pid), len, addr) {
                return Err(self.fail(req, QuorumFailure::PostRejected(*pid)));
            }
        }
        self.wait_quorum(ctx, req, next, leader_intact).await
    }

    /// The optimistic fast path: posts pipelined writes and waits only
    /// until at most `outstanding` operations remain unacknowledged.
    /// Returns a bare boolean; callers treat every fast-path failure the
    /// same way (fall back to recovery).
    pub async fn fast_write(
        &mut self,
        ctx: &ctx::Ctx,
        local_offset: usize,
        len: usize,
        remote_offset: usize,
        outstanding: u64,
        sideband: Option<&Arc<dyn Connection>>,
        leader_intact: &(dyn Fn() -> bool + Sync),
    ) -> bool {
        let req = self.waiter.fetch_and_inc_fast_id();
        let next = self.waiter.next_fast_req_id();

        if let Some(hub) = sideband {
            let tag = Tag::new(Kind::SidebandWrite, self.me, req);
            let addr = hub.remote_base() + remote_offset as u64;
            if !hub.post(Op::Write, tag, local_offset, len, addr) {
                tracing::warn!("sideband rejected a fast-path write");
                return false;
            }
        } else {
            for (pid, conn) in &self.conns {
                let tag = Tag::new(self.kind, *pid, req);
                let addr = conn.remote_base() + remote_offset as u64;
                if !conn.post(Op::Write, tag, local_offset, len, addr) {
                    tracing::warn!("connection to replica {pid} rejected a fast-path write");
                    return false;
                }
            }
        }

        let expected = if sideband.is_some() {
            outstanding as usize + 1
        } else {
            outstanding as usize * self.conns.len() + self.quorum_size
        };
        let mut loops: u64 = 0;
        while !self.waiter.can_continue_with_outstanding(outstanding, next) {
            if !ctx.is_active() {
                return false;
            }
            if !self.cq.poll(expected, &mut self.entries) {
                tracing::warn!("completion poll failed in the fast path");
                return false;
            }
            if self.entries.is_empty() {
                sync::yield_now().await;
            } else if !self.waiter.fast_consume(&self.entries) {
                tracing::debug!("fast-path completion carried a failure status");
                return false;
            }
            loops += 1;
            if loops & FAST_LEADER_CHECK_MASK == 0 && !leader_intact() {
                return false;
            }
        }
        self.range = (req, self.waiter.req_id());
        true
    }

    /// The typed error corresponding to a failed fast write.
    pub fn fast_write_error(&self) -> MajorityError {
        self.fail(self.waiter.req_id(), QuorumFailure::FastPath)
    }

    async fn wait_quorum(
        &mut self,
        ctx: &ctx::Ctx,
        req: u64,
        next: u64,
        leader_intact: &(dyn Fn() -> bool + Sync),
    ) -> Result<(), MajorityError> {
        let mut loops: u64 = 0;
        while !self.waiter.can_continue_with(next) {
            if !ctx.is_active() {
                return Err(ctx::Canceled.into());
            }
            if !self.cq.poll(self.conns.len(), &mut self.entries) {
                return Err(self.fail(req, QuorumFailure::PollFailed));
            }
            if self.entries.is_empty() {
                sync::yield_now().await;
            } else if !self.waiter.consume(&self.entries, &mut self.successes)
                && self.tracker.is_unrecoverable(&self.entries)
            {
                return Err(self.fail(req, QuorumFailure::Unrecoverable));
            }
            loops += 1;
            if loops & LEADER_CHECK_MASK == 0 && !leader_intact() {
                return Err(self.fail(req, QuorumFailure::LeaderChanged));
            }
        }
        self.waiter.set_fast_req_id(next);
        Ok(())
    }

    fn fail(&self, req: u64, cause: QuorumFailure) -> MajorityError {
        MajorityError::Quorum {
            kind: self.kind,
            req,
            cause,
        }
    }
}
