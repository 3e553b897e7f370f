use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Context as _;
use onesided_replication::{MajorityError, MajorityOp};
use onesided_transport::{
    max_id, Completion, CompletionQueue as _, Connection, Kind, KindQueue, KindRouter, Op, Plane,
    ReplicaId, Scratchpad, Tag,
};
use zksync_concurrency::{ctx, sync};

use crate::token::{Leader, LeaderToken};

/// Top bit of a request value: the requester demands a hard connection
/// reset instead of a rights switch.
pub(crate) const RESET_BIT: u64 = 1 << 63;

/// The requester half of the permission handoff: publishes request values
/// into every peer's request cell and waits for the two-step grant
/// acknowledgements; the granter half answers them.
///
/// Request values of a replica advance by `2 * modulo` per round and stay
/// congruent to the replica id, so concurrent requesters never publish the
/// same value. Step-1 grants echo the request value, step-2 grants echo it
/// shifted by `modulo`.
#[derive(Debug)]
pub(crate) struct PermissionAsker {
    me: ReplicaId,
    modulo: u64,
    scratch: Arc<Scratchpad>,
    req_nr: Arc<AtomicU64>,
    writer: MajorityOp,
    conns: BTreeMap<ReplicaId, Arc<dyn Connection>>,
    grant_poller: KindQueue,
    grant_req_id: u64,
    entries: Vec<Completion>,
}

impl PermissionAsker {
    /// Constructs the asker over the background plane. Also returns the
    /// shared request counter (the permission scanner reads it when
    /// claiming the leader token).
    pub(crate) fn new(
        plane: &Plane,
        scratch: Arc<Scratchpad>,
        router: &Arc<KindRouter>,
    ) -> anyhow::Result<(Self, Arc<AtomicU64>)> {
        let mut all = plane.remote_ids();
        all.push(plane.me);
        let modulo = max_id(&all).index() as u64;
        // Handoff traffic must reach everyone: full quorum, no failure
        // budget.
        let writer = MajorityOp::with_quorum(
            plane,
            Arc::new(router.handle(Kind::LeaderRequest)),
            Kind::LeaderRequest,
            1,
            plane.peers.len(),
            0,
        )?;
        let req_nr = Arc::new(AtomicU64::new(plane.me.index() as u64));
        Ok((
            Self {
                me: plane.me,
                modulo,
                scratch,
                req_nr: req_nr.clone(),
                writer,
                conns: plane.peers.clone(),
                grant_poller: router.handle(Kind::LeaderGrant),
                grant_req_id: 1,
                entries: Vec::new(),
            },
            req_nr,
        ))
    }

    /// The request value the next round will publish.
    pub(crate) fn request_nr(&self) -> u64 {
        self.req_nr.load(Ordering::Relaxed)
    }

    /// Publishes the current request value into every peer's request cell
    /// and waits until all of them acknowledged receipt of the write.
    pub(crate) async fn ask_for_permissions(
        &mut self,
        ctx: &ctx::Ctx,
        hard_reset: bool,
    ) -> Result<(), MajorityError> {
        let req = self.request_nr();
        let value = if hard_reset { RESET_BIT | req } else { req };
        self.scratch
            .write_cell(self.scratch.request_out_offset(), value);
        tracing::debug!("publishing permission request {req} (hard_reset = {hard_reset})");
        self.writer
            .write(
                ctx,
                self.scratch.request_out_offset(),
                8,
                self.scratch.incoming_request_offset(self.me),
                &|| true,
            )
            .await?;
        self.req_nr.fetch_add(2 * self.modulo, Ordering::Relaxed);
        Ok(())
    }

    /// Answers step 1 of a handoff: echo the request value back into the
    /// requester's grant cell.
    pub(crate) async fn give_permission_step1(
        &mut self,
        ctx: &ctx::Ctx,
        pid: ReplicaId,
        response: u64,
    ) -> ctx::Result<()> {
        self.give_permission(ctx, pid, response).await
    }

    /// Answers step 2: the request value shifted by `modulo`.
    pub(crate) async fn give_permission_step2(
        &mut self,
        ctx: &ctx::Ctx,
        pid: ReplicaId,
        response: u64,
    ) -> ctx::Result<()> {
        self.give_permission(ctx, pid, response + self.modulo).await
    }

    async fn give_permission(
        &mut self,
        ctx: &ctx::Ctx,
        pid: ReplicaId,
        response: u64,
    ) -> ctx::Result<()> {
        self.scratch
            .write_cell(self.scratch.grant_out_offset(), response);
        let conn = self
            .conns
            .get(&pid)
            .with_context(|| format!("no connection to requester {pid}"))?;
        let seq = self.grant_req_id;
        self.grant_req_id += 1;
        let tag = Tag::new(Kind::LeaderGrant, pid, seq);
        let addr = conn.remote_base() + self.scratch.incoming_grant_offset(self.me) as u64;
        if !conn.post(Op::Write, tag, self.scratch.grant_out_offset(), 8, addr) {
            return Err(anyhow::format_err!("posting a grant to replica {pid} failed").into());
        }
        // Spin on the own completion; grant traffic on the background
        // plane is assumed reliable.
        loop {
            if !ctx.is_active() {
                return Err(ctx::Canceled.into());
            }
            if !self.grant_poller.poll(4, &mut self.entries) {
                return Err(anyhow::format_err!("grant completion queue failed").into());
            }
            for entry in &self.entries {
                let Some(t) = Tag::unpack(entry.tag) else {
                    continue;
                };
                if t.replica != pid || t.seq != seq {
                    continue;
                }
                if !entry.ok {
                    return Err(
                        anyhow::format_err!("grant write to replica {pid} failed").into()
                    );
                }
                return Ok(());
            }
            sync::yield_now().await;
        }
    }

    /// Waits until every peer acknowledged step 1 of the current round (a
    /// peer that already answered step 2 counts as well). Bails out with
    /// `false` when the leader token moves away from `current`; waiting
    /// on would risk a distributed deadlock when two replicas ask at once.
    pub(crate) async fn wait_for_approval_step1(
        &self,
        ctx: &ctx::Ctx,
        current: Leader,
        token: &LeaderToken,
    ) -> ctx::OrCanceled<bool> {
        self.wait_for_approval(ctx, current, token, true).await
    }

    /// Waits for every peer's step-2 acknowledgement.
    pub(crate) async fn wait_for_approval_step2(
        &self,
        ctx: &ctx::Ctx,
        current: Leader,
        token: &LeaderToken,
    ) -> ctx::OrCanceled<bool> {
        self.wait_for_approval(ctx, current, token, false).await
    }

    async fn wait_for_approval(
        &self,
        ctx: &ctx::Ctx,
        current: Leader,
        token: &LeaderToken,
        step1: bool,
    ) -> ctx::OrCanceled<bool> {
        // `ask_for_permissions` has already advanced the counter.
        let req = self.request_nr();
        let modulo = self.modulo;
        let mut waiting: Vec<ReplicaId> = self.conns.keys().copied().collect();
        loop {
            if !ctx.is_active() {
                return Err(ctx::Canceled);
            }
            waiting.retain(|pid| {
                let val =
                    self.scratch.read_cell(self.scratch.incoming_grant_offset(*pid)) & !RESET_BIT;
                let acked = if step1 {
                    val + 2 * modulo == req || val + modulo == req
                } else {
                    val + modulo == req
                };
                !acked
            });
            if waiting.is_empty() {
                return Ok(true);
            }
            if token.load() != current {
                return Ok(false);
            }
            sync::yield_now().await;
        }
    }
}
