use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use onesided_replication::MajorityError;
use onesided_transport::{Connection as _, Plane, ReplicaId, Rights, Scratchpad};
use zksync_concurrency::{ctx, sync};

use crate::{
    metrics::METRICS,
    permission::{PermissionAsker, RESET_BIT},
    token::{Leader, LeaderToken},
};

/// The permission scanner: a tight loop watching the local request cells
/// for new leadership requests, and claiming the leader token for this
/// replica when the heartbeat wants leadership and the token is free.
#[derive(Debug)]
pub(crate) struct Scanner {
    me: ReplicaId,
    /// All replica ids, ascending; request cells are scanned in this order.
    ids: Vec<ReplicaId>,
    scratch: Arc<Scratchpad>,
    token: Arc<LeaderToken>,
    want_leader: Arc<sync::watch::Sender<bool>>,
    req_nr: Arc<AtomicU64>,
    /// Last observed request value per candidate index; only increases
    /// count as new requests.
    current: Vec<u64>,
}

impl Scanner {
    pub(crate) fn new(
        me: ReplicaId,
        ids: Vec<ReplicaId>,
        scratch: Arc<Scratchpad>,
        token: Arc<LeaderToken>,
        want_leader: Arc<sync::watch::Sender<bool>>,
        req_nr: Arc<AtomicU64>,
    ) -> Self {
        // Start from whatever the cells hold, so replayed requests from
        // before a restart are not mistaken for fresh ones.
        let current = ids
            .iter()
            .map(|id| scratch.read_cell(scratch.incoming_request_offset(*id)) & !RESET_BIT)
            .collect();
        Self {
            me,
            ids,
            scratch,
            token,
            want_leader,
            req_nr,
            current,
        }
    }

    pub(crate) async fn run(mut self, ctx: &ctx::Ctx) -> ctx::Result<()> {
        tracing::info!("starting the permission scanner");
        loop {
            if !ctx.is_active() {
                return Ok(());
            }
            self.scan();
            sync::yield_now().await;
        }
    }

    fn scan(&mut self) {
        let mut requester = None;
        for (i, id) in self.ids.iter().enumerate() {
            if *id == self.me {
                continue;
            }
            let raw = self.scratch.read_cell(self.scratch.incoming_request_offset(*id));
            let reset = raw & RESET_BIT != 0;
            let value = raw & !RESET_BIT;
            if value > self.current[i] {
                self.current[i] = value;
                requester = Some((*id, value, reset));
                break;
            }
        }
        if let Some((id, value, reset)) = requester {
            tracing::info!("replica {id} asked for write permissions (value {value})");
            self.token.store(Leader::new(id, value, reset));
            // Somebody else wants the log; this replica stands down.
            self.want_leader.send_replace(false);
        } else if *self.want_leader.borrow() {
            let expected = self.token.load();
            if expected.is_unused() {
                let desired = Leader::new(self.me, self.req_nr.load(Ordering::Relaxed), false);
                if self.token.compare_exchange(expected, desired) {
                    self.want_leader.send_replace(false);
                }
            }
        }
    }
}

/// The permission applier: watches the leader token and drives the actual
/// handoff: asking for permissions when this replica is the requester,
/// switching connection rights and answering the grant steps when a
/// remote replica is.
#[derive(Debug)]
pub(crate) struct Applier {
    me: ReplicaId,
    token: Arc<LeaderToken>,
    asker: PermissionAsker,
    replication: Plane,
    is_leader: Arc<sync::watch::Sender<bool>>,
    follower_blocked: Arc<sync::watch::Sender<bool>>,
    hard_reset: Arc<sync::watch::Sender<bool>>,
    prev: Leader,
    force: bool,
}

impl Applier {
    pub(crate) fn new(
        me: ReplicaId,
        token: Arc<LeaderToken>,
        asker: PermissionAsker,
        replication: Plane,
        is_leader: Arc<sync::watch::Sender<bool>>,
        follower_blocked: Arc<sync::watch::Sender<bool>>,
        hard_reset: Arc<sync::watch::Sender<bool>>,
    ) -> Self {
        Self {
            me,
            token,
            asker,
            replication,
            is_leader,
            follower_blocked,
            hard_reset,
            prev: Leader::unclaimed(),
            force: false,
        }
    }

    pub(crate) async fn run(mut self, ctx: &ctx::Ctx) -> ctx::Result<()> {
        tracing::info!("starting the permission applier");
        self.is_leader.send_replace(false);
        loop {
            if !ctx.is_active() {
                return Ok(());
            }
            let asked_reset = *self.hard_reset.borrow();
            if asked_reset {
                tracing::warn!("hard reset requested locally");
                self.force = true;
                self.is_leader.send_replace(false);
            }
            if !self.step(ctx).await? {
                tracing::warn!("permission handoff interrupted, retrying");
                self.force = true;
                self.is_leader.send_replace(false);
            }
            if asked_reset {
                self.hard_reset.send_replace(false);
            }
            sync::yield_now().await;
        }
    }

    /// One pass: returns false when an attempt to become leader was
    /// interrupted by a competing transition and must be retried.
    async fn step(&mut self, ctx: &ctx::Ctx) -> ctx::Result<bool> {
        let current = self.token.load();
        if current == self.prev && !self.force {
            return Ok(true);
        }
        let orig = self.prev;
        self.prev = current;
        let hard_reset = self.force;
        self.force = false;
        if current.is_unused() {
            // Nothing has been requested yet.
            return Ok(true);
        }

        if current.requester() == self.me {
            if *self.is_leader.borrow() {
                // Already the leader; nothing to re-acquire.
                return Ok(true);
            }
            if let Err(err) = self.asker.ask_for_permissions(ctx, hard_reset).await {
                if let MajorityError::Canceled(canceled) = err {
                    return Err(canceled.into());
                }
                tracing::warn!("permission request failed: {err}");
                return Ok(false);
            }
            // Bail out when the leader changes mid-wait; two simultaneous
            // requesters would otherwise deadlock waiting for each other.
            if !self
                .asker
                .wait_for_approval_step1(ctx, current, &self.token)
                .await?
            {
                return Ok(false);
            }
            self.token.compare_exchange(current, current.make_unused());

            if hard_reset {
                for (pid, conn) in &self.replication.peers {
                    if !conn.change_rights(Rights::local()) {
                        tracing::error!("revoking rights on the connection to {pid} failed");
                    }
                }
            } else if orig.requester() != self.me {
                // Going from follower to leader: revoke the previous
                // leader's write rights to the local log.
                if let Some(conn) = self.replication.peers.get(&orig.requester()) {
                    if !conn.change_rights(Rights::local()) {
                        return Err(anyhow::format_err!(
                            "revoking the previous leader's write rights failed"
                        )
                        .into());
                    }
                }
            }

            self.follower_blocked.send_replace(true);
            if !self
                .asker
                .wait_for_approval_step2(ctx, current, &self.token)
                .await?
            {
                return Ok(false);
            }
            self.is_leader.send_replace(true);
            METRICS.leader_changes.inc();
            tracing::info!("write permissions granted, this replica is now the leader");
        } else {
            self.is_leader.send_replace(false);

            if current.wants_reset() {
                tracing::warn!("hard reset requested by replica {}", current.requester());
                for (pid, conn) in &self.replication.peers {
                    let rights = if *pid == current.requester() {
                        Rights::full()
                    } else {
                        Rights::local()
                    };
                    if !conn.reconnect(rights) {
                        tracing::error!("re-establishing the connection to {pid} failed");
                    }
                }
            } else {
                self.asker
                    .give_permission_step1(ctx, current.requester(), current.value())
                    .await?;
                // Revoke before granting, so no two replicas ever hold
                // write rights to this log at the same time.
                if let Some(conn) = self.replication.peers.get(&orig.requester()) {
                    if !conn.change_rights(Rights::local()) {
                        return Err(anyhow::format_err!(
                            "revoking the previous leader's write rights failed"
                        )
                        .into());
                    }
                }
                if let Some(conn) = self.replication.peers.get(&current.requester()) {
                    if !conn.change_rights(Rights::full()) {
                        return Err(anyhow::format_err!(
                            "granting write rights to the new leader failed"
                        )
                        .into());
                    }
                }
            }
            self.asker
                .give_permission_step2(ctx, current.requester(), current.value())
                .await?;
            self.follower_blocked.send_replace(false);
            tracing::info!("gave write permissions to replica {}", current.requester());
            self.token.compare_exchange(current, current.make_unused());
        }
        Ok(true)
    }
}
