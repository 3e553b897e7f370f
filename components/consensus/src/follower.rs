use std::sync::Arc;

use zksync_concurrency::{ctx, sync};

use crate::{engine::Core, CommitHandler};

/// The follower loop: watches the local log for slots a remote leader
/// replicated into it, advances the first-undecided-offset from their
/// snapshots, delivers newly decided entries to the commit handler and
/// applies recycle requests. Blocked by the permission applier around
/// leader transitions; on unblock its sampling cursor reattaches, since
/// the log may have been rewritten under a new leader.
#[derive(Debug)]
pub(crate) struct Follower {
    core: Arc<sync::Mutex<Core>>,
    blocked: sync::watch::Receiver<bool>,
    is_leader: sync::watch::Receiver<bool>,
    commit: Arc<dyn CommitHandler>,
}

impl Follower {
    pub(crate) fn new(
        core: Arc<sync::Mutex<Core>>,
        blocked: sync::watch::Receiver<bool>,
        is_leader: sync::watch::Receiver<bool>,
        commit: Arc<dyn CommitHandler>,
    ) -> Self {
        Self {
            core,
            blocked,
            is_leader,
            commit,
        }
    }

    pub(crate) async fn run(mut self, ctx: &ctx::Ctx) -> ctx::Result<()> {
        tracing::info!("starting the follower loop");
        let mut was_blocked = false;
        loop {
            if !ctx.is_active() {
                return Ok(());
            }
            if *self.blocked.borrow() {
                was_blocked = true;
                sync::wait_for(ctx, &mut self.blocked, |blocked| !*blocked).await?;
            }
            {
                let mut core = sync::lock(ctx, &self.core).await?.into_async();
                if was_blocked {
                    core.accept_iter.reattach();
                    was_blocked = false;
                }
                let is_leader = *self.is_leader.borrow();
                core.follower_step(is_leader, &*self.commit);
            }
            sync::yield_now().await;
        }
    }
}
