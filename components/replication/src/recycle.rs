use std::sync::Arc;

use onesided_log::{Log, Slot};
use onesided_transport::{Kind, Plane, Scratchpad};
use zksync_concurrency::{ctx, sync};

use crate::{error::MajorityError, majority::MajorityOp};

/// Bookkeeping of a log-recycling round.
///
/// The leader majority-writes a recycle request slot through the ordinary
/// replication path, resets its own log, and then waits for every peer to
/// apply the request. The acknowledgement is one-sided as well: a peer
/// that recycled shows a zero first-undecided-offset, so the leader simply
/// re-reads every peer's header until all report zero.
#[derive(Debug)]
pub struct Recycling {
    probe: MajorityOp,
    scratch: Arc<Scratchpad>,
    log: Log,
}

impl Recycling {
    /// Constructs the recycling helper over the replication plane.
    pub fn new(plane: &Plane, scratch: Arc<Scratchpad>, log: Log) -> anyhow::Result<Self> {
        // All peers must answer the probe; a majority is not enough to
        // declare the whole cluster recycled.
        let peers = plane.peers.len();
        Ok(Self {
            probe: MajorityOp::with_quorum(plane, plane.cq.clone(), Kind::RecycleRead, 1, peers, 0)?,
            scratch,
            log,
        })
    }

    /// Builds the recycle request slot content for a log recycled at
    /// `recycled_at`.
    pub fn request(&self, proposal: u64, recycled_at: u64) -> Slot {
        Slot::recycle_request(proposal, recycled_at)
    }

    /// Waits until every peer's first-undecided-offset reads zero.
    pub async fn wait_for_replies(
        &mut self,
        ctx: &ctx::Ctx,
        leader_intact: &(dyn Fn() -> bool + Sync),
    ) -> Result<(), MajorityError> {
        let scratch = self.scratch.clone();
        loop {
            self.probe
                .read(
                    ctx,
                    &|pid| scratch.fuo_read_offset(pid),
                    8,
                    self.log.header_region_offset(),
                    leader_intact,
                )
                .await?;
            let pending = self
                .probe
                .successes()
                .iter()
                .filter(|pid| self.scratch.read_cell(self.scratch.fuo_read_offset(**pid)) != 0)
                .count();
            if pending == 0 {
                return Ok(());
            }
            tracing::trace!("{pending} peers have not recycled yet");
            sync::yield_now().await;
        }
    }
}
