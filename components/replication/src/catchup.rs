use std::sync::Arc;

use onesided_log::Log;
use onesided_transport::{max_id, Kind, Plane, ReplicaId, Scratchpad};
use zksync_concurrency::ctx;

use crate::{error::MajorityError, majority::MajorityOp};

/// Error of a catch-up step.
#[derive(Debug, thiserror::Error)]
pub enum CatchUpError {
    /// The underlying majority operation failed.
    #[error(transparent)]
    Majority(#[from] MajorityError),
    /// A peer established a higher proposal concurrently; the step must be
    /// re-run (the candidate has already been recomputed).
    #[error("a higher proposal appeared concurrently")]
    Retry,
}

/// Log reconciliation run once per leader accession: adopt the highest
/// first-undecided-offset in the cluster, push it to lagging followers,
/// and establish a fresh, globally-unique proposal number greater than any
/// seen. All steps must succeed before the new leader may propose.
#[derive(Debug)]
pub struct CatchUp {
    me: ReplicaId,
    /// Proposal numbers of this replica are `≡ me (mod id_space)`, which
    /// keeps concurrently-established proposals globally distinct.
    id_space: u64,
    fuo_read: MajorityOp,
    fuo_write: MajorityOp,
    proposal_read: MajorityOp,
    proposal_write: MajorityOp,
    scratch: Arc<Scratchpad>,
    log: Log,
    candidate: u64,
}

impl CatchUp {
    /// Constructs the catch-up helper over the replication plane.
    pub fn new(plane: &Plane, scratch: Arc<Scratchpad>, log: Log) -> anyhow::Result<Self> {
        let mut all = plane.remote_ids();
        all.push(plane.me);
        Ok(Self {
            me: plane.me,
            id_space: max_id(&all).index() as u64 + 1,
            fuo_read: MajorityOp::new(plane, Kind::FuoRead, 1)?,
            fuo_write: MajorityOp::new(plane, Kind::FuoWrite, 1)?,
            proposal_read: MajorityOp::new(plane, Kind::ProposalRead, 1)?,
            proposal_write: MajorityOp::new(plane, Kind::ProposalWrite, 1)?,
            scratch,
            log,
            candidate: 0,
        })
    }

    /// Reads every peer's first-undecided-offset and adopts the maximum.
    /// Returns the adopted value.
    pub async fn catch_fuo(
        &mut self,
        ctx: &ctx::Ctx,
        leader_intact: &(dyn Fn() -> bool + Sync),
    ) -> Result<u64, MajorityError> {
        let scratch = self.scratch.clone();
        self.fuo_read
            .read(
                ctx,
                &|pid| scratch.fuo_read_offset(pid),
                8,
                self.log.header_region_offset(),
                leader_intact,
            )
            .await?;
        let local = self.log.header_first_undecided_offset();
        let mut adopted = local;
        for pid in self.fuo_read.successes() {
            adopted = adopted.max(self.scratch.read_cell(self.scratch.fuo_read_offset(*pid)));
        }
        if adopted > local {
            tracing::debug!("adopting first-undecided-offset {adopted} (was {local})");
            self.log.update_header_first_undecided_offset(adopted);
        }
        Ok(adopted)
    }

    /// Pushes the adopted first-undecided-offset to the followers.
    pub async fn update_followers(
        &mut self,
        ctx: &ctx::Ctx,
        leader_intact: &(dyn Fn() -> bool + Sync),
    ) -> Result<(), MajorityError> {
        self.fuo_write
            .write(
                ctx,
                self.log.header_region_offset(),
                8,
                self.log.header_region_offset(),
                leader_intact,
            )
            .await
    }

    /// Reads every peer's proposal floor and establishes a candidate
    /// strictly greater than everything seen. Fails with
    /// [`CatchUpError::Retry`] when a previously-established candidate has
    /// been overtaken; the recomputed candidate is ready on the next call.
    pub async fn catch_proposal(
        &mut self,
        ctx: &ctx::Ctx,
        leader_intact: &(dyn Fn() -> bool + Sync),
    ) -> Result<(), CatchUpError> {
        let scratch = self.scratch.clone();
        self.proposal_read
            .read(
                ctx,
                &|pid| scratch.proposal_read_offset(pid),
                8,
                self.log.proposal_region_offset(),
                leader_intact,
            )
            .await?;
        let mut seen = self.log.min_proposal();
        for pid in self.proposal_read.successes() {
            seen = seen.max(self.scratch.read_cell(self.scratch.proposal_read_offset(*pid)));
        }
        let previous = self.candidate;
        if previous != 0 && seen < previous {
            return Ok(());
        }
        self.candidate = self.ballot_above(seen);
        if previous != 0 {
            return Err(CatchUpError::Retry);
        }
        Ok(())
    }

    /// Raises the local proposal floor to the established candidate and
    /// pushes it to the followers.
    pub async fn update_with_current_proposal(
        &mut self,
        ctx: &ctx::Ctx,
        leader_intact: &(dyn Fn() -> bool + Sync),
    ) -> Result<(), MajorityError> {
        self.log.set_min_proposal(self.candidate);
        self.proposal_write
            .write(
                ctx,
                self.log.proposal_region_offset(),
                8,
                self.log.proposal_region_offset(),
                leader_intact,
            )
            .await
    }

    /// The established proposal number.
    pub fn proposal(&self) -> u64 {
        self.candidate
    }

    /// Re-arms whichever step failed.
    pub fn recover(&mut self, err: &MajorityError) {
        let MajorityError::Quorum { kind, .. } = err else {
            return;
        };
        match kind {
            Kind::FuoRead => self.fuo_read.recover(err),
            Kind::FuoWrite => self.fuo_write.recover(err),
            Kind::ProposalRead => self.proposal_read.recover(err),
            Kind::ProposalWrite => self.proposal_write.recover(err),
            _ => tracing::warn!("cannot recover a foreign operation: {err}"),
        }
    }

    /// Smallest proposal in this replica's residue class strictly above
    /// `seen`.
    fn ballot_above(&self, seen: u64) -> u64 {
        let mut ballot = seen - seen % self.id_space + self.me.index() as u64;
        while ballot <= seen {
            ballot += self.id_space;
        }
        ballot
    }
}
