use std::sync::Arc;

use onesided_log::{Log, Parsed, ReadSizePredictor, Slot, MAX_SLOT_FOOTPRINT};
use onesided_transport::{Kind, Plane, ReplicaId, Scratchpad};
use zksync_concurrency::ctx;

use crate::{error::MajorityError, majority::MajorityOp};

const INITIAL_READ: u64 = 1024;

/// Slow-path reader of remote log slots: majority-reads the bytes at a
/// given log offset from every peer into per-replica scratchpad buffers
/// and decodes whatever was populated.
#[derive(Debug)]
pub struct SlotReader {
    op: MajorityOp,
    scratch: Arc<Scratchpad>,
    log: Log,
    predictor: ReadSizePredictor,
}

impl SlotReader {
    /// Constructs a reader over the replication plane.
    pub fn new(plane: &Plane, scratch: Arc<Scratchpad>, log: Log) -> anyhow::Result<Self> {
        Ok(Self {
            op: MajorityOp::new(plane, Kind::EntryRead, 1)?,
            scratch,
            log,
            predictor: ReadSizePredictor::new(INITIAL_READ),
        })
    }

    /// Reads the slot at `offset` from a majority of peers. Returns the
    /// decoded slots of the peers that had one there. Reads are sized by
    /// the footprint predictor; a truncated decode triggers one exact-size
    /// re-read.
    pub async fn read_slot_at(
        &mut self,
        ctx: &ctx::Ctx,
        offset: u64,
        leader_intact: &(dyn Fn() -> bool + Sync),
    ) -> Result<Vec<(ReplicaId, Slot)>, MajorityError> {
        let capacity = self.log.entry_capacity();
        if offset >= capacity {
            return Ok(Vec::new());
        }
        let limit = (capacity - offset).min(MAX_SLOT_FOOTPRINT);
        let len = self.predictor.predict().min(limit);

        let mut out = self.read_round(ctx, offset, len, leader_intact).await?;
        let needed = out
            .iter()
            .filter_map(|r| match r {
                RoundResult::Truncated(footprint) => Some(*footprint),
                RoundResult::Decoded(..) => None,
            })
            .max();
        if let Some(footprint) = needed {
            tracing::trace!("re-reading remote slots with exact footprint {footprint}");
            out = self
                .read_round(ctx, offset, footprint.min(limit), leader_intact)
                .await?;
        }
        Ok(out
            .into_iter()
            .filter_map(|r| match r {
                RoundResult::Decoded(pid, slot) => Some((pid, slot)),
                RoundResult::Truncated(_) => None,
            })
            .collect())
    }

    /// Folds an observed slot footprint into the read-size predictor.
    pub fn adjust(&mut self, footprint: u64) {
        self.predictor.adjust(footprint);
    }

    /// Re-arms the underlying majority operation after an error.
    pub fn recover(&mut self, err: &MajorityError) {
        self.op.recover(err);
    }

    async fn read_round(
        &mut self,
        ctx: &ctx::Ctx,
        offset: u64,
        len: u64,
        leader_intact: &(dyn Fn() -> bool + Sync),
    ) -> Result<Vec<RoundResult>, MajorityError> {
        let scratch = self.scratch.clone();
        self.op
            .read(
                ctx,
                &|pid| scratch.entry_read_offset(pid),
                len as usize,
                self.log.region_offset(offset),
                leader_intact,
            )
            .await?;
        let limit = self.log.entry_capacity() - offset;
        let mut out = Vec::new();
        for pid in self.op.successes() {
            let raw = self
                .scratch
                .memory()
                .read_vec(self.scratch.entry_read_offset(*pid), len as usize);
            match Slot::parse(&raw, limit) {
                Parsed::Slot(slot) => out.push(RoundResult::Decoded(*pid, slot)),
                Parsed::Truncated { footprint } => out.push(RoundResult::Truncated(footprint)),
                Parsed::Empty => tracing::trace!("nothing to read from replica {pid}"),
            }
        }
        Ok(out)
    }
}

#[derive(Debug)]
enum RoundResult {
    Decoded(ReplicaId, Slot),
    Truncated(u64),
}
