use std::sync::Arc;

use onesided_transport::Memory;

use crate::{
    align_up,
    iter::{BlockingIterator, LiveIterator},
    slot::{Parsed, Slot},
};

/// Reserved prefix of the log area: `fuo` at offset 0, `min_proposal` at
/// offset 8, the rest padding up to one alignment unit.
pub const LOG_HEADER: usize = 64;

/// Upper bound on a single slot's footprint; keeps slow-path remote reads
/// within one scratchpad buffer.
pub const MAX_SLOT_FOOTPRINT: u64 = onesided_transport::ENTRY_READ_CAP as u64;

/// Free space below which recycling must run before further appends.
const CRITICAL_RESERVE: u64 = 2 * MAX_SLOT_FOOTPRINT;

const FUO_OFFSET: usize = 0;
const MIN_PROPOSAL_OFFSET: usize = 8;

/// Placement of an appended slot.
#[derive(Clone, Copy, Debug)]
pub struct SlotLocation {
    /// Offset within the entry area.
    pub offset: u64,
    /// Absolute offset within the shared region (for posting the local
    /// buffer of a one-sided write).
    pub region_offset: usize,
    /// Aligned footprint in bytes.
    pub size: u64,
}

/// View of the log area of a shared region.
///
/// Cheap to clone; all clones share the region. Mutation is expected to be
/// externally serialized (proposer/follower share one lock), except that
/// remote one-sided writes may land at any time.
#[derive(Clone, Debug)]
pub struct Log {
    mem: Arc<Memory>,
    base: usize,
    size: usize,
}

impl Log {
    /// Creates a log over `mem[base .. base + size]`.
    pub fn new(mem: Arc<Memory>, base: usize, size: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(base + size <= mem.len(), "log area out of region bounds");
        anyhow::ensure!(
            size as u64 > LOG_HEADER as u64 + CRITICAL_RESERVE,
            "log area of {size} bytes is too small"
        );
        Ok(Self { mem, base, size })
    }

    /// Current first-undecided-offset.
    pub fn header_first_undecided_offset(&self) -> u64 {
        self.mem.read_u64(self.base + FUO_OFFSET)
    }

    /// Advances the first-undecided-offset. Must only be called after the
    /// slots below `fuo` have been written to a majority; this is not
    /// checked here. A value at or below the current offset is ignored;
    /// the header only ever moves forward (a remote catch-up push may land
    /// between a caller's read and its update).
    ///
    /// # Panics
    /// If `fuo` is unaligned.
    pub fn update_header_first_undecided_offset(&self, fuo: u64) {
        assert_eq!(fuo, align_up(fuo), "unaligned first-undecided-offset");
        if fuo <= self.header_first_undecided_offset() {
            return;
        }
        self.mem.write_u64(self.base + FUO_OFFSET, fuo);
    }

    /// Lowest proposal number this replica will accept.
    pub fn min_proposal(&self) -> u64 {
        self.mem.read_u64(self.base + MIN_PROPOSAL_OFFSET)
    }

    /// Raises the lowest acceptable proposal number.
    pub fn set_min_proposal(&self, proposal: u64) {
        self.mem.write_u64(self.base + MIN_PROPOSAL_OFFSET, proposal);
    }

    /// Byte capacity of the entry area.
    pub fn entry_capacity(&self) -> u64 {
        (self.size - LOG_HEADER) as u64
    }

    /// Region offset of the log header (the FUO word).
    pub fn header_region_offset(&self) -> usize {
        self.base
    }

    /// Region offset of the `min_proposal` header word.
    pub fn proposal_region_offset(&self) -> usize {
        self.base + MIN_PROPOSAL_OFFSET
    }

    /// Region offset of the entry at `offset`.
    pub fn region_offset(&self, offset: u64) -> usize {
        self.base + LOG_HEADER + offset as usize
    }

    /// True when the remaining capacity no longer safely fits further
    /// appends and the log must be recycled.
    pub fn space_left_critical(&self) -> bool {
        self.entry_capacity() - self.header_first_undecided_offset() < CRITICAL_RESERVE
    }

    /// Resets the first-undecided-offset to zero. Recycling only.
    pub fn reset_fuo(&self) {
        self.mem.write_u64(self.base + FUO_OFFSET, 0);
    }

    /// Zeroes the entry area. Recycling only; the header (and in
    /// particular `min_proposal`) survives.
    pub fn bzero(&self) {
        self.mem.zero(self.base + LOG_HEADER, self.size - LOG_HEADER);
    }

    /// Encodes a new slot at the current first-undecided-offset.
    ///
    /// # Panics
    /// If the slot does not fit the remaining capacity or exceeds
    /// [`MAX_SLOT_FOOTPRINT`]; callers are expected to bound payloads and
    /// recycle in time.
    pub fn append(&self, proposal: u64, fuo_snapshot: u64, payload: &[u8]) -> SlotLocation {
        let slot = Slot::new(proposal, fuo_snapshot, payload.to_vec());
        let size = slot.footprint();
        assert!(size <= MAX_SLOT_FOOTPRINT, "slot footprint too large");
        let offset = self.header_first_undecided_offset();
        assert!(offset + size <= self.entry_capacity(), "log full");
        let region_offset = self.region_offset(offset);
        self.mem.write(region_offset, &slot.encode());
        SlotLocation {
            offset,
            region_offset,
            size,
        }
    }

    /// Copies a remotely-read slot into the local log at `offset`,
    /// overwriting its proposal number. Returns the slot's footprint.
    pub fn adopt(&self, offset: u64, slot: &Slot, proposal: u64) -> u64 {
        let fresh = Slot::new(proposal, slot.fuo_snapshot, slot.payload.clone());
        let size = fresh.footprint();
        assert!(offset + size <= self.entry_capacity(), "log full");
        self.mem.write(self.region_offset(offset), &fresh.encode());
        size
    }

    /// Parses whatever sits at `offset` in the entry area.
    pub fn parse_at(&self, offset: u64) -> Parsed {
        if offset >= self.entry_capacity() {
            return Parsed::Empty;
        }
        let limit = self.entry_capacity() - offset;
        let span = limit.min(MAX_SLOT_FOOTPRINT) as usize;
        let raw = self.mem.read_vec(self.region_offset(offset), span);
        Slot::parse(&raw, limit)
    }

    /// A cursor sampling for freshly accepted slots, attached at the
    /// current first-undecided-offset.
    pub fn blocking_iterator(&self) -> BlockingIterator {
        BlockingIterator::new(self.clone(), self.header_first_undecided_offset())
    }

    /// A cursor delivering decided slots in offset order, attached at the
    /// current first-undecided-offset.
    pub fn live_iterator(&self) -> LiveIterator {
        LiveIterator::new(self.clone(), self.header_first_undecided_offset())
    }
}
