//! Scratchpad layout of the shared region.
//!
//! Every replica lays its region out identically, so a region offset
//! computed locally addresses the same cell on any peer. The scratchpad
//! occupies the front of the region: small fixed cells for heartbeat
//! counters, handoff request/grant values and header reads, plus larger
//! per-replica buffers for slow-path slot reads. Whatever remains becomes
//! the replicated log.

use std::sync::Arc;

use crate::{
    memory::{Memory, ALIGNMENT},
    replica::{max_id, ReplicaId},
};

/// Size of a small scratchpad cell.
pub const CELL_SIZE: usize = ALIGNMENT;

/// Capacity of a per-replica slot-read buffer.
pub const ENTRY_READ_CAP: usize = 4096;

/// Minimum size the log area must end up with.
const MIN_LOG_AREA: usize = 16 * 1024;

/// Carved-up view of the front of a shared region.
#[derive(Debug)]
pub struct Scratchpad {
    mem: Arc<Memory>,
    slots: usize,
    hb_counter: usize,
    hb_source: usize,
    hb_read: usize,
    request_out: usize,
    grant_out: usize,
    incoming_request: usize,
    incoming_grant: usize,
    fuo_read: usize,
    proposal_read: usize,
    entry_read: usize,
    log: usize,
}

impl Scratchpad {
    /// Lays out the scratchpad for the given id set (self included).
    /// Fails if the region cannot also fit a usable log area.
    pub fn new(mem: Arc<Memory>, ids: &[ReplicaId]) -> anyhow::Result<Self> {
        anyhow::ensure!(!ids.is_empty(), "empty replica set");
        // Slot arrays are indexed by id directly; index 0 stays unused.
        let slots = max_id(ids).index() + 1;
        let mut next = 0;
        let mut take = |cells: usize, cell_size: usize| {
            let at = next;
            next += cells * cell_size;
            at
        };
        let this = Self {
            hb_counter: take(1, CELL_SIZE),
            hb_source: take(1, CELL_SIZE),
            hb_read: take(slots, CELL_SIZE),
            request_out: take(1, CELL_SIZE),
            grant_out: take(1, CELL_SIZE),
            incoming_request: take(slots, CELL_SIZE),
            incoming_grant: take(slots, CELL_SIZE),
            fuo_read: take(slots, CELL_SIZE),
            proposal_read: take(slots, CELL_SIZE),
            entry_read: take(slots, ENTRY_READ_CAP),
            log: next,
            slots,
            mem,
        };
        anyhow::ensure!(
            this.log + MIN_LOG_AREA <= this.mem.len(),
            "shared region of {} bytes is too small ({} needed for the scratchpad alone)",
            this.mem.len(),
            this.log
        );
        Ok(this)
    }

    /// The underlying region.
    pub fn memory(&self) -> &Arc<Memory> {
        &self.mem
    }

    /// Cell holding this replica's own liveness counter; peers probe it
    /// with one-sided reads, the owner bumps it through its loopback.
    pub fn heartbeat_counter_offset(&self) -> usize {
        self.hb_counter
    }

    /// Staging cell the loopback write of the liveness counter copies from.
    pub fn heartbeat_source_offset(&self) -> usize {
        self.hb_source
    }

    /// Cell a probe of `id`'s liveness counter lands in.
    pub fn heartbeat_read_offset(&self, id: ReplicaId) -> usize {
        self.indexed(self.hb_read, id, CELL_SIZE)
    }

    /// Staging cell for outgoing leadership request values.
    pub fn request_out_offset(&self) -> usize {
        self.request_out
    }

    /// Staging cell for outgoing leadership grant values.
    pub fn grant_out_offset(&self) -> usize {
        self.grant_out
    }

    /// Cell that candidate `id` writes its leadership requests into; the
    /// local permission scanner watches these.
    pub fn incoming_request_offset(&self, id: ReplicaId) -> usize {
        self.indexed(self.incoming_request, id, CELL_SIZE)
    }

    /// Cell that granter `id` writes its handoff acknowledgements into; a
    /// local requester waits on these.
    pub fn incoming_grant_offset(&self, id: ReplicaId) -> usize {
        self.indexed(self.incoming_grant, id, CELL_SIZE)
    }

    /// Cell a read of `id`'s first-undecided-offset header lands in.
    pub fn fuo_read_offset(&self, id: ReplicaId) -> usize {
        self.indexed(self.fuo_read, id, CELL_SIZE)
    }

    /// Cell a read of `id`'s proposal header lands in.
    pub fn proposal_read_offset(&self, id: ReplicaId) -> usize {
        self.indexed(self.proposal_read, id, CELL_SIZE)
    }

    /// Buffer a slow-path read of a slot of `id`'s log lands in.
    pub fn entry_read_offset(&self, id: ReplicaId) -> usize {
        self.indexed(self.entry_read, id, ENTRY_READ_CAP)
    }

    /// Region offset where the log area begins.
    pub fn log_offset(&self) -> usize {
        self.log
    }

    /// Reads the `u64` stored in a cell.
    pub fn read_cell(&self, offset: usize) -> u64 {
        self.mem.read_u64(offset)
    }

    /// Stores a `u64` into a cell.
    pub fn write_cell(&self, offset: usize, value: u64) {
        self.mem.write_u64(offset, value);
    }

    fn indexed(&self, base: usize, id: ReplicaId, cell: usize) -> usize {
        assert!(id.index() < self.slots, "id {id} outside the laid-out set");
        base + id.index() * cell
    }
}
