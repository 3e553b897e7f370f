use crate::{
    log::Log,
    slot::{Parsed, Slot},
};

/// Cursor sampling the entry area for freshly accepted slots.
///
/// The proposer uses it to detect its own just-replicated slot, the
/// follower to detect slots a remote leader wrote into the local log.
/// Sampling is non-destructive with respect to the log; the cursor only
/// tracks its own position.
#[derive(Debug)]
pub struct BlockingIterator {
    log: Log,
    pos: u64,
}

impl BlockingIterator {
    pub(crate) fn new(log: Log, pos: u64) -> Self {
        Self { log, pos }
    }

    /// If a populated slot sits at the cursor, advances past it and
    /// returns its offset and contents.
    pub fn sample_next(&mut self) -> Option<(u64, Slot)> {
        match self.log.parse_at(self.pos) {
            Parsed::Slot(slot) => {
                let at = self.pos;
                self.pos += slot.footprint();
                Some((at, slot))
            }
            // The local view never truncates; treat like not-yet-written.
            Parsed::Empty | Parsed::Truncated { .. } => None,
        }
    }

    /// Reattaches the cursor at the current first-undecided-offset. Used
    /// when the local log may have been rewritten under a new leader.
    pub fn reattach(&mut self) {
        self.pos = self.log.header_first_undecided_offset();
    }

    /// Current cursor position.
    pub fn position(&self) -> u64 {
        self.pos
    }
}

/// Cursor delivering decided slots in offset order.
#[derive(Debug)]
pub struct LiveIterator {
    log: Log,
    pos: u64,
}

impl LiveIterator {
    pub(crate) fn new(log: Log, pos: u64) -> Self {
        Self { log, pos }
    }

    /// Whether a deliverable slot sits below `fuo`.
    pub fn has_next(&self, fuo: u64) -> bool {
        self.pos < fuo && matches!(self.log.parse_at(self.pos), Parsed::Slot(_))
    }

    /// Delivers the slot at the cursor, advancing past it.
    pub fn next(&mut self) -> Option<(u64, Slot)> {
        match self.log.parse_at(self.pos) {
            Parsed::Slot(slot) => {
                let at = self.pos;
                self.pos += slot.footprint();
                Some((at, slot))
            }
            Parsed::Empty | Parsed::Truncated { .. } => None,
        }
    }

    /// Offset up to which slots have been delivered.
    pub fn delivered(&self) -> u64 {
        self.pos
    }
}
