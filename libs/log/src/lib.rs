//! The replicated log: a shared-memory byte region holding a header and a
//! sequence of aligned slots.
//!
//! The header's *first-undecided-offset* (FUO) separates decided from
//! undecided entries; a slot is decided once the FUO has moved past it.
//! Writers append at the FUO, remote peers replicate slots with one-sided
//! writes at the same offsets, and two cursors traverse the entry area:
//! one sampling for freshly accepted slots, one delivering decided slots
//! in offset order.

mod iter;
mod log;
mod predictor;
mod slot;

#[cfg(test)]
mod tests;

pub use iter::{BlockingIterator, LiveIterator};
pub use log::{Log, SlotLocation, LOG_HEADER, MAX_SLOT_FOOTPRINT};
pub use predictor::ReadSizePredictor;
pub use slot::{Parsed, Slot, SLOT_HEADER};

use onesided_transport::ALIGNMENT;

/// Rounds `n` up to the slot alignment.
pub fn align_up(n: u64) -> u64 {
    let a = ALIGNMENT as u64;
    (n + a - 1) & !(a - 1)
}
