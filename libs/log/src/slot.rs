use crate::align_up;

/// Byte size of the slot header: proposal, FUO snapshot, payload length.
pub const SLOT_HEADER: usize = 24;

/// Marker payload prefix of a recycle request slot.
const RECYCLE_MAGIC: [u8; 8] = *b"\x00rcycle\x7f";

/// One decoded log entry.
///
/// The wire form is `[proposal:u64][fuo_snapshot:u64][len:u64][payload]`,
/// little-endian, padded with zeroes to an aligned footprint. The proposal
/// word doubles as the populated marker (a proposal number is never zero),
/// and it is placed first so that the region's write ordering makes a
/// nonzero proposal imply a fully visible slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slot {
    /// Proposal number the slot was accepted under.
    pub proposal: u64,
    /// The writer's first-undecided-offset at write time. Followers advance
    /// their own FUO to this value, so each replicated slot also decides
    /// everything before it.
    pub fuo_snapshot: u64,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

/// Outcome of parsing bytes that may hold a slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Parsed {
    /// No populated slot at this position.
    Empty,
    /// A slot is present but the supplied bytes do not cover it; retry the
    /// read with at least `footprint` bytes.
    Truncated {
        /// Full aligned footprint of the slot.
        footprint: u64,
    },
    /// A fully decoded slot.
    Slot(Slot),
}

impl Slot {
    /// Creates a slot.
    pub fn new(proposal: u64, fuo_snapshot: u64, payload: Vec<u8>) -> Self {
        Self {
            proposal,
            fuo_snapshot,
            payload,
        }
    }

    /// Builds a recycle request: a slot whose FUO snapshot is zero and
    /// whose payload names the offset the log was recycled at.
    pub fn recycle_request(proposal: u64, recycled_at: u64) -> Self {
        let mut payload = RECYCLE_MAGIC.to_vec();
        payload.extend_from_slice(&recycled_at.to_le_bytes());
        Self::new(proposal, 0, payload)
    }

    /// Whether this slot is a recycle request. Only meaningful for slots
    /// found at a nonzero offset; the genuine first slot of a fresh log
    /// also carries a zero FUO snapshot.
    pub fn is_recycle_request(&self) -> bool {
        self.fuo_snapshot == 0 && self.payload.starts_with(&RECYCLE_MAGIC)
    }

    /// Aligned footprint of a slot with `payload_len` payload bytes.
    pub fn footprint_of(payload_len: usize) -> u64 {
        align_up((SLOT_HEADER + payload_len) as u64)
    }

    /// Aligned footprint of this slot.
    pub fn footprint(&self) -> u64 {
        Self::footprint_of(self.payload.len())
    }

    /// Encodes the slot into its padded wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0; self.footprint() as usize];
        out[0..8].copy_from_slice(&self.proposal.to_le_bytes());
        out[8..16].copy_from_slice(&self.fuo_snapshot.to_le_bytes());
        out[16..24].copy_from_slice(&(self.payload.len() as u64).to_le_bytes());
        out[SLOT_HEADER..SLOT_HEADER + self.payload.len()].copy_from_slice(&self.payload);
        out
    }

    /// Parses a slot out of `raw`. `limit` bounds how large a credible
    /// footprint can be (the remaining log capacity at the slot's offset);
    /// anything claiming more is treated as garbage.
    pub fn parse(raw: &[u8], limit: u64) -> Parsed {
        if raw.len() < SLOT_HEADER {
            return Parsed::Empty;
        }
        let word = |at: usize| u64::from_le_bytes(raw[at..at + 8].try_into().expect("8 bytes"));
        let proposal = word(0);
        let fuo_snapshot = word(8);
        let len = word(16);
        if proposal == 0 || len == 0 {
            return Parsed::Empty;
        }
        let footprint = align_up(SLOT_HEADER as u64 + len);
        if footprint > limit {
            return Parsed::Empty;
        }
        if (SLOT_HEADER as u64 + len) as usize > raw.len() {
            return Parsed::Truncated { footprint };
        }
        Parsed::Slot(Self {
            proposal,
            fuo_snapshot,
            payload: raw[SLOT_HEADER..SLOT_HEADER + len as usize].to_vec(),
        })
    }
}
