//! Request-tag wire format.
//!
//! Every posted one-sided operation carries a 64-bit tag identifying it in
//! the completion queue: the operation class, the replica it targets and a
//! per-class sequence number, packed as `[kind:8][replica:16][seq:40]`.
//! Completions of unrelated classes share a queue and are filtered by kind.

use crate::replica::ReplicaId;

/// Number of bits available for the sequence part of a tag.
pub const SEQ_BITS: u32 = 40;

const REPLICA_BITS: u32 = 16;
const SEQ_MASK: u64 = (1 << SEQ_BITS) - 1;

/// Operation classes carried in request tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    /// Replication of a log slot to a peer log.
    EntryWrite = 1,
    /// Slow-path read of a remote log slot.
    EntryRead = 2,
    /// Read of a peer's first-undecided-offset header field.
    FuoRead = 3,
    /// Push of the adopted first-undecided-offset to a peer.
    FuoWrite = 4,
    /// Read of a peer's lowest-acceptable-proposal header field.
    ProposalRead = 5,
    /// Push of the established proposal number to a peer.
    ProposalWrite = 6,
    /// Liveness counter update or probe.
    Heartbeat = 7,
    /// Leadership request written into a peer's request cell.
    LeaderRequest = 8,
    /// Leadership grant written into a requester's grant cell.
    LeaderGrant = 9,
    /// Aggregated fast-path write through a sideband intermediary.
    SidebandWrite = 10,
    /// Post-recycling probe of peer log headers.
    RecycleRead = 11,
}

impl Kind {
    fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::EntryWrite,
            2 => Self::EntryRead,
            3 => Self::FuoRead,
            4 => Self::FuoWrite,
            5 => Self::ProposalRead,
            6 => Self::ProposalWrite,
            7 => Self::Heartbeat,
            8 => Self::LeaderRequest,
            9 => Self::LeaderGrant,
            10 => Self::SidebandWrite,
            11 => Self::RecycleRead,
            _ => return None,
        })
    }
}

/// Decoded request tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tag {
    /// Operation class.
    pub kind: Kind,
    /// Replica the operation targets.
    pub replica: ReplicaId,
    /// Sequence number within the class; truncated to [`SEQ_BITS`] bits.
    pub seq: u64,
}

impl Tag {
    /// Constructs a tag.
    pub fn new(kind: Kind, replica: ReplicaId, seq: u64) -> Self {
        Self { kind, replica, seq }
    }

    /// Packs the tag into its 64-bit wire form.
    pub fn pack(self) -> u64 {
        ((self.kind as u64) << (REPLICA_BITS + SEQ_BITS))
            | ((self.replica.0 as u64) << SEQ_BITS)
            | (self.seq & SEQ_MASK)
    }

    /// Decodes a tag from its wire form. `None` for unknown kinds.
    pub fn unpack(raw: u64) -> Option<Self> {
        let kind = Kind::from_u8((raw >> (REPLICA_BITS + SEQ_BITS)) as u8)?;
        Some(Self {
            kind,
            replica: ReplicaId((raw >> SEQ_BITS) as u16),
            seq: raw & SEQ_MASK,
        })
    }
}
