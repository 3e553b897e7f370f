//! The interface boundary towards the transport: reliable one-sided
//! connections and completion queues.

use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{memory::Memory, replica::ReplicaId, rights::Rights, tag::Tag};

/// One-sided operation code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    /// Read remote memory into local memory.
    Read,
    /// Write local memory into remote memory.
    Write,
}

/// A completion polled from a completion queue. Matched back to its request
/// purely through the tag; completions may surface out of order and may
/// carry failure status (e.g. after an access-rights revocation).
#[derive(Clone, Copy, Debug)]
pub struct Completion {
    /// Packed request tag of the completed operation.
    pub tag: u64,
    /// Whether the operation succeeded.
    pub ok: bool,
}

/// A reliable connection to a single peer, supporting one-sided reads and
/// writes against the peer's shared region.
///
/// `post` returns whether the request was accepted; acceptance does not
/// imply success; the outcome is reported through the completion queue the
/// connection was created with. Local buffers are denoted by offsets into
/// the caller's own shared region, remote buffers by absolute addresses
/// (`remote_base() + region offset`; layouts are symmetric across replicas).
pub trait Connection: fmt::Debug + Send + Sync {
    /// Posts a one-sided operation.
    fn post(&self, op: Op, tag: Tag, local_offset: usize, len: usize, remote_addr: u64) -> bool;

    /// Base address of the peer's shared region.
    fn remote_base(&self) -> u64;

    /// Changes what the *peer* may do to the local region through this
    /// connection. Returns false if the transport rejected the change.
    fn change_rights(&self, rights: Rights) -> bool;

    /// Tears the connection down and re-establishes it with the given
    /// rights. Used only when rights switching alone cannot restore a
    /// consistent state.
    fn reconnect(&self, rights: Rights) -> bool;
}

/// A queue of completions for operations posted on its associated
/// connections.
pub trait CompletionQueue: fmt::Debug + Send + Sync {
    /// Drains up to `max` completions into `out` (cleared first). Returns
    /// false if the queue itself failed.
    fn poll(&self, max: usize, out: &mut Vec<Completion>) -> bool;
}

/// Connections of one replica on one plane (replication or background),
/// sharing a completion queue.
#[derive(Debug, Clone)]
pub struct Plane {
    /// Id of the local replica.
    pub me: ReplicaId,
    /// Connections to each peer, keyed by peer id.
    pub peers: BTreeMap<ReplicaId, Arc<dyn Connection>>,
    /// Completion queue shared by all connections of this plane.
    pub cq: Arc<dyn CompletionQueue>,
    /// Self-to-self connection, if the plane provides one.
    pub loopback: Option<Arc<dyn Connection>>,
}

impl Plane {
    /// Peer ids, ascending.
    pub fn remote_ids(&self) -> Vec<ReplicaId> {
        self.peers.keys().copied().collect()
    }
}

/// Everything the transport bootstrap hands to a replica: its shared
/// region and its two planes. The replication plane carries log writes and
/// is permission-switched by the handoff protocol; the background plane
/// carries heartbeats and handoff traffic and keeps full rights.
#[derive(Debug, Clone)]
pub struct Planes {
    /// The replica's shared memory region.
    pub memory: Arc<Memory>,
    /// Log replication plane.
    pub replication: Plane,
    /// Heartbeat and handoff plane; includes a loopback connection.
    pub background: Plane,
    /// Optional aggregating intermediary for fast-path writes.
    pub sideband: Option<Arc<dyn Connection>>,
}
