use std::fmt;

/// Identifier of a replica. Positive; zero is reserved as a sentinel for
/// "no replica" (e.g. an unclaimed leader token).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaId(pub u16);

impl ReplicaId {
    /// Index form, for scoreboards and per-replica slot arrays.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Replica id sets are required to be dense: the largest id may not exceed
/// `ID_GAP_FACTOR` times the cluster size. Per-replica state is stored in
/// arrays indexed by id, so this bounds the wasted space.
pub const ID_GAP_FACTOR: usize = 4;

/// Largest id among `ids`.
pub fn max_id(ids: &[ReplicaId]) -> ReplicaId {
    ids.iter().copied().max().unwrap_or_default()
}

/// Validates a replica id set: ids must be positive, pairwise distinct and
/// dense (see [`ID_GAP_FACTOR`]).
pub fn validate_ids(me: ReplicaId, peers: &[ReplicaId]) -> anyhow::Result<()> {
    let mut all: Vec<_> = peers.to_vec();
    all.push(me);
    anyhow::ensure!(
        all.iter().all(|id| id.0 > 0),
        "replica ids must be positive"
    );
    let mut sorted = all.clone();
    sorted.sort_unstable();
    sorted.dedup();
    anyhow::ensure!(sorted.len() == all.len(), "replica ids must be distinct");
    let max = max_id(&all);
    anyhow::ensure!(
        max.index() <= ID_GAP_FACTOR * all.len(),
        "replica id {max} is too sparse for a cluster of {} processes",
        all.len()
    );
    Ok(())
}
