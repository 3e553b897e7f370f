use onesided_log::{Slot, MAX_SLOT_FOOTPRINT};
use onesided_transport::{validate_ids, ReplicaId};

/// Smallest and largest supported cluster sizes (self included). The
/// protocol targets a handful of cooperating processes on one fabric.
const MIN_REPLICAS: usize = 3;
const MAX_REPLICAS: usize = 8;

/// Consensus engine configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Id of this replica.
    pub my_id: ReplicaId,
    /// Ids of the other replicas.
    pub peers: Vec<ReplicaId>,
    /// How many fast-path writes may remain unacknowledged before further
    /// proposals wait for completions.
    pub outstanding: u64,
    /// Largest accepted payload, in bytes.
    pub max_payload_size: usize,
    /// Whether fast-path writes go through the aggregating sideband
    /// intermediary instead of one write per replica.
    pub use_sideband: bool,
}

impl Config {
    /// Validates the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let total = self.peers.len() + 1;
        anyhow::ensure!(
            (MIN_REPLICAS..=MAX_REPLICAS).contains(&total),
            "cluster of {total} processes is outside the supported {MIN_REPLICAS}..={MAX_REPLICAS}"
        );
        validate_ids(self.my_id, &self.peers)?;
        anyhow::ensure!(self.outstanding >= 1, "at least one outstanding write");
        let max_payload = self.max_payload_size;
        anyhow::ensure!(
            max_payload > 0 && Slot::footprint_of(max_payload) <= MAX_SLOT_FOOTPRINT,
            "maximum payload of {max_payload} bytes does not fit a log slot"
        );
        Ok(())
    }
}
