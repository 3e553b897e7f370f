//! Metrics for the consensus engine.

use std::time::Duration;

use vise::{Buckets, Counter, Gauge, Histogram, Metrics, Unit};

/// Metrics defined by the consensus engine.
#[derive(Debug, Metrics)]
#[metrics(prefix = "onesided_consensus")]
pub(crate) struct ConsensusMetrics {
    /// Latency of a successful propose call.
    #[metrics(buckets = Buckets::LATENCIES, unit = Unit::Seconds)]
    pub(crate) propose_latency: Histogram<Duration>,
    /// Proposals decided through the optimistic fast path.
    pub(crate) fast_path_proposes: Counter,
    /// Propose calls that entered the slow path.
    pub(crate) slow_path_proposes: Counter,
    /// Times this replica acquired leadership.
    pub(crate) leader_changes: Counter,
    /// Completed log recycling rounds.
    pub(crate) log_recycles: Counter,
    /// Current first-undecided-offset of the local log.
    pub(crate) first_undecided_offset: Gauge<u64>,
}

/// Global instance of [`ConsensusMetrics`].
#[vise::register]
pub(crate) static METRICS: vise::Global<ConsensusMetrics> = vise::Global::new();
