use onesided_transport::{Kind, ReplicaId};
use zksync_concurrency::ctx;

/// Why a majority operation could not complete.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QuorumFailure {
    /// A connection refused to accept the posted operation.
    #[error("post rejected by the connection to replica {0}")]
    PostRejected(ReplicaId),
    /// The completion queue itself failed.
    #[error("completion queue failed")]
    PollFailed,
    /// More distinct replicas failed than the cluster tolerates.
    #[error("more replicas failed than the cluster tolerates")]
    Unrecoverable,
    /// Leadership moved away while waiting for acknowledgements.
    #[error("leadership lost while waiting for acknowledgements")]
    LeaderChanged,
    /// A pipelined fast-path write did not reach a quorum.
    #[error("fast-path write did not reach a quorum")]
    FastPath,
}

/// Error of a majority operation.
///
/// A `Quorum` error carries the sequence the failed request was posted
/// under; the operation must be re-armed with `recover` before the same
/// kind of operation is retried.
#[derive(Debug, thiserror::Error)]
pub enum MajorityError {
    /// The surrounding context was canceled mid-operation.
    #[error(transparent)]
    Canceled(#[from] ctx::Canceled),
    /// The quorum could not be reached.
    #[error("{kind:?} quorum failed at sequence {req}: {cause}")]
    Quorum {
        /// Kind of the failed operation.
        kind: Kind,
        /// Sequence the failed request was posted under.
        req: u64,
        /// Failure reason.
        cause: QuorumFailure,
    },
}
