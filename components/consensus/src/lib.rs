//! The consensus engine: a crash-fault-tolerant replicated log whose data
//! plane moves bytes exclusively through one-sided remote-memory
//! operations.
//!
//! Clients submit opaque payloads through [`Consensus::propose`]; the
//! engine decides a total order over them and invokes a caller-supplied
//! commit handler once an entry is safely replicated on a majority.
//! Leadership is established by heartbeat scoring and moved between
//! replicas with a two-step permission handoff that never leaves two
//! writers holding rights to the same log.

use std::fmt;

mod config;
mod engine;
mod follower;
mod heartbeat;
mod metrics;
mod permission;
mod switcher;
mod token;

pub mod testonly;
#[cfg(test)]
mod tests;

pub use config::Config;
pub use engine::{Consensus, ConsensusRunner, ProposeError};
pub use onesided_transport::ReplicaId;
pub use token::{Leader, LeaderToken};

/// Caller-supplied sink for decided entries. Invoked synchronously on the
/// thread that discovered the decision: the proposer for its own fast-path
/// decisions, the follower loop for remotely-driven ones.
pub trait CommitHandler: fmt::Debug + Send + Sync {
    /// Called once per decided entry, in log-offset order. `is_leader`
    /// reports this replica's role at delivery time.
    fn commit(&self, is_leader: bool, payload: &[u8]);
}
