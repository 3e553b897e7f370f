//! Plumbing for replication over one-sided remote-memory operations.
//!
//! This crate defines the interface boundary towards the actual transport
//! (posting one-sided reads/writes, polling completion queues, switching
//! access rights) together with the pieces both sides of that boundary
//! agree on: the request-tag wire format, the shared-memory region type and
//! its scratchpad layout. The only in-tree implementation of the interface
//! is the in-process fabric in [`testonly`].

mod conn;
mod layout;
mod memory;
mod replica;
mod rights;
mod router;
mod tag;

pub mod testonly;

pub use conn::{Completion, CompletionQueue, Connection, Op, Plane, Planes};
pub use layout::{Scratchpad, CELL_SIZE, ENTRY_READ_CAP};
pub use memory::{Memory, ALIGNMENT};
pub use replica::{max_id, validate_ids, ReplicaId, ID_GAP_FACTOR};
pub use rights::Rights;
pub use router::{KindQueue, KindRouter};
pub use tag::{Kind, Tag, SEQ_BITS};
