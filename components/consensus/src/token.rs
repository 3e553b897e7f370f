use onesided_transport::ReplicaId;
use zksync_concurrency::sync;

/// The leader token: the shared record naming the current or aspiring
/// leader and its request value.
///
/// Identity is `(requester, value)` only: the `reset` and `unused` flags
/// do not participate in comparisons, so marking a token consumed does not
/// look like a leader change to observers.
#[derive(Clone, Copy, Debug)]
pub struct Leader {
    requester: ReplicaId,
    value: u64,
    reset: bool,
    unused: bool,
}

impl Leader {
    /// A token naming `requester` with its request `value`.
    pub fn new(requester: ReplicaId, value: u64, reset: bool) -> Self {
        Self {
            requester,
            value,
            reset,
            unused: false,
        }
    }

    /// Replica asking for (or holding) write authority.
    pub fn requester(&self) -> ReplicaId {
        self.requester
    }

    /// The request value it published.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// The initial token: nobody has asked for anything yet.
    pub fn unclaimed() -> Self {
        Self {
            requester: ReplicaId(0),
            value: 0,
            reset: false,
            unused: true,
        }
    }

    /// Whether this token has already been fully served (or never named
    /// anyone). A served token is not granted again.
    pub fn is_unused(&self) -> bool {
        self.unused
    }

    /// Whether the requester demands a hard connection reset instead of a
    /// rights switch.
    pub fn wants_reset(&self) -> bool {
        self.reset
    }

    /// A copy of this token marked as served.
    pub fn make_unused(mut self) -> Self {
        self.unused = true;
        self
    }
}

impl PartialEq for Leader {
    fn eq(&self, other: &Self) -> bool {
        self.requester == other.requester && self.value == other.value
    }
}

impl Eq for Leader {}

/// Shared holder of the current [`Leader`] token. All mutation goes
/// through plain stores (publishing a newly observed request) or
/// compare-and-swap (consuming a token); a failed swap means a newer
/// leader exists and the caller must re-derive its state.
#[derive(Debug)]
pub struct LeaderToken(sync::watch::Sender<Leader>);

impl Default for LeaderToken {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaderToken {
    /// Constructs an unclaimed token.
    pub fn new() -> Self {
        Self(sync::watch::channel(Leader::unclaimed()).0)
    }

    /// Current token.
    pub fn load(&self) -> Leader {
        *self.0.borrow()
    }

    /// Publishes a token unconditionally.
    pub fn store(&self, leader: Leader) {
        self.0.send_replace(leader);
    }

    /// Replaces `expected` with `desired` atomically. Returns false if the
    /// stored token is not `expected` anymore.
    pub fn compare_exchange(&self, expected: Leader, desired: Leader) -> bool {
        let mut swapped = false;
        self.0.send_if_modified(|current| {
            if *current == expected {
                *current = desired;
                swapped = true;
                true
            } else {
                false
            }
        });
        swapped
    }

    /// A watch on token changes.
    pub fn subscribe(&self) -> sync::watch::Receiver<Leader> {
        self.0.subscribe()
    }
}
