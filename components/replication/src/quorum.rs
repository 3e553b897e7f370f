use onesided_transport::{max_id, Completion, Kind, ReplicaId, Tag};

/// Per-replica sequence scoreboard deciding when a majority of remote
/// replicas has acknowledged an operation of one kind.
///
/// Each replica's entry holds the last sequence it acknowledged. An entry
/// advances only on the exact successor sequence (`current + modulo`); any
/// gap resets it to the zero sentinel, forcing that replica to restart
/// tracking for the current round. Once `quorum_size` distinct replicas
/// reach the target, the target rolls forward by `modulo`.
#[derive(Debug)]
pub struct QuorumWaiter {
    kind: Kind,
    scoreboard: Vec<u64>,
    quorum_size: usize,
    left: usize,
    next_id: u64,
    fast_id: u64,
    modulo: u64,
}

impl QuorumWaiter {
    /// Constructs a waiter expecting sequences starting at `next_id`,
    /// advancing by 1 per operation.
    pub fn new(
        kind: Kind,
        remote_ids: &[ReplicaId],
        quorum_size: usize,
        next_id: u64,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(next_id > 0, "sequence numbers are positive");
        anyhow::ensure!(quorum_size > 0, "quorum size must be positive");
        anyhow::ensure!(
            quorum_size <= remote_ids.len(),
            "quorum of {quorum_size} exceeds the {} remote replicas",
            remote_ids.len()
        );
        let modulo = 1;
        let slots = max_id(remote_ids).index() + 1;
        Ok(Self {
            kind,
            scoreboard: vec![next_id - modulo; slots],
            quorum_size,
            left: quorum_size,
            next_id,
            fast_id: next_id,
            modulo,
        })
    }

    /// Kind of operation this waiter tracks.
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Sequence currently being waited for.
    pub fn req_id(&self) -> u64 {
        self.next_id
    }

    /// Sequence of the operation after the current one.
    pub fn next_req_id(&self) -> u64 {
        self.next_id + self.modulo
    }

    /// Re-bases the pipelined sequence counter.
    pub fn set_fast_req_id(&mut self, id: u64) {
        self.fast_id = id;
    }

    /// Claims the next pipelined sequence.
    pub fn fetch_and_inc_fast_id(&mut self) -> u64 {
        let id = self.fast_id;
        self.fast_id += self.modulo;
        id
    }

    /// Next unclaimed pipelined sequence.
    pub fn next_fast_req_id(&self) -> u64 {
        self.fast_id
    }

    /// Folds completions into the scoreboard. Replicas reaching the target
    /// are appended to `successful`. Returns false if any completion
    /// carried a failure status (the scoreboard is still updated for the
    /// successful ones).
    pub fn consume(&mut self, entries: &[Completion], successful: &mut Vec<ReplicaId>) -> bool {
        let mut all_ok = true;
        for entry in entries {
            if !entry.ok {
                all_ok = false;
                continue;
            }
            let Some(tag) = Tag::unpack(entry.tag) else {
                tracing::warn!("malformed completion tag {:#x}", entry.tag);
                continue;
            };
            if tag.kind != self.kind {
                continue;
            }
            self.advance(tag, successful);
        }
        all_ok
    }

    /// Fast-path variant: fails outright on any unsuccessful completion,
    /// and accepts an aggregated sideband acknowledgement in place of the
    /// whole per-replica round.
    pub fn fast_consume(&mut self, entries: &[Completion]) -> bool {
        for entry in entries {
            if !entry.ok {
                return false;
            }
            let Some(tag) = Tag::unpack(entry.tag) else {
                tracing::warn!("malformed completion tag {:#x}", entry.tag);
                continue;
            };
            if tag.kind == Kind::SidebandWrite {
                // One intermediary write stands in for every per-replica
                // write of the round.
                let next = self.next_id + self.modulo;
                self.reset(next);
                continue;
            }
            if tag.kind != self.kind {
                continue;
            }
            self.advance(tag, &mut Vec::new());
        }
        true
    }

    fn advance(&mut self, tag: Tag, successful: &mut Vec<ReplicaId>) {
        let Some(entry) = self.scoreboard.get_mut(tag.replica.index()) else {
            tracing::warn!("completion for unknown replica {}", tag.replica);
            return;
        };
        *entry = if *entry + self.modulo == tag.seq {
            tag.seq
        } else {
            0
        };
        if *entry == self.next_id {
            self.left -= 1;
            successful.push(tag.replica);
        }
        if self.left == 0 {
            self.left = self.quorum_size;
            self.next_id += self.modulo;
        }
    }

    /// Whether the quorum target has reached `expected`.
    pub fn can_continue_with(&self, expected: u64) -> bool {
        self.next_id >= expected
    }

    /// Whether the target is within `outstanding` operations of
    /// `expected`; callers pipelining writes may proceed that far ahead
    /// of full confirmation.
    pub fn can_continue_with_outstanding(&self, outstanding: u64, expected: u64) -> bool {
        self.next_id + outstanding * self.modulo >= expected
    }

    /// Number of replicas positioned to acknowledge the current target.
    pub fn maximum_responses(&self) -> usize {
        self.scoreboard
            .iter()
            .filter(|v| **v + self.modulo == self.next_id)
            .count()
    }

    /// Re-arms the scoreboard relative to a new starting sequence. The
    /// pipelined counter is left alone; it is re-based by the next
    /// confirmed non-pipelined operation.
    pub fn reset(&mut self, next: u64) {
        assert!(next > 0, "sequence numbers are positive");
        for entry in &mut self.scoreboard {
            *entry = next - self.modulo;
        }
        self.left = self.quorum_size;
        self.next_id = next;
    }
}
