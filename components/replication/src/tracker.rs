use onesided_transport::{max_id, Completion, Kind, ReplicaId, Tag};

/// Counts distinct failed replicas for one kind of operation, starting at
/// a tracked sequence. Once more replicas fail than the cluster tolerates,
/// the operation cannot reach a majority and must be surfaced rather than
/// retried blindly.
#[derive(Debug)]
pub struct FailureTracker {
    kind: Kind,
    tolerated: usize,
    failures: Vec<bool>,
    track_from: u64,
    failed: usize,
}

impl FailureTracker {
    /// Constructs an idle tracker tolerating `tolerated` distinct failed
    /// replicas.
    pub fn new(kind: Kind, remote_ids: &[ReplicaId], tolerated: usize) -> Self {
        let slots = max_id(remote_ids).index() + 1;
        Self {
            kind,
            tolerated,
            failures: vec![false; slots],
            track_from: 0,
            failed: 0,
        }
    }

    /// Forgets all tracked failures and disarms the tracker.
    pub fn reset(&mut self) {
        self.track_from = 0;
        self.failed = 0;
        self.failures.fill(false);
    }

    /// Arms tracking from `seq` onward. A no-op while already armed, so a
    /// round cannot accidentally re-track mid-flight.
    pub fn track(&mut self, seq: u64) {
        if self.track_from == 0 {
            self.track_from = seq;
        }
    }

    /// Folds failed completions in and reports whether the tolerated
    /// failure count is now exceeded.
    pub fn is_unrecoverable(&mut self, entries: &[Completion]) -> bool {
        for entry in entries {
            if !entry.ok {
                let Some(tag) = Tag::unpack(entry.tag) else {
                    tracing::warn!("malformed completion tag {:#x}", entry.tag);
                    continue;
                };
                let index = tag.replica.index();
                if tag.kind == self.kind
                    && tag.seq >= self.track_from
                    && self.failures.get(index) == Some(&false)
                {
                    self.failures[index] = true;
                    self.failed += 1;
                } else {
                    tracing::trace!("unrelated remnant failure in polled completions");
                }
            }
            if self.failed > self.tolerated {
                return true;
            }
        }
        false
    }
}
