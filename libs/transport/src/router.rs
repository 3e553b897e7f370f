//! Kind-based routing over a shared completion queue.
//!
//! The background plane carries heartbeat and handoff completions on one
//! queue, consumed by different loops. The router drains the underlying
//! queue and buckets completions by kind, so each consumer sees only its
//! own class regardless of which consumer happened to drain the queue.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};

use crate::{
    conn::{Completion, CompletionQueue},
    tag::{Kind, Tag},
};

const DRAIN_CHUNK: usize = 64;

#[derive(Debug, Default)]
struct Buckets {
    by_kind: HashMap<Kind, VecDeque<Completion>>,
}

/// Splits one completion queue into per-kind queues.
#[derive(Debug)]
pub struct KindRouter {
    cq: Arc<dyn CompletionQueue>,
    buckets: Mutex<Buckets>,
}

impl KindRouter {
    /// Wraps a completion queue.
    pub fn new(cq: Arc<dyn CompletionQueue>) -> Arc<Self> {
        Arc::new(Self {
            cq,
            buckets: Mutex::new(Buckets::default()),
        })
    }

    /// Registers `kind` and returns its routed queue. Completions of kinds
    /// nobody registered are dropped.
    pub fn handle(self: &Arc<Self>, kind: Kind) -> KindQueue {
        self.lock().by_kind.entry(kind).or_default();
        KindQueue {
            router: self.clone(),
            kind,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Buckets> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drains the shared queue into the buckets. Returns false if the
    /// underlying queue failed.
    fn refill(&self, buckets: &mut Buckets) -> bool {
        let mut drained = Vec::new();
        if !self.cq.poll(DRAIN_CHUNK, &mut drained) {
            return false;
        }
        for entry in drained {
            let Some(tag) = Tag::unpack(entry.tag) else {
                tracing::warn!("dropping completion with malformed tag {:#x}", entry.tag);
                continue;
            };
            match buckets.by_kind.get_mut(&tag.kind) {
                Some(queue) => queue.push_back(entry),
                None => tracing::trace!("dropping unrouted {:?} completion", tag.kind),
            }
        }
        true
    }
}

/// Routed view of a shared completion queue, restricted to one kind.
#[derive(Debug)]
pub struct KindQueue {
    router: Arc<KindRouter>,
    kind: Kind,
}

impl CompletionQueue for KindQueue {
    fn poll(&self, max: usize, out: &mut Vec<Completion>) -> bool {
        out.clear();
        let mut buckets = self.router.lock();
        if !self.router.refill(&mut buckets) {
            return false;
        }
        let queue = buckets
            .by_kind
            .get_mut(&self.kind)
            .expect("handle exists, kind is registered");
        while out.len() < max {
            let Some(entry) = queue.pop_front() else { break };
            out.push(entry);
        }
        true
    }
}
