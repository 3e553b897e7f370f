//! In-process fabric implementing the transport interface.
//!
//! Every replica gets a real shared region; one-sided operations are plain
//! memory copies between regions, completing synchronously into the
//! poster's queue. Access-rights checks are enforced the way a NIC would:
//! a post against a revoked connection is accepted but completes in error.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use crate::{
    conn::{Completion, CompletionQueue, Connection, Op, Plane, Planes},
    memory::Memory,
    replica::{validate_ids, ReplicaId},
    rights::Rights,
    tag::Tag,
};

/// Builder for fully-meshed in-process clusters.
#[derive(Debug)]
pub struct Fabric;

impl Fabric {
    /// Builds a full mesh over `ids`: per replica a shared region, a
    /// replication plane (local rights only, until a leader is granted
    /// more), a background plane with full rights and a loopback, and a
    /// sideband intermediary fanning writes out to all peers.
    pub fn full_mesh(
        region_size: usize,
        ids: &[ReplicaId],
    ) -> anyhow::Result<BTreeMap<ReplicaId, Planes>> {
        anyhow::ensure!(ids.len() >= 2, "a cluster needs at least two replicas");
        let (last, rest) = ids.split_last().expect("at least two ids");
        validate_ids(*last, rest)?;

        let memories: BTreeMap<_, _> = ids
            .iter()
            .map(|id| (*id, Arc::new(Memory::new(region_size))))
            .collect();

        // Rights cells per ordered (poster, target) pair and plane.
        let mut repl_rights = BTreeMap::new();
        let mut bg_rights = BTreeMap::new();
        for &a in ids {
            for &b in ids {
                if a == b {
                    continue;
                }
                repl_rights.insert((a, b), new_rights_cell(Rights::local()));
                bg_rights.insert((a, b), new_rights_cell(Rights::full()));
            }
        }

        let mut out = BTreeMap::new();
        for &a in ids {
            let repl_cq = Arc::new(Cq::default());
            let bg_cq = Arc::new(Cq::default());

            let mut repl_peers: BTreeMap<ReplicaId, Arc<dyn Connection>> = BTreeMap::new();
            let mut bg_peers: BTreeMap<ReplicaId, Arc<dyn Connection>> = BTreeMap::new();
            let mut sideband_targets = Vec::new();
            for &b in ids {
                if a == b {
                    continue;
                }
                repl_peers.insert(
                    b,
                    Arc::new(Endpoint {
                        peer: b,
                        local: memories[&a].clone(),
                        remote: memories[&b].clone(),
                        outbound: repl_rights[&(a, b)].clone(),
                        inbound: repl_rights[&(b, a)].clone(),
                        cq: repl_cq.clone(),
                    }),
                );
                bg_peers.insert(
                    b,
                    Arc::new(Endpoint {
                        peer: b,
                        local: memories[&a].clone(),
                        remote: memories[&b].clone(),
                        outbound: bg_rights[&(a, b)].clone(),
                        inbound: bg_rights[&(b, a)].clone(),
                        cq: bg_cq.clone(),
                    }),
                );
                sideband_targets.push((memories[&b].clone(), repl_rights[&(a, b)].clone()));
            }

            let loopback: Arc<dyn Connection> = Arc::new(Endpoint {
                peer: a,
                local: memories[&a].clone(),
                remote: memories[&a].clone(),
                outbound: new_rights_cell(Rights::full()),
                inbound: new_rights_cell(Rights::full()),
                cq: bg_cq.clone(),
            });

            let sideband: Arc<dyn Connection> = Arc::new(SidebandEndpoint {
                local: memories[&a].clone(),
                targets: sideband_targets,
                cq: repl_cq.clone(),
            });

            out.insert(
                a,
                Planes {
                    memory: memories[&a].clone(),
                    replication: Plane {
                        me: a,
                        peers: repl_peers,
                        cq: repl_cq,
                        loopback: None,
                    },
                    background: Plane {
                        me: a,
                        peers: bg_peers,
                        cq: bg_cq,
                        loopback: Some(loopback),
                    },
                    sideband: Some(sideband),
                },
            );
        }
        Ok(out)
    }
}

fn new_rights_cell(rights: Rights) -> Arc<AtomicU8> {
    Arc::new(AtomicU8::new(rights.bits()))
}

fn base_of(id: ReplicaId) -> u64 {
    (id.0 as u64) << 32
}

/// Completion queue backed by a plain FIFO.
#[derive(Debug, Default)]
pub struct Cq(Mutex<VecDeque<Completion>>);

impl Cq {
    fn push(&self, entry: Completion) {
        self.lock().push_back(entry);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Completion>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CompletionQueue for Cq {
    fn poll(&self, max: usize, out: &mut Vec<Completion>) -> bool {
        out.clear();
        let mut queue = self.lock();
        while out.len() < max {
            let Some(entry) = queue.pop_front() else { break };
            out.push(entry);
        }
        true
    }
}

/// One end of a connection pair.
struct Endpoint {
    peer: ReplicaId,
    local: Arc<Memory>,
    remote: Arc<Memory>,
    /// What the peer currently lets us do to its region.
    outbound: Arc<AtomicU8>,
    /// What we currently let the peer do to ours.
    inbound: Arc<AtomicU8>,
    cq: Arc<Cq>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    fn granted(&self) -> Rights {
        Rights::from_bits(self.outbound.load(Ordering::Acquire))
    }
}

impl Connection for Endpoint {
    fn post(&self, op: Op, tag: Tag, local_offset: usize, len: usize, remote_addr: u64) -> bool {
        let base = base_of(self.peer);
        let Some(remote_offset) = remote_addr.checked_sub(base).map(|o| o as usize) else {
            return false;
        };
        if local_offset + len > self.local.len() || remote_offset + len > self.remote.len() {
            return false;
        }
        let needed = match op {
            Op::Read => Rights::REMOTE_READ,
            Op::Write => Rights::REMOTE_WRITE,
        };
        if !self.granted().allows(needed) {
            self.cq.push(Completion {
                tag: tag.pack(),
                ok: false,
            });
            return true;
        }
        match op {
            Op::Read => {
                let bytes = self.remote.read_vec(remote_offset, len);
                self.local.write(local_offset, &bytes);
            }
            Op::Write => {
                let bytes = self.local.read_vec(local_offset, len);
                self.remote.write(remote_offset, &bytes);
            }
        }
        self.cq.push(Completion {
            tag: tag.pack(),
            ok: true,
        });
        true
    }

    fn remote_base(&self) -> u64 {
        base_of(self.peer)
    }

    fn change_rights(&self, rights: Rights) -> bool {
        self.inbound.store(rights.bits(), Ordering::Release);
        true
    }

    fn reconnect(&self, rights: Rights) -> bool {
        self.inbound.store(rights.bits(), Ordering::Release);
        true
    }
}

/// Aggregating intermediary: a single posted write lands on every peer and
/// yields a single completion.
struct SidebandEndpoint {
    local: Arc<Memory>,
    targets: Vec<(Arc<Memory>, Arc<AtomicU8>)>,
    cq: Arc<Cq>,
}

impl fmt::Debug for SidebandEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SidebandEndpoint").finish_non_exhaustive()
    }
}

impl Connection for SidebandEndpoint {
    fn post(&self, op: Op, tag: Tag, local_offset: usize, len: usize, remote_addr: u64) -> bool {
        if op != Op::Write {
            return false;
        }
        let remote_offset = remote_addr as usize;
        if local_offset + len > self.local.len() {
            return false;
        }
        let allowed = self.targets.iter().all(|(mem, rights)| {
            remote_offset + len <= mem.len()
                && Rights::from_bits(rights.load(Ordering::Acquire)).allows(Rights::REMOTE_WRITE)
        });
        if !allowed {
            self.cq.push(Completion {
                tag: tag.pack(),
                ok: false,
            });
            return true;
        }
        let bytes = self.local.read_vec(local_offset, len);
        for (mem, _) in &self.targets {
            mem.write(remote_offset, &bytes);
        }
        self.cq.push(Completion {
            tag: tag.pack(),
            ok: true,
        });
        true
    }

    fn remote_base(&self) -> u64 {
        0
    }

    fn change_rights(&self, _rights: Rights) -> bool {
        false
    }

    fn reconnect(&self, _rights: Rights) -> bool {
        false
    }
}
