use assert_matches::assert_matches;
use onesided_log::Log;
use onesided_transport::{
    testonly::Fabric, Completion, Connection as _, Kind, Plane, Planes, ReplicaId, Rights,
    Scratchpad, Tag,
};
use std::{collections::BTreeMap, sync::Arc};
use test_casing::test_casing;
use zksync_concurrency::ctx;

use crate::{
    majority, minority, CatchUp, CatchUpError, FailureTracker, MajorityError, MajorityOp,
    QuorumFailure, QuorumWaiter, Recycling, SlotReader,
};

fn ids(raw: &[u16]) -> Vec<ReplicaId> {
    raw.iter().copied().map(ReplicaId).collect()
}

fn ack(kind: Kind, pid: u16, seq: u64) -> Completion {
    Completion {
        tag: Tag::new(kind, ReplicaId(pid), seq).pack(),
        ok: true,
    }
}

fn nack(kind: Kind, pid: u16, seq: u64) -> Completion {
    Completion {
        tag: Tag::new(kind, ReplicaId(pid), seq).pack(),
        ok: false,
    }
}

#[test_casing(3, [3, 5, 7])]
#[test]
fn majority_minority_math(total: usize) {
    assert_eq!(majority(total), total / 2 + 1);
    assert_eq!(minority(total), total - majority(total));
    assert!(majority(total) > minority(total));
}

#[test]
fn quorum_reached_exactly_on_last_ack() {
    let remote = ids(&[2, 3, 4, 5]);
    let mut qw = QuorumWaiter::new(Kind::EntryWrite, &remote, 2, 1).unwrap();
    let mut ok = Vec::new();

    assert!(!qw.can_continue_with(2));
    assert!(qw.consume(&[ack(Kind::EntryWrite, 2, 1)], &mut ok));
    assert!(!qw.can_continue_with(2), "one ack is not a quorum of two");
    // A completion of a different kind is ignored.
    assert!(qw.consume(&[ack(Kind::Heartbeat, 3, 1)], &mut ok));
    assert!(!qw.can_continue_with(2));

    assert!(qw.consume(&[ack(Kind::EntryWrite, 3, 1)], &mut ok));
    assert!(qw.can_continue_with(2), "second distinct ack closes the quorum");
    assert_eq!(ok, ids(&[2, 3]));
}

#[test]
fn scoreboard_resets_on_gap() {
    let remote = ids(&[2, 3]);
    let mut qw = QuorumWaiter::new(Kind::EntryWrite, &remote, 1, 1).unwrap();
    let mut ok = Vec::new();

    // Replica 2 skips sequence 1 and acks 2 directly: tracked state resets,
    // so even its (now correct-looking) successor does not count.
    assert!(qw.consume(&[ack(Kind::EntryWrite, 2, 2)], &mut ok));
    assert!(!qw.can_continue_with(2));
    assert!(ok.is_empty());

    // Replica 3 acks in order and closes rounds 1 and 2.
    assert!(qw.consume(&[ack(Kind::EntryWrite, 3, 1)], &mut ok));
    assert!(qw.can_continue_with(2));
    assert!(qw.consume(&[ack(Kind::EntryWrite, 3, 2)], &mut ok));
    assert!(qw.can_continue_with(3));
}

#[test]
fn lost_ack_does_not_block_quorum() {
    // Three remotes, quorum of two; replica 4's ack for sequence 1 is lost.
    let remote = ids(&[2, 3, 4]);
    let mut qw = QuorumWaiter::new(Kind::EntryWrite, &remote, 2, 1).unwrap();
    let mut ok = Vec::new();

    assert!(qw.consume(
        &[ack(Kind::EntryWrite, 2, 1), ack(Kind::EntryWrite, 3, 1)],
        &mut ok
    ));
    assert!(qw.can_continue_with(2), "quorum met without replica 4");

    // Replica 4 shows up with sequence 2: that is a gap from its tracked
    // state, so it resets instead of counting toward round 2.
    assert!(qw.consume(&[ack(Kind::EntryWrite, 4, 2)], &mut ok));
    ok.clear();
    assert!(qw.consume(&[ack(Kind::EntryWrite, 2, 2)], &mut ok));
    assert!(qw.consume(&[ack(Kind::EntryWrite, 3, 2)], &mut ok));
    assert!(qw.can_continue_with(3), "round 2 closed by replicas 2 and 3");
    assert_eq!(ok, ids(&[2, 3]));
}

#[test]
fn pipelined_quorum_tolerates_outstanding() {
    let remote = ids(&[2, 3]);
    let mut qw = QuorumWaiter::new(Kind::EntryWrite, &remote, 2, 1).unwrap();

    assert_eq!(qw.fetch_and_inc_fast_id(), 1);
    assert_eq!(qw.fetch_and_inc_fast_id(), 2);
    let next = qw.next_fast_req_id();
    assert_eq!(next, 3);

    // With two outstanding writes allowed, no acknowledgement is needed
    // yet; with one, the first round must close.
    assert!(qw.can_continue_with_outstanding(2, next));
    assert!(!qw.can_continue_with_outstanding(1, next));
    assert!(qw.fast_consume(&[ack(Kind::EntryWrite, 2, 1), ack(Kind::EntryWrite, 3, 1)]));
    assert!(qw.can_continue_with_outstanding(1, next));
}

#[test]
fn sideband_ack_closes_whole_round() {
    let remote = ids(&[2, 3]);
    let mut qw = QuorumWaiter::new(Kind::EntryWrite, &remote, 2, 1).unwrap();
    assert!(qw.fast_consume(&[ack(Kind::SidebandWrite, 1, 1)]));
    assert!(qw.can_continue_with(2));
}

#[test]
fn fast_consume_fails_on_bad_status() {
    let remote = ids(&[2, 3]);
    let mut qw = QuorumWaiter::new(Kind::EntryWrite, &remote, 2, 1).unwrap();
    assert!(!qw.fast_consume(&[nack(Kind::EntryWrite, 2, 1)]));
}

#[test]
fn tracker_threshold_is_strict() {
    let remote = ids(&[2, 3, 4, 5]);
    // 5 processes tolerate 2 failures.
    let tolerated = minority(5);
    let mut tracker = FailureTracker::new(Kind::EntryWrite, &remote, tolerated);
    tracker.track(1);

    // Exactly the tolerated count, including a duplicate: recoverable.
    let batch = [
        nack(Kind::EntryWrite, 2, 1),
        nack(Kind::EntryWrite, 3, 1),
        nack(Kind::EntryWrite, 2, 2),
    ];
    assert!(!tracker.is_unrecoverable(&batch));

    // A third distinct replica pushes it over.
    assert!(tracker.is_unrecoverable(&[nack(Kind::EntryWrite, 4, 1)]));
}

#[test]
fn tracker_ignores_foreign_and_stale_failures() {
    let remote = ids(&[2, 3]);
    let mut tracker = FailureTracker::new(Kind::EntryWrite, &remote, 0);
    tracker.track(10);

    // Wrong kind and pre-tracked sequence both do not count.
    assert!(!tracker.is_unrecoverable(&[nack(Kind::Heartbeat, 2, 10)]));
    assert!(!tracker.is_unrecoverable(&[nack(Kind::EntryWrite, 2, 9)]));
    // In range: with zero tolerance this is fatal.
    assert!(tracker.is_unrecoverable(&[nack(Kind::EntryWrite, 2, 10)]));
}

#[test]
fn tracker_track_is_noop_mid_round() {
    let remote = ids(&[2, 3]);
    let mut tracker = FailureTracker::new(Kind::EntryWrite, &remote, 0);
    tracker.track(10);
    // Re-tracking without a reset must not move the window.
    tracker.track(20);
    assert!(tracker.is_unrecoverable(&[nack(Kind::EntryWrite, 2, 15)]));

    tracker.reset();
    tracker.track(20);
    assert!(!tracker.is_unrecoverable(&[nack(Kind::EntryWrite, 2, 15)]));
}

// ---- fabric-backed tests ----

struct Node {
    planes: Planes,
    scratch: Arc<Scratchpad>,
    log: Log,
}

fn cluster(raw_ids: &[u16]) -> BTreeMap<ReplicaId, Node> {
    let all = ids(raw_ids);
    let planes = Fabric::full_mesh(1 << 20, &all).unwrap();
    planes
        .into_iter()
        .map(|(id, planes)| {
            let scratch = Arc::new(Scratchpad::new(planes.memory.clone(), &all).unwrap());
            let log = Log::new(
                planes.memory.clone(),
                scratch.log_offset(),
                planes.memory.len() - scratch.log_offset(),
            )
            .unwrap();
            (id, Node { planes, scratch, log })
        })
        .collect()
}

/// Opens full replication-plane rights for `to` on every other node.
fn grant_all(nodes: &BTreeMap<ReplicaId, Node>, to: ReplicaId) {
    for (id, node) in nodes {
        if *id != to {
            node.planes.replication.peers[&to].change_rights(Rights::full());
        }
    }
}

fn plane(nodes: &BTreeMap<ReplicaId, Node>, id: u16) -> &Plane {
    &nodes[&ReplicaId(id)].planes.replication
}

#[tokio::test]
async fn majority_write_lands_on_quorum() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let nodes = cluster(&[1, 2, 3]);
    grant_all(&nodes, ReplicaId(1));

    let mut op = MajorityOp::new(plane(&nodes, 1), Kind::EntryWrite, 1).unwrap();
    let src = nodes[&ReplicaId(1)].log.region_offset(0);
    nodes[&ReplicaId(1)].planes.memory.write_u64(src, 0xfeed);

    op.write(ctx, src, 8, src, &|| true).await.unwrap();
    assert_eq!(op.latest_replicated(), 2);
    for id in [2, 3] {
        assert_eq!(nodes[&ReplicaId(id)].planes.memory.read_u64(src), 0xfeed);
    }
}

#[tokio::test]
async fn majority_write_unrecoverable_without_rights() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let nodes = cluster(&[1, 2, 3]);
    // No rights granted: both peers fail, which exceeds the tolerated
    // minority of one.

    let mut op = MajorityOp::new(plane(&nodes, 1), Kind::EntryWrite, 1).unwrap();
    let src = nodes[&ReplicaId(1)].log.region_offset(0);
    let err = op.write(ctx, src, 8, src, &|| true).await.unwrap_err();
    assert_matches!(
        err,
        MajorityError::Quorum { req: 1, cause: QuorumFailure::Unrecoverable, .. }
    );

    // After recovery and a rights grant the same sequence goes through.
    op.recover(&err);
    grant_all(&nodes, ReplicaId(1));
    op.write(ctx, src, 8, src, &|| true).await.unwrap();
    assert_eq!(op.latest_replicated(), 2);
}

#[tokio::test]
async fn fast_write_through_sideband() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let nodes = cluster(&[1, 2, 3]);
    grant_all(&nodes, ReplicaId(1));

    let mut op = MajorityOp::new(plane(&nodes, 1), Kind::EntryWrite, 1).unwrap();
    let one = &nodes[&ReplicaId(1)];
    let src = one.log.region_offset(0);
    one.planes.memory.write_u64(src, 77);

    let sideband = one.planes.sideband.clone().unwrap();
    let ok = op
        .fast_write(ctx, src, 8, src, 0, Some(&sideband), &|| true)
        .await;
    assert!(ok);
    assert_eq!(op.range(), (1, 2));
    for id in [2, 3] {
        assert_eq!(nodes[&ReplicaId(id)].planes.memory.read_u64(src), 77);
    }
}

#[tokio::test]
async fn slot_reader_finds_freshest_remote() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let nodes = cluster(&[1, 2, 3]);
    grant_all(&nodes, ReplicaId(1));

    // Peer 2 has a populated slot at offset 0, peer 3 has nothing.
    nodes[&ReplicaId(2)].log.append(6, 0, b"stale but present");

    let one = &nodes[&ReplicaId(1)];
    let mut reader =
        SlotReader::new(&one.planes.replication, one.scratch.clone(), one.log.clone()).unwrap();
    let found = reader.read_slot_at(ctx, 0, &|| true).await.unwrap();
    assert_eq!(found.len(), 1);
    let (pid, slot) = &found[0];
    assert_eq!(*pid, ReplicaId(2));
    assert_eq!(slot.proposal, 6);
    assert_eq!(slot.payload, b"stale but present");
}

#[tokio::test]
async fn catchup_adopts_max_fuo_and_unique_proposal() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let nodes = cluster(&[1, 2, 3]);
    grant_all(&nodes, ReplicaId(1));

    // Peer logs are ahead and carry proposal floors.
    nodes[&ReplicaId(2)].log.update_header_first_undecided_offset(256);
    nodes[&ReplicaId(2)].log.set_min_proposal(8);
    nodes[&ReplicaId(3)].log.update_header_first_undecided_offset(128);
    nodes[&ReplicaId(3)].log.set_min_proposal(5);

    let one = &nodes[&ReplicaId(1)];
    let mut catchup =
        CatchUp::new(&one.planes.replication, one.scratch.clone(), one.log.clone()).unwrap();

    let adopted = catchup.catch_fuo(ctx, &|| true).await.unwrap();
    assert_eq!(adopted, 256);
    assert_eq!(one.log.header_first_undecided_offset(), 256);

    catchup.update_followers(ctx, &|| true).await.unwrap();
    assert_eq!(nodes[&ReplicaId(3)].log.header_first_undecided_offset(), 256);

    catchup.catch_proposal(ctx, &|| true).await.unwrap();
    catchup.update_with_current_proposal(ctx, &|| true).await.unwrap();
    let proposal = catchup.proposal();
    // Strictly above everything seen and in replica 1's residue class.
    assert!(proposal > 8);
    assert_eq!(proposal % 4, 1);
    assert_eq!(one.log.min_proposal(), proposal);
    assert_eq!(nodes[&ReplicaId(2)].log.min_proposal(), proposal);
}

#[tokio::test]
async fn catch_proposal_retries_when_overtaken() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let nodes = cluster(&[1, 2, 3]);
    grant_all(&nodes, ReplicaId(1));

    let one = &nodes[&ReplicaId(1)];
    let mut catchup =
        CatchUp::new(&one.planes.replication, one.scratch.clone(), one.log.clone()).unwrap();
    catchup.catch_proposal(ctx, &|| true).await.unwrap();
    let first = catchup.proposal();

    // Another replica pushes a higher floor behind our back.
    nodes[&ReplicaId(2)].log.set_min_proposal(first + 10);
    assert_matches!(
        catchup.catch_proposal(ctx, &|| true).await,
        Err(CatchUpError::Retry)
    );
    // The retry observes a candidate already above everything seen.
    catchup.catch_proposal(ctx, &|| true).await.unwrap();
    assert!(catchup.proposal() > first + 10);
}

#[tokio::test]
async fn recycling_waits_for_every_peer() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let nodes = cluster(&[1, 2, 3]);
    grant_all(&nodes, ReplicaId(1));

    for id in [2, 3] {
        nodes[&ReplicaId(id)].log.update_header_first_undecided_offset(512);
    }
    let one = &nodes[&ReplicaId(1)];
    let mut recycling =
        Recycling::new(&one.planes.replication, one.scratch.clone(), one.log.clone()).unwrap();

    // The request slot round-trips through the codec.
    let request = recycling.request(3, 512);
    assert!(request.is_recycle_request());

    zksync_concurrency::scope::run!(ctx, |ctx, s| async {
        s.spawn_bg(async {
            // Peers apply the recycle request one after the other.
            for id in [2, 3] {
                ctx.sleep(zksync_concurrency::time::Duration::milliseconds(5))
                    .await?;
                nodes[&ReplicaId(id)].log.reset_fuo();
            }
            Ok::<(), ctx::Error>(())
        });
        recycling.wait_for_replies(ctx, &|| true).await.unwrap();
        Ok::<(), ctx::Error>(())
    })
    .await
    .unwrap();

    for id in [2, 3] {
        assert_eq!(nodes[&ReplicaId(id)].log.header_first_undecided_offset(), 0);
    }
}
