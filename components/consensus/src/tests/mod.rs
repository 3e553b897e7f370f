use assert_matches::assert_matches;
use test_casing::test_casing;
use zksync_concurrency::{ctx, scope, time};

use crate::{
    testonly::{cluster, cluster_opts, propose_until_ok, wait_until, wait_until_leader, TEST_REGION},
    Config, Leader, LeaderToken, ProposeError, ReplicaId,
};

#[test]
fn config_validation() {
    let cfg = |peers: &[u16]| Config {
        my_id: ReplicaId(1),
        peers: peers.iter().copied().map(ReplicaId).collect(),
        outstanding: 1,
        max_payload_size: 1024,
        use_sideband: false,
    };
    assert!(cfg(&[2, 3]).validate().is_ok());
    assert!(cfg(&[2, 3, 4, 5, 6, 7, 8]).validate().is_ok());
    // Too small and too large clusters.
    assert!(cfg(&[2]).validate().is_err());
    assert!(cfg(&[2, 3, 4, 5, 6, 7, 8, 9]).validate().is_err());
    // Duplicate id.
    assert!(cfg(&[1, 2]).validate().is_err());

    let mut bad = cfg(&[2, 3]);
    bad.max_payload_size = usize::MAX;
    assert!(bad.validate().is_err());
    bad = cfg(&[2, 3]);
    bad.outstanding = 0;
    assert!(bad.validate().is_err());
}

#[test]
fn leader_token_compare_exchange() {
    let token = LeaderToken::new();
    let initial = token.load();
    assert!(initial.is_unused());

    let claimed = Leader::new(ReplicaId(2), 7, false);
    assert!(token.compare_exchange(initial, claimed));
    // A second claim against the stale expectation fails.
    assert!(!token.compare_exchange(initial, Leader::new(ReplicaId(3), 9, false)));

    // Identity ignores the flags: marking the token served is invisible
    // to equality, so consumers do not mistake it for a leader change.
    assert!(token.compare_exchange(claimed, claimed.make_unused()));
    assert_eq!(token.load(), claimed);
    assert!(token.load().is_unused());
}

#[tokio::test]
async fn lowest_id_becomes_leader() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    scope::run!(ctx, |ctx, s| async {
        let (replicas, runners) = cluster(&[1, 2, 3], TEST_REGION).unwrap();
        for runner in runners {
            s.spawn_bg(async { runner.run(ctx).await.map_err(ctx::Error::Internal) });
        }

        wait_until_leader(ctx, &replicas[0]).await?;
        assert!(!replicas[1].consensus.is_leader());
        assert!(!replicas[2].consensus.is_leader());

        // A proposal on a follower is rejected and names the leader.
        let err = replicas[1].consensus.propose(ctx, b"nope").await.unwrap_err();
        assert_matches!(
            err,
            ProposeError::FollowerMode { potential_leader: Some(leader) } => {
                assert_eq!(leader, ReplicaId(1));
            }
        );
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn payload_guards() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    scope::run!(ctx, |ctx, s| async {
        let (replicas, runners) = cluster(&[1, 2, 3], TEST_REGION).unwrap();
        for runner in runners {
            s.spawn_bg(async { runner.run(ctx).await.map_err(ctx::Error::Internal) });
        }
        wait_until_leader(ctx, &replicas[0]).await?;

        let leader = &replicas[0].consensus;
        assert_matches!(
            leader.propose(ctx, b"").await,
            Err(ProposeError::EmptyPayload)
        );
        assert_matches!(
            leader.propose(ctx, &[0; 4096]).await,
            Err(ProposeError::PayloadTooLarge { len: 4096, max: 1024 })
        );
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn accession_runs_slow_path_then_fast_path() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    scope::run!(ctx, |ctx, s| async {
        let (replicas, runners) = cluster(&[1, 2, 3], TEST_REGION).unwrap();
        for runner in runners {
            s.spawn_bg(async { runner.run(ctx).await.map_err(ctx::Error::Internal) });
        }
        let leader = &replicas[0];
        wait_until_leader(ctx, leader).await?;

        // Fresh leadership: the optimistic path is not engaged yet.
        assert!(!leader.consensus.core.try_lock().unwrap().fast_path);

        propose_until_ok(ctx, leader, b"first").await.unwrap();
        assert!(
            leader.consensus.core.try_lock().unwrap().fast_path,
            "a successful slow-path propose arms the fast path"
        );
        propose_until_ok(ctx, leader, b"second").await.unwrap();

        assert_eq!(leader.commits.payloads(), vec![b"first".to_vec(), b"second".to_vec()]);
        assert!(leader.commits.entries().iter().all(|(was_leader, _)| *was_leader));
        Ok(())
    })
    .await
    .unwrap();
}

#[test_casing(2, [3, 5])]
#[tokio::test]
async fn commits_are_ordered_across_replicas(total: u16) {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    scope::run!(ctx, |ctx, s| async {
        let ids: Vec<u16> = (1..=total).collect();
        let (replicas, runners) = cluster(&ids, TEST_REGION).unwrap();
        for runner in runners {
            s.spawn_bg(async { runner.run(ctx).await.map_err(ctx::Error::Internal) });
        }
        let leader = &replicas[0];
        wait_until_leader(ctx, leader).await?;

        let payloads: Vec<Vec<u8>> = (0u32..8).map(|i| format!("entry-{i}").into_bytes()).collect();
        for payload in &payloads {
            propose_until_ok(ctx, leader, payload).await.unwrap();
        }
        assert_eq!(leader.commits.payloads(), payloads);

        // Followers discover a slot once the next one lands, so they trail
        // the leader by at most one entry.
        for follower in &replicas[1..] {
            wait_until(ctx, || follower.commits.len() >= payloads.len() - 1).await?;
            let seen = follower.commits.payloads();
            assert_eq!(seen[..], payloads[..seen.len()], "follower delivery order diverged");
            assert!(follower.commits.entries().iter().all(|(was_leader, _)| !*was_leader));
        }
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn paused_leader_hands_over() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    scope::run!(ctx, |ctx, s| async {
        let (replicas, runners) = cluster(&[1, 2, 3], TEST_REGION).unwrap();
        for runner in runners {
            s.spawn_bg(async { runner.run(ctx).await.map_err(ctx::Error::Internal) });
        }
        let first = &replicas[0];
        let second = &replicas[1];
        wait_until_leader(ctx, first).await?;
        propose_until_ok(ctx, first, b"from-one").await.unwrap();

        // Pausing the heartbeat freezes replica 1's liveness counter; its
        // score decays everywhere and replica 2 takes over.
        first.consensus.set_paused(true);
        wait_until(ctx, || first.consensus.blocked_response()).await?;
        wait_until_leader(ctx, second).await?;
        wait_until(ctx, || !first.consensus.is_leader()).await?;

        propose_until_ok(ctx, second, b"from-two").await.unwrap();
        let err = first.consensus.propose(ctx, b"stale").await.unwrap_err();
        assert_matches!(
            err,
            ProposeError::FollowerMode { potential_leader: Some(leader) } => {
                assert_eq!(leader, ReplicaId(2));
            }
        );

        // The recovered value of the old leader and the new proposal both
        // survive on the new leader, in order.
        wait_until(ctx, || second.commits.len() >= 2).await?;
        let payloads = second.commits.payloads();
        assert_eq!(payloads[0], b"from-one");
        assert!(payloads.contains(&b"from-two".to_vec()));
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn hard_reset_reestablishes_leadership() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    scope::run!(ctx, |ctx, s| async {
        let (replicas, runners) = cluster(&[1, 2, 3], TEST_REGION).unwrap();
        for runner in runners {
            s.spawn_bg(async { runner.run(ctx).await.map_err(ctx::Error::Internal) });
        }
        let leader = &replicas[0];
        wait_until_leader(ctx, leader).await?;
        propose_until_ok(ctx, leader, b"before-reset").await.unwrap();

        leader.consensus.request_hard_reset();
        // Leadership is re-acquired through a full reconnect round.
        wait_until(ctx, || leader.consensus.is_leader()).await?;
        propose_until_ok(ctx, leader, b"after-reset").await.unwrap();

        wait_until(ctx, || leader.commits.len() >= 2).await?;
        let payloads = leader.commits.payloads();
        assert_eq!(payloads[0], b"before-reset");
        assert!(payloads.contains(&b"after-reset".to_vec()));
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn log_recycling_round_trip() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    scope::run!(ctx, |ctx, s| async {
        // A region small enough that a few dozen proposals fill the log.
        let (replicas, runners) = cluster(&[1, 2, 3], 40 * 1024).unwrap();
        for runner in runners {
            s.spawn_bg(async { runner.run(ctx).await.map_err(ctx::Error::Internal) });
        }
        let leader = &replicas[0];
        wait_until_leader(ctx, leader).await?;

        let payloads: Vec<Vec<u8>> =
            (0u32..40).map(|i| format!("bulk-{i:03}-{}", "x".repeat(900)).into_bytes()).collect();
        for payload in &payloads {
            propose_until_ok(ctx, leader, payload).await.unwrap();
        }

        // Everything decided exactly once and in order. The payloads do
        // not fit the log, so this is only possible across at least one
        // recycling round.
        assert_eq!(leader.commits.payloads(), payloads);
        {
            let core = leader.consensus.core.try_lock().unwrap();
            let total: u64 = payloads
                .iter()
                .map(|p| onesided_log::Slot::footprint_of(p.len()))
                .sum();
            assert!(
                total > core.log.entry_capacity(),
                "test payloads must overflow the log to exercise recycling"
            );
        }

        // Followers converge on the same prefix, still in order.
        for follower in &replicas[1..] {
            wait_until(ctx, || follower.commits.len() >= payloads.len() - 1).await?;
            let seen = follower.commits.payloads();
            assert_eq!(seen[..], payloads[..seen.len()]);
        }
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn sideband_fast_path_commits() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    scope::run!(ctx, |ctx, s| async {
        let (replicas, runners) =
            cluster_opts(&[1, 2, 3], TEST_REGION, |cfg| cfg.use_sideband = true).unwrap();
        for runner in runners {
            s.spawn_bg(async { runner.run(ctx).await.map_err(ctx::Error::Internal) });
        }
        let leader = &replicas[0];
        wait_until_leader(ctx, leader).await?;

        for i in 0u32..4 {
            propose_until_ok(ctx, leader, format!("agg-{i}").as_bytes()).await.unwrap();
        }
        assert_eq!(leader.commits.len(), 4);
        let (first, last) = leader.consensus.proposed_replicated_range();
        assert!(first < last, "the fast path recorded a confirmed range");

        // The aggregated writes still land on every follower.
        for follower in &replicas[1..] {
            wait_until(ctx, || follower.commits.len() >= 3).await?;
        }
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn proposals_resume_after_follower_contention() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    scope::run!(ctx, |ctx, s| async {
        let (replicas, runners) = cluster(&[1, 2, 3], TEST_REGION).unwrap();
        for runner in runners {
            s.spawn_bg(async { runner.run(ctx).await.map_err(ctx::Error::Internal) });
        }
        let leader = &replicas[0];
        wait_until_leader(ctx, leader).await?;

        // Interleave proposals with deliberate lock contention: holding
        // the core lock makes propose return `MutexUnavailable` instead of
        // blocking.
        {
            let _core = leader.consensus.core.try_lock().unwrap();
            let err = leader.consensus.propose(ctx, b"contended").await.unwrap_err();
            assert_matches!(err, ProposeError::MutexUnavailable { .. });
        }
        propose_until_ok(ctx, leader, b"after-contention").await.unwrap();
        assert_eq!(leader.commits.len(), 1);
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn pause_and_resume_without_peers_keeps_leader() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    scope::run!(ctx, |ctx, s| async {
        let (replicas, runners) = cluster(&[1, 2, 3], TEST_REGION).unwrap();
        for runner in runners {
            s.spawn_bg(async { runner.run(ctx).await.map_err(ctx::Error::Internal) });
        }
        let leader = &replicas[0];
        wait_until_leader(ctx, leader).await?;

        // A short pause that ends before anyone else takes over: the
        // heartbeat resumes and leadership is retained.
        leader.consensus.set_paused(true);
        wait_until(ctx, || leader.consensus.blocked_response()).await?;
        ctx.sleep(time::Duration::milliseconds(100)).await?;
        leader.consensus.set_paused(false);
        wait_until(ctx, || !leader.consensus.blocked_response()).await?;

        assert!(leader.consensus.is_leader());
        propose_until_ok(ctx, leader, b"still-here").await.unwrap();
        Ok(())
    })
    .await
    .unwrap();
}
