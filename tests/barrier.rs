//! Barrier correctness across team sizes, algorithms and repeated rounds.

mod common;

use common::{run_pes, test_config};
use symra::{BarrierAlgorithm, Context, SymraConfig};

/// Every PE writes a round-stamped value into its own heap before the
/// barrier; after the barrier every member must observe every other
/// member's value for that exact round. Repeats many rounds through the
/// same signal slots to exercise counter reuse.
fn mutual_visibility(npes: u32, algorithm: BarrierAlgorithm, rounds: u64, force_rdma: bool) {
    let config = SymraConfig {
        barrier_algorithm: algorithm,
        force_rdma,
        ..test_config()
    };
    run_pes(npes, config, move |ctx: &Context| {
        let cell = ctx.alloc(8, 8).unwrap();
        let me = ctx.mype();
        let world = ctx.world();
        for round in 1..=rounds {
            ctx.put_u64(cell, round * 1000 + me as u64, me).unwrap();
            ctx.barrier(&world).unwrap();
            for peer in 0..ctx.npes() {
                let seen = ctx.get_u64(cell, peer).unwrap();
                assert_eq!(
                    seen,
                    round * 1000 + peer as u64,
                    "pe {me} round {round}: stale value from {peer}"
                );
            }
            ctx.barrier(&world).unwrap();
        }
    });
}

#[test]
fn test_dissemination_mutual_visibility() {
    for npes in [1, 2, 3, 8, 17] {
        mutual_visibility(npes, BarrierAlgorithm::Dissemination, 1000, false);
    }
}

#[test]
fn test_group_dissemination_mutual_visibility() {
    for npes in [1, 2, 3, 8, 17] {
        mutual_visibility(npes, BarrierAlgorithm::GroupDissemination, 1000, false);
    }
}

#[test]
fn test_centralized_mutual_visibility() {
    for npes in [1, 2, 3, 8, 17] {
        mutual_visibility(npes, BarrierAlgorithm::Centralized, 1000, false);
    }
}

#[test]
fn test_barriers_over_queue_pairs() {
    for algorithm in [
        BarrierAlgorithm::Dissemination,
        BarrierAlgorithm::GroupDissemination,
        BarrierAlgorithm::Centralized,
    ] {
        for npes in [2, 3, 8] {
            mutual_visibility(npes, algorithm, 200, true);
        }
    }
}

#[test]
fn test_teardown_without_traffic() {
    // Bare init/finalize must not release any heap while a peer's final
    // barrier scan is still in flight, for every algorithm including the
    // default selection.
    run_pes(8, test_config(), |_ctx: &Context| {});
    for algorithm in [
        BarrierAlgorithm::Dissemination,
        BarrierAlgorithm::GroupDissemination,
        BarrierAlgorithm::Centralized,
    ] {
        let config = SymraConfig {
            barrier_algorithm: algorithm,
            ..test_config()
        };
        run_pes(8, config, |_ctx: &Context| {});
    }
}

#[test]
fn test_recycled_team_index_starts_fresh() {
    // A destroyed team's index is reused by a team with different
    // membership. The old members carry advanced round counters; the new
    // team must still converge instead of waiting for rounds the new
    // members never ran.
    use std::time::{Duration, Instant};
    run_pes(3, test_config(), |ctx: &Context| {
        let world = ctx.world();
        let (pair, _) = ctx.split(&world, 0, 1, 2).unwrap();
        for _ in 0..5 {
            ctx.barrier(&pair).unwrap();
        }
        ctx.barrier(&world).unwrap();
        ctx.destroy_team(pair).unwrap();

        // Ranks 0 and 2 this time, landing on the freed index.
        let (skip, _) = ctx.split(&world, 0, 2, 2).unwrap();
        assert_eq!(skip.team_index, pair.team_index);
        let deadline = Instant::now() + Duration::from_secs(10);
        ctx.barrier_deadline(&skip, Some(deadline)).unwrap();
        ctx.barrier(&world).unwrap();
        ctx.destroy_team(skip).unwrap();
    });
}

#[test]
fn test_mismatched_config_rejected_at_init() {
    // Slot layout and algorithm selection derive from the config, so PEs
    // that disagree on it must fail init instead of desynchronizing later.
    let hub = symra::Coordinator::new(2);
    let handles: Vec<_> = (0..2u32)
        .map(|pe| {
            let boot = hub.attach(pe).unwrap();
            std::thread::spawn(move || {
                let config = SymraConfig {
                    workers: 1 + pe,
                    ..test_config()
                };
                Context::init(config, Box::new(boot)).err()
            })
        })
        .collect();
    for h in handles {
        let err = h.join().unwrap().expect("init must fail on mismatch");
        assert!(matches!(err, symra::SymraError::InvalidParameter(_)));
    }
}

#[test]
fn test_team_barrier_skips_non_members() {
    // Odd ranks form a team; even ranks call the barrier too and must
    // return immediately instead of deadlocking the members.
    run_pes(8, test_config(), |ctx: &Context| {
        let world = ctx.world();
        let (odd, member) = ctx.split(&world, 1, 2, 4).unwrap();
        assert_eq!(member, ctx.mype() % 2 == 1);

        let cell = ctx.alloc(8, 8).unwrap();
        for round in 1..=50u64 {
            if member {
                ctx.put_u64(cell, round, ctx.mype()).unwrap();
            }
            ctx.barrier(&odd).unwrap();
            if member {
                for peer in odd.members() {
                    assert_eq!(ctx.get_u64(cell, peer).unwrap(), round);
                }
            }
            ctx.barrier(&world).unwrap();
        }
        ctx.destroy_team(odd).unwrap();
    });
}

#[test]
fn test_independent_teams_do_not_alias_signals() {
    // Two disjoint teams barrier concurrently; slot slices are disjoint
    // by team index, so neither can satisfy the other's waits.
    run_pes(8, test_config(), |ctx: &Context| {
        let world = ctx.world();
        let (even, in_even) = ctx.split(&world, 0, 2, 4).unwrap();
        let (odd, in_odd) = ctx.split(&world, 1, 2, 4).unwrap();
        let mine = if in_even { even } else { odd };
        assert!(in_even != in_odd);
        for _ in 0..100 {
            ctx.barrier(&mine).unwrap();
        }
        ctx.barrier(&world).unwrap();
        ctx.destroy_team(even).unwrap();
        ctx.destroy_team(odd).unwrap();
    });
}

#[test]
fn test_barrier_deadline_on_missing_peer() {
    // One member never arrives in time; the other's deadline must fire
    // instead of hanging forever, and re-entering the barrier once the
    // late member shows up reconciles the team.
    use std::time::{Duration, Instant};
    run_pes(2, test_config(), |ctx: &Context| {
        let world = ctx.world();
        if ctx.mype() == 0 {
            let deadline = Instant::now() + Duration::from_millis(100);
            let err = ctx.barrier_deadline(&world, Some(deadline)).unwrap_err();
            assert!(matches!(err, symra::SymraError::Timeout { .. }));
        } else {
            // Arrive late, after rank 0 has timed out.
            std::thread::sleep(Duration::from_millis(300));
        }
        // Retry of the same round completes for both members.
        ctx.barrier(&world).unwrap();
    });
}
