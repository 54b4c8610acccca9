//! Hierarchical barrier engine.
//!
//! One call runs: local worker rendezvous → (non-member? return) → quiet
//! to every RDMA-path team peer → cross-device rounds by the last worker
//! to arrive → local release. On return every member's prior memory
//! effects are visible to every other member.
//!
//! Three cross-device algorithms share one contract and one signal-slot
//! layout; which one runs is fixed per team size and configuration, so
//! all members always pick the same one.

pub mod signal;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::{Backoff, CachePadded};

use crate::error::{Result, SymraError};
use crate::heap::SymmetricHeap;
use crate::team::Team;
use crate::transport::PeerChannel;
use crate::types::{BarrierAlgorithm, Pe, SLOTS_PER_TEAM};

/// Rendezvous for the workers of one PE. Sense-reversing; the last
/// arriver becomes the leader and releases the rest once the cross-device
/// phase is done. No network I/O.
pub struct CoreBarrier {
    workers: u32,
    count: CachePadded<AtomicU32>,
    generation: CachePadded<AtomicU64>,
}

impl CoreBarrier {
    pub fn new(workers: u32) -> Self {
        Self {
            workers: workers.max(1),
            count: CachePadded::new(AtomicU32::new(0)),
            generation: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Returns `(is_leader, generation)`. The leader must call `release`.
    fn arrive(&self) -> (bool, u64) {
        let generation = self.generation.load(Ordering::Acquire);
        let prev = self.count.fetch_add(1, Ordering::AcqRel);
        if prev + 1 == self.workers {
            self.count.store(0, Ordering::Relaxed);
            (true, generation)
        } else {
            (false, generation)
        }
    }

    fn release(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    fn await_release(&self, generation: u64, deadline: Option<Instant>) -> Result<()> {
        let backoff = Backoff::new();
        while self.generation.load(Ordering::Acquire) == generation {
            if backoff.is_completed() {
                if let Some(d) = deadline {
                    if Instant::now() >= d {
                        return Err(SymraError::Timeout {
                            operation: "barrier",
                        });
                    }
                }
            }
            backoff.snooze();
        }
        Ok(())
    }
}

pub struct BarrierEngine {
    algorithm: BarrierAlgorithm,
    centralized_max_team: u32,
    kval: u32,
    workers: u32,
    core: CoreBarrier,
    /// Per-team monotone round counter, advanced once per completed
    /// cross-device phase. Only the leader touches it.
    sync_rounds: Vec<CachePadded<AtomicU64>>,
}

impl BarrierEngine {
    pub fn new(
        algorithm: BarrierAlgorithm,
        centralized_max_team: u32,
        workers: u32,
        max_teams: usize,
    ) -> Self {
        Self {
            algorithm,
            centralized_max_team,
            kval: crate::types::KVAL,
            workers: workers.max(1),
            core: CoreBarrier::new(workers),
            sync_rounds: (0..max_teams)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
        }
    }

    /// Forget everything about a team index before it is reused: round
    /// counter back to zero and the local signal slice wiped, so a new
    /// team cannot inherit the destroyed team's rounds.
    pub(crate) fn reset_team(&self, team_index: usize, heap: &SymmetricHeap) {
        self.sync_rounds[team_index].store(0, Ordering::Relaxed);
        signal::clear_team_slice(heap, team_index);
    }

    /// Effective algorithm for a team of `size` members.
    pub fn select(&self, size: u32) -> BarrierAlgorithm {
        let chosen = match self.algorithm {
            BarrierAlgorithm::Auto => {
                if size <= self.centralized_max_team {
                    BarrierAlgorithm::Centralized
                } else if self.workers > 1 {
                    BarrierAlgorithm::GroupDissemination
                } else {
                    BarrierAlgorithm::Dissemination
                }
            }
            forced => forced,
        };
        // Centralized needs one slot per member.
        if chosen == BarrierAlgorithm::Centralized && size as usize > SLOTS_PER_TEAM {
            BarrierAlgorithm::Dissemination
        } else {
            chosen
        }
    }

    /// Full barrier over `team`. `member` is whether this PE belongs to
    /// the team; non-members still rendezvous their local workers and
    /// return without touching the network.
    pub fn barrier(
        &self,
        team: &Team,
        member: bool,
        mype: Pe,
        heap: &SymmetricHeap,
        channels: &[PeerChannel],
        deadline: Option<Instant>,
    ) -> Result<()> {
        let (leader, generation) = self.core.arrive();
        if !leader {
            return self.core.await_release(generation, deadline);
        }
        let result = if member && team.size > 1 {
            self.cross_device(team, mype, heap, channels, deadline)
        } else {
            Ok(())
        };
        // Release even on error so followers cannot hang on a failed
        // leader.
        self.core.release();
        result
    }

    fn cross_device(
        &self,
        team: &Team,
        mype: Pe,
        heap: &SymmetricHeap,
        channels: &[PeerChannel],
        deadline: Option<Instant>,
    ) -> Result<()> {
        // Drain our posted one-sided traffic to every RDMA team peer so a
        // peer released by this barrier observes it.
        for peer in team.members() {
            if peer != mype {
                if let PeerChannel::Rdma(ch) = &channels[peer as usize] {
                    ch.quiet_deadline(deadline)?;
                }
            }
        }

        let round = self.sync_rounds[team.team_index].load(Ordering::Relaxed) + 1;
        let algorithm = self.select(team.size);
        tracing::trace!(
            team = team.team_index,
            round,
            algorithm = algorithm.name(),
            "cross-device barrier"
        );
        match algorithm {
            BarrierAlgorithm::Dissemination => {
                self.dissemination(team, round, heap, channels, deadline)?
            }
            BarrierAlgorithm::GroupDissemination => {
                self.group_dissemination(team, round, heap, channels, deadline)?
            }
            BarrierAlgorithm::Centralized => {
                self.centralized(team, round, heap, channels, deadline)?
            }
            BarrierAlgorithm::Auto => unreachable!("select never returns Auto"),
        }
        self.sync_rounds[team.team_index].store(round, Ordering::Relaxed);
        Ok(())
    }

    /// Pairwise dissemination: round `i` signals the member at distance
    /// `2^i` and waits for the one at distance `-2^i`, one slot per round.
    fn dissemination(
        &self,
        team: &Team,
        round: u64,
        heap: &SymmetricHeap,
        channels: &[PeerChannel],
        deadline: Option<Instant>,
    ) -> Result<()> {
        let n = team.size as u64;
        let me = team.my_rank as u64;
        let mut shift = 1u64;
        let mut slot = 0usize;
        while shift < n {
            let dst = ((me + shift) % n) as u32;
            signal::signal_member(heap, channels, team, dst, slot, round)?;
            signal::wait_local_slot(heap, team, slot, round, deadline)?;
            shift <<= 1;
            slot += 1;
        }
        Ok(())
    }

    /// k-ary dissemination: each round signals up to `k-1` members at
    /// distances `j * shift`, using `k-1` slots per round.
    fn group_dissemination(
        &self,
        team: &Team,
        round: u64,
        heap: &SymmetricHeap,
        channels: &[PeerChannel],
        deadline: Option<Instant>,
    ) -> Result<()> {
        let n = team.size as u64;
        let me = team.my_rank as u64;
        let k = self.kval.min(team.size).min(self.workers.max(2)).max(2) as u64;
        let mut shift = 1u64;
        let mut slot_base = 0usize;
        while shift < n {
            let mut signalled = 0usize;
            for j in 1..k {
                let distance = j * shift;
                if distance >= n {
                    break;
                }
                let dst = ((me + distance) % n) as u32;
                signal::signal_member(heap, channels, team, dst, slot_base + signalled, round)?;
                signalled += 1;
            }
            for s in 0..signalled {
                signal::wait_local_slot(heap, team, slot_base + s, round, deadline)?;
            }
            slot_base += (k - 1) as usize;
            shift *= k;
        }
        Ok(())
    }

    /// Centralized pull: publish the round in our own member slot, then
    /// scan every other member's slot until all have published it.
    fn centralized(
        &self,
        team: &Team,
        round: u64,
        heap: &SymmetricHeap,
        channels: &[PeerChannel],
        deadline: Option<Instant>,
    ) -> Result<()> {
        signal::store_local_slot(heap, team, team.my_rank as usize, round);
        for other in 0..team.size {
            if other == team.my_rank {
                continue;
            }
            let backoff = Backoff::new();
            loop {
                let seen =
                    signal::read_member_slot(heap, channels, team, other, other as usize)?;
                if seen >= round {
                    break;
                }
                if backoff.is_completed() {
                    if let Some(d) = deadline {
                        if Instant::now() >= d {
                            return Err(SymraError::Timeout {
                                operation: "barrier",
                            });
                        }
                    }
                }
                backoff.snooze();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_barrier_single_worker_is_leader() {
        let core = CoreBarrier::new(1);
        let (leader, _) = core.arrive();
        assert!(leader);
        core.release();
        let (leader, _) = core.arrive();
        assert!(leader);
        core.release();
    }

    #[test]
    fn test_core_barrier_rendezvous() {
        use std::sync::atomic::AtomicU32;
        use std::sync::Arc;
        let core = Arc::new(CoreBarrier::new(4));
        let leaders = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let core = Arc::clone(&core);
                let leaders = Arc::clone(&leaders);
                std::thread::spawn(move || {
                    let (leader, generation) = core.arrive();
                    if leader {
                        leaders.fetch_add(1, Ordering::Relaxed);
                        core.release();
                    } else {
                        core.await_release(generation, None).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(leaders.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_auto_selection_by_size_and_workers() {
        let small = BarrierEngine::new(BarrierAlgorithm::Auto, 8, 1, 4);
        assert_eq!(small.select(4), BarrierAlgorithm::Centralized);
        assert_eq!(small.select(64), BarrierAlgorithm::Dissemination);
        let parallel = BarrierEngine::new(BarrierAlgorithm::Auto, 8, 4, 4);
        assert_eq!(parallel.select(64), BarrierAlgorithm::GroupDissemination);
    }

    #[test]
    fn test_forced_centralized_falls_back_when_oversized() {
        let engine = BarrierEngine::new(BarrierAlgorithm::Centralized, 8, 1, 4);
        assert_eq!(
            engine.select(SLOTS_PER_TEAM as u32 + 1),
            BarrierAlgorithm::Dissemination
        );
    }
}
