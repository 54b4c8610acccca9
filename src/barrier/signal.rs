//! Signal delivery and waiting over per-team heap slots.
//!
//! Each slot is one cache line holding a monotonically increasing round
//! counter with a single owning writer. Waits compare with "at least":
//! slots are reused across barrier invocations with strictly increasing
//! values, so a counter below the expected round is a stale leftover and
//! one at or above it proves the sender reached the current round.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::Backoff;

use crate::error::{Result, SymraError};
use crate::heap::SymmetricHeap;
use crate::team::Team;
use crate::transport::{shared, PeerChannel};
use crate::types::{Pe, SLOTS_PER_TEAM};

/// Deliver `value` into slot `slot` of `team`'s signal slice on the PE
/// holding team rank `dst_rank`. Completed (not merely posted) on return.
pub fn signal_member(
    heap: &SymmetricHeap,
    channels: &[PeerChannel],
    team: &Team,
    dst_rank: u32,
    slot: usize,
    value: u64,
) -> Result<()> {
    let peer: Pe = team.global_of_rank(dst_rank).ok_or(SymraError::InvalidPe {
        pe: dst_rank,
        npes: team.size,
    })?;
    let off = heap.sync_slot(team.team_index, slot);
    match &channels[peer as usize] {
        PeerChannel::Shared => {
            shared::store_u64(heap.translate(off, peer)?, value);
            Ok(())
        }
        PeerChannel::Rdma(ch) => ch.signal(heap.translate_rdma(off, peer)?, value),
    }
}

/// Read slot `slot` of `team`'s slice on the PE holding team rank
/// `src_rank`.
pub fn read_member_slot(
    heap: &SymmetricHeap,
    channels: &[PeerChannel],
    team: &Team,
    src_rank: u32,
    slot: usize,
) -> Result<u64> {
    let peer: Pe = team.global_of_rank(src_rank).ok_or(SymraError::InvalidPe {
        pe: src_rank,
        npes: team.size,
    })?;
    let off = heap.sync_slot(team.team_index, slot);
    match &channels[peer as usize] {
        PeerChannel::Shared => Ok(shared::load_u64(heap.translate(off, peer)?)),
        PeerChannel::Rdma(ch) => ch.read_u64(heap.translate_rdma(off, peer)?),
    }
}

/// Spin until the local slot reaches at least `value`.
pub fn wait_local_slot(
    heap: &SymmetricHeap,
    team: &Team,
    slot: usize,
    value: u64,
    deadline: Option<Instant>,
) -> Result<()> {
    let ptr = heap.local_ptr(heap.sync_slot(team.team_index, slot));
    let cell = unsafe { &*(ptr as *const AtomicU64) };
    let backoff = Backoff::new();
    while cell.load(Ordering::Acquire) < value {
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

/// Publish `value` into this PE's own slot without touching the network.
pub fn store_local_slot(heap: &SymmetricHeap, team: &Team, slot: usize, value: u64) {
    let ptr = heap.local_ptr(heap.sync_slot(team.team_index, slot));
    let cell = unsafe { &*(ptr as *const AtomicU64) };
    cell.store(value, Ordering::Release);
}

/// Zero every slot of the local slice for `team_index`. Used when a
/// destroyed team's index is handed to a new team, whose members must
/// all start from round zero.
pub fn clear_team_slice(heap: &SymmetricHeap, team_index: usize) {
    for slot in 0..SLOTS_PER_TEAM {
        let ptr = heap.local_ptr(heap.sync_slot(team_index, slot));
        let cell = unsafe { &*(ptr as *const AtomicU64) };
        cell.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Driver, HostDriver};
    use std::sync::Arc;

    fn local_world() -> (SymmetricHeap, Team, Vec<PeerChannel>) {
        let driver: Arc<dyn Driver> = Arc::new(HostDriver);
        let mut heap = SymmetricHeap::new(driver, 8 * 1024 * 1024, 4, 2).unwrap();
        let bases = vec![heap.export_base(); 2];
        heap.import_bases(bases.clone(), bases).unwrap();
        let team = Team {
            my_rank: 0,
            start: 0,
            stride: 1,
            size: 2,
            team_index: 1,
        };
        let channels = vec![PeerChannel::Shared, PeerChannel::Shared];
        (heap, team, channels)
    }

    #[test]
    fn test_signal_then_wait_completes() {
        let (heap, team, channels) = local_world();
        // Both "PEs" alias the local heap, so rank 1's slot is observable.
        signal_member(&heap, &channels, &team, 1, 3, 7).unwrap();
        wait_local_slot(&heap, &team, 3, 7, None).unwrap();
        assert_eq!(read_member_slot(&heap, &channels, &team, 1, 3).unwrap(), 7);
    }

    #[test]
    fn test_clear_team_slice_resets_every_slot() {
        let (heap, team, _) = local_world();
        store_local_slot(&heap, &team, 0, 9);
        store_local_slot(&heap, &team, SLOTS_PER_TEAM - 1, 9);
        clear_team_slice(&heap, team.team_index);
        for slot in [0, SLOTS_PER_TEAM - 1] {
            let ptr = heap.local_ptr(heap.sync_slot(team.team_index, slot));
            let cell = unsafe { &*(ptr as *const AtomicU64) };
            assert_eq!(cell.load(Ordering::Acquire), 0);
        }
    }

    #[test]
    fn test_stale_value_does_not_satisfy_wait() {
        let (heap, team, _) = local_world();
        store_local_slot(&heap, &team, 0, 5);
        let deadline = Instant::now() + std::time::Duration::from_millis(20);
        let err = wait_local_slot(&heap, &team, 0, 6, Some(deadline)).unwrap_err();
        assert!(matches!(err, SymraError::Timeout { .. }));
    }
}
