//! Strided PE teams.
//!
//! A team is the triple `(start, stride, size)` over global ranks.
//! Creation is collective but exchanges no data: membership is pure
//! arithmetic every caller can evaluate locally.

use crate::error::{Result, SymraError};
use crate::types::Pe;

/// An immutable strided subset of PEs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Team {
    /// This PE's rank within the team.
    pub my_rank: u32,
    /// Global rank of team rank 0.
    pub start: u32,
    /// Distance between consecutive members in global rank space.
    pub stride: u32,
    /// Member count.
    pub size: u32,
    /// Slot into the per-team signal region and the team table.
    pub team_index: usize,
}

impl Team {
    /// Whether global rank `r` is a member.
    pub fn contains_global(&self, r: Pe) -> bool {
        r >= self.start
            && (r - self.start) % self.stride == 0
            && (r - self.start) / self.stride < self.size
    }

    /// Team rank of global rank `r`, if a member.
    pub fn rank_of_global(&self, r: Pe) -> Option<u32> {
        if self.contains_global(r) {
            Some((r - self.start) / self.stride)
        } else {
            None
        }
    }

    /// Global rank of team rank `tr`.
    pub fn global_of_rank(&self, tr: u32) -> Option<Pe> {
        if tr < self.size {
            Some(self.start + tr * self.stride)
        } else {
            None
        }
    }

    /// Iterate the members' global ranks.
    pub fn members(&self) -> impl Iterator<Item = Pe> + '_ {
        (0..self.size).map(move |tr| self.start + tr * self.stride)
    }
}

/// Map `src_rank` in `src` to the corresponding rank in `dst`, going
/// through global rank space. `None` when the global rank is not
/// representable in `dst`.
pub fn translate_pe(src: &Team, src_rank: u32, dst: &Team) -> Option<u32> {
    let global = src.global_of_rank(src_rank)?;
    dst.rank_of_global(global)
}

/// Team-index allocator plus the live team descriptors.
///
/// Indices are assigned from a deterministic free list, so PEs that make
/// the same sequence of collective split/destroy calls agree on indices
/// without exchanging them.
pub struct TeamTable {
    teams: Vec<Option<Team>>,
}

impl TeamTable {
    pub fn new(max_teams: usize) -> Self {
        Self {
            teams: vec![None; max_teams],
        }
    }

    /// Derive a team from `parent` by `(start, stride, size)` over parent
    /// ranks, assigning the lowest free index. Returns the descriptor for
    /// this PE; `my_rank` is meaningful only when `member` below is true.
    pub fn split(
        &mut self,
        parent: &Team,
        my_global: Pe,
        start: u32,
        stride: u32,
        size: u32,
    ) -> Result<(Team, bool)> {
        if stride == 0 || size == 0 {
            return Err(SymraError::InvalidTeamRange {
                start,
                stride,
                size,
                parent_size: parent.size,
            });
        }
        let last = start as u64 + (size as u64 - 1) * stride as u64;
        if last >= parent.size as u64 {
            return Err(SymraError::InvalidTeamRange {
                start,
                stride,
                size,
                parent_size: parent.size,
            });
        }
        let index = self
            .teams
            .iter()
            .position(Option::is_none)
            .ok_or(SymraError::TeamsExhausted {
                max_teams: self.teams.len(),
            })?;

        // Parent-relative parameters flattened to global rank space.
        let g_start = parent.start + start * parent.stride;
        let g_stride = stride * parent.stride;

        let mut team = Team {
            my_rank: 0,
            start: g_start,
            stride: g_stride,
            size,
            team_index: index,
        };
        let member = match team.rank_of_global(my_global) {
            Some(tr) => {
                team.my_rank = tr;
                true
            }
            None => false,
        };
        self.teams[index] = Some(team);
        tracing::debug!(
            index,
            start = g_start,
            stride = g_stride,
            size,
            member,
            "team split"
        );
        Ok((team, member))
    }

    /// Install the world team at index 0.
    pub fn install_world(&mut self, mype: Pe, npes: u32) -> Team {
        let world = Team {
            my_rank: mype,
            start: 0,
            stride: 1,
            size: npes,
            team_index: 0,
        };
        self.teams[0] = Some(world);
        world
    }

    pub fn get(&self, index: usize) -> Option<&Team> {
        self.teams.get(index).and_then(Option::as_ref)
    }

    /// Release a team's index for reuse. Collective by convention, like
    /// `split`. The world team is never destroyed.
    pub fn destroy(&mut self, team: Team) -> Result<()> {
        if team.team_index == 0 {
            return Err(SymraError::InvalidParameter(
                "cannot destroy the world team".into(),
            ));
        }
        match self.teams.get_mut(team.team_index) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(SymraError::InvalidParameter(format!(
                "team index {} is not live",
                team.team_index
            ))),
        }
    }
}
