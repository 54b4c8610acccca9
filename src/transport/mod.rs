//! Per-peer data channels.
//!
//! At init every peer is classified by reachability and assigned one
//! channel: direct loads/stores when the peer's heap is mapped into this
//! address space, the queue-pair engine otherwise. Selection happens once;
//! steady-state operations match on the channel, never re-classify.

pub mod rdma;
pub mod shared;

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::error::Result;
use crate::heap::RemoteAddr;
use crate::types::{RmaOpcode, REACH_RDMA, REACH_SHARED};
use rdma::QueuePair;

/// Reachability mask for a peer given both sides' address-space tokens.
/// Every peer is reachable through the queue-pair engine; the shared bit
/// additionally marks peers whose heap this process can address directly.
pub fn classify(my_space: u64, peer_space: u64) -> u8 {
    if my_space == peer_space {
        REACH_SHARED | REACH_RDMA
    } else {
        REACH_RDMA
    }
}

/// The data path to one peer.
pub enum PeerChannel {
    /// Peer heap directly addressable; see [`shared`].
    Shared,
    /// Peer reachable through a queue pair only.
    Rdma(RdmaChannel),
}

impl PeerChannel {
    pub fn is_shared(&self) -> bool {
        matches!(self, PeerChannel::Shared)
    }
}

/// Queue-pair channel plus the scratch word used for signals and
/// single-word reads. The scratch is only touched by the worker driving
/// this peer, per the single-producer queue-pair rules.
pub struct RdmaChannel {
    qp: QueuePair,
    scratch: Box<CachePadded<AtomicU64>>,
}

impl RdmaChannel {
    pub fn new(qp: QueuePair) -> Self {
        Self {
            qp,
            scratch: Box::new(CachePadded::new(AtomicU64::new(0))),
        }
    }

    pub fn qp(&self) -> &QueuePair {
        &self.qp
    }

    fn scratch_addr(&self) -> u64 {
        &**self.scratch as *const AtomicU64 as u64
    }

    /// Post a write of `len` bytes from `src` to the peer. The source must
    /// stay valid until the next `quiet`.
    pub fn put(&self, dst: RemoteAddr, src: *const u8, len: usize) -> Result<()> {
        self.qp.post(RmaOpcode::Write, src as u64, dst.0 as u64, len as u64)?;
        Ok(())
    }

    /// Read `len` bytes from the peer into `dst`. Blocks until the data
    /// has landed.
    pub fn get(&self, dst: *mut u8, src: RemoteAddr, len: usize) -> Result<()> {
        self.qp.post(RmaOpcode::Read, dst as u64, src.0 as u64, len as u64)?;
        self.qp.quiet()
    }

    /// Deliver a signal word to a peer slot. Completes before returning,
    /// so a subsequent local wait cannot race the delivery.
    pub fn signal(&self, dst: RemoteAddr, value: u64) -> Result<()> {
        self.scratch.store(value, Ordering::Relaxed);
        self.qp
            .post(RmaOpcode::Write, self.scratch_addr(), dst.0 as u64, 8)?;
        self.qp.quiet()
    }

    /// Fetch a signal word from a peer slot.
    pub fn read_u64(&self, src: RemoteAddr) -> Result<u64> {
        self.qp
            .post(RmaOpcode::Read, self.scratch_addr(), src.0 as u64, 8)?;
        self.qp.quiet()?;
        Ok(self.scratch.load(Ordering::Acquire))
    }

    pub fn quiet(&self) -> Result<()> {
        self.qp.quiet()
    }

    pub fn quiet_deadline(&self, deadline: Option<std::time::Instant>) -> Result<()> {
        self.qp.quiet_deadline(deadline)
    }
}
