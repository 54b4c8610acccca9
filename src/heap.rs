//! Symmetric heap arena and peer address translation.
//!
//! Every PE maps a heap of identical size, so one scalar offset names the
//! same logical location everywhere. The peer base tables are written once
//! during init from bootstrap-exchanged exports and only read afterwards,
//! which is why translation takes `&self` with no locking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::driver::{Driver, Mapping};
use crate::error::{Result, SymraError};
use crate::types::{HeapOffset, Pe, SLOT_STRIDE, TEAM_SYNC_BYTES};

/// A raw address inside some peer's heap, valid for the channel that
/// produced it (direct load/store for shared peers, WQE field for RDMA).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr(pub usize);

pub struct SymmetricHeap {
    mapping: Option<Mapping>,
    driver: Arc<dyn Driver>,
    heap_size: usize,
    /// Bytes at the head of the heap reserved for team signal slots.
    sync_bytes: usize,
    /// Peer heap bases for the shared-interconnect class; `peer_bases[mype]`
    /// is the local base. Written once during init.
    peer_bases: Vec<u64>,
    /// Peer heap bases registered with the queue-pair engine. With the
    /// in-process backend these coincide with `peer_bases`; with a real NIC
    /// they are the DMA-side addresses.
    rdma_bases: Vec<u64>,
    /// Symmetric bump pointer over the user region. Every PE performs the
    /// same sequence of collective allocations, so offsets agree without
    /// any exchange.
    bump: AtomicUsize,
}

impl SymmetricHeap {
    pub fn new(
        driver: Arc<dyn Driver>,
        heap_size: usize,
        max_teams: usize,
        npes: u32,
    ) -> Result<Self> {
        let sync_bytes = max_teams * TEAM_SYNC_BYTES;
        if sync_bytes >= heap_size {
            return Err(SymraError::InvalidParameter(format!(
                "heap of {heap_size} bytes cannot hold {sync_bytes} sync bytes"
            )));
        }
        let mapping = driver.map(heap_size, SLOT_STRIDE)?;
        Ok(Self {
            mapping: Some(mapping),
            driver,
            heap_size,
            sync_bytes,
            peer_bases: vec![0; npes as usize],
            rdma_bases: vec![0; npes as usize],
            bump: AtomicUsize::new(sync_bytes),
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.mapping.as_ref().map(Mapping::base).unwrap_or(std::ptr::null_mut())
    }

    pub fn size(&self) -> usize {
        self.heap_size
    }

    /// Local base as exchanged with peers during init.
    pub fn export_base(&self) -> u64 {
        self.base() as u64
    }

    /// Install the peer base tables. Called exactly once, before any
    /// translation, with one entry per PE for each reachability class.
    pub fn import_bases(&mut self, shared: Vec<u64>, rdma: Vec<u64>) -> Result<()> {
        if shared.len() != self.peer_bases.len() || rdma.len() != self.rdma_bases.len() {
            return Err(SymraError::InvalidParameter(format!(
                "base table length {} does not match world size {}",
                shared.len(),
                self.peer_bases.len()
            )));
        }
        self.peer_bases = shared;
        self.rdma_bases = rdma;
        Ok(())
    }

    fn check(&self, offset: HeapOffset, pe: Pe) -> Result<()> {
        if offset.0 >= self.heap_size {
            return Err(SymraError::OutOfRange {
                offset: offset.0,
                heap_size: self.heap_size,
            });
        }
        if pe as usize >= self.peer_bases.len() {
            return Err(SymraError::InvalidPe {
                pe,
                npes: self.peer_bases.len() as u32,
            });
        }
        Ok(())
    }

    /// Translate a heap offset to an address in `pe`'s shared-class heap.
    pub fn translate(&self, offset: HeapOffset, pe: Pe) -> Result<RemoteAddr> {
        self.check(offset, pe)?;
        Ok(RemoteAddr(self.peer_bases[pe as usize] as usize + offset.0))
    }

    /// Translate for the queue-pair engine's address space.
    pub fn translate_rdma(&self, offset: HeapOffset, pe: Pe) -> Result<RemoteAddr> {
        self.check(offset, pe)?;
        Ok(RemoteAddr(self.rdma_bases[pe as usize] as usize + offset.0))
    }

    /// Hot-path translation; bounds enforced in debug builds only.
    #[inline]
    pub fn translate_unchecked(&self, offset: HeapOffset, pe: Pe) -> RemoteAddr {
        debug_assert!(offset.0 < self.heap_size);
        debug_assert!((pe as usize) < self.peer_bases.len());
        RemoteAddr(self.peer_bases[pe as usize] as usize + offset.0)
    }

    /// Inverse of `translate` for local addresses.
    pub fn offset_of(&self, addr: usize) -> Result<HeapOffset> {
        let base = self.base() as usize;
        if addr < base || addr >= base + self.heap_size {
            return Err(SymraError::OutOfRange {
                offset: addr.wrapping_sub(base),
                heap_size: self.heap_size,
            });
        }
        Ok(HeapOffset(addr - base))
    }

    /// Pointer to a local heap offset.
    #[inline]
    pub fn local_ptr(&self, offset: HeapOffset) -> *mut u8 {
        debug_assert!(offset.0 < self.heap_size);
        unsafe { self.base().add(offset.0) }
    }

    /// Symmetric allocation from the user region. Collective by
    /// convention: every PE must call with the same arguments in the same
    /// order.
    pub fn alloc(&self, len: usize, align: usize) -> Result<HeapOffset> {
        if len == 0 || !align.is_power_of_two() {
            return Err(SymraError::InvalidParameter(format!(
                "alloc(len={len}, align={align})"
            )));
        }
        loop {
            let cur = self.bump.load(Ordering::Relaxed);
            let start = (cur + align - 1) & !(align - 1);
            let end = match start.checked_add(len) {
                Some(e) if e <= self.heap_size => e,
                _ => {
                    return Err(SymraError::AllocationFailed {
                        requested: len,
                        reason: format!("symmetric heap exhausted at {cur:#x}"),
                    })
                }
            };
            if self
                .bump
                .compare_exchange(cur, end, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(HeapOffset(start));
            }
        }
    }

    /// Offset of signal slot `slot` of team `team_index`. Slices are
    /// disjoint per team, so barriers on independent teams never alias.
    #[inline]
    pub fn sync_slot(&self, team_index: usize, slot: usize) -> HeapOffset {
        debug_assert!(slot < TEAM_SYNC_BYTES / SLOT_STRIDE);
        let off = team_index * TEAM_SYNC_BYTES + slot * SLOT_STRIDE;
        debug_assert!(off + SLOT_STRIDE <= self.sync_bytes);
        HeapOffset(off)
    }
}

impl Drop for SymmetricHeap {
    fn drop(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            self.driver.unmap(mapping);
        }
    }
}
