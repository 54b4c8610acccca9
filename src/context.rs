//! The per-PE context: owns the heap, channels, teams and barrier engine.
//!
//! Everything the steady state reads is wired here, once, during `init`:
//! heap bases and address-space tokens travel over bootstrap allgather,
//! queue-pair endpoints over bootstrap alltoall, reachability is
//! classified, and one channel per peer is fixed. After `init` returns the
//! context is immutable apart from signal-slot and queue traffic.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use tracing::{debug, info};

use crate::barrier::BarrierEngine;
use crate::bootstrap::Bootstrap;
use crate::config::SymraConfig;
use crate::driver::{Driver, HostDriver};
use crate::error::{Result, SymraError};
use crate::heap::{RemoteAddr, SymmetricHeap};
use crate::team::{Team, TeamTable};
use crate::transport::rdma::{LoopbackNic, NicBackend, PreparedQueuePair, ENDPOINT_SIZE};
use crate::transport::{classify, PeerChannel, RdmaChannel};
use crate::types::{HeapOffset, Pe, REACH_SHARED};

/// Token identifying this address space in reachability exchange. Shared
/// by every context in the process, distinct across processes.
fn process_token() -> u64 {
    static TOKEN: OnceLock<u64> = OnceLock::new();
    *TOKEN.get_or_init(rand::random)
}

/// Per-peer setup record exchanged over bootstrap allgather: heap base,
/// address-space token, then the layout-affecting config fields every PE
/// must agree on.
const PEER_INFO_SIZE: usize = 48;

fn encode_peer_info(heap_base: u64, token: u64, config: &SymraConfig) -> [u8; PEER_INFO_SIZE] {
    let algo = match config.barrier_algorithm {
        crate::types::BarrierAlgorithm::Auto => 0u8,
        crate::types::BarrierAlgorithm::Dissemination => 1,
        crate::types::BarrierAlgorithm::GroupDissemination => 2,
        crate::types::BarrierAlgorithm::Centralized => 3,
    };
    let mut info = [0u8; PEER_INFO_SIZE];
    info[0..8].copy_from_slice(&heap_base.to_le_bytes());
    info[8..16].copy_from_slice(&token.to_le_bytes());
    info[16..24].copy_from_slice(&(config.heap_size as u64).to_le_bytes());
    info[24..32].copy_from_slice(&(config.max_teams as u64).to_le_bytes());
    info[32..36].copy_from_slice(&config.workers.to_le_bytes());
    info[36..40].copy_from_slice(&config.centralized_max_team.to_le_bytes());
    info[40] = algo;
    info
}

pub struct Context {
    config: SymraConfig,
    mype: Pe,
    npes: u32,
    heap: SymmetricHeap,
    channels: Vec<PeerChannel>,
    reachability: Vec<u8>,
    world: Team,
    teams: Mutex<TeamTable>,
    barrier_engine: BarrierEngine,
    bootstrap: Mutex<Box<dyn Bootstrap>>,
}

impl Context {
    /// Initialize over an established bootstrap with the in-process
    /// loopback backend behind every queue pair.
    pub fn init(config: SymraConfig, bootstrap: Box<dyn Bootstrap>) -> Result<Self> {
        Self::init_with_nic(config, bootstrap, |_| {
            Arc::new(LoopbackNic::new()) as Arc<dyn NicBackend>
        })
    }

    /// `init` with a caller-supplied NIC backend per peer.
    pub fn init_with_nic(
        config: SymraConfig,
        mut bootstrap: Box<dyn Bootstrap>,
        nic_for_peer: impl Fn(Pe) -> Arc<dyn NicBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let mype = bootstrap.pe();
        let npes = bootstrap.npes();
        if npes == 0 || mype >= npes {
            return Err(SymraError::InvalidPe { pe: mype, npes });
        }

        let driver: Arc<dyn Driver> = Arc::new(HostDriver);
        let mut heap = SymmetricHeap::new(
            Arc::clone(&driver),
            config.heap_size,
            config.max_teams,
            npes,
        )?;

        // Exchange (heap base, address-space token, layout config) with
        // everyone.
        let info = encode_peer_info(heap.export_base(), process_token(), &config);
        let mut all_info = vec![0u8; PEER_INFO_SIZE * npes as usize];
        bootstrap.allgather(&info, &mut all_info)?;

        let mut shared_bases = vec![0u64; npes as usize];
        let mut reachability = vec![0u8; npes as usize];
        for i in 0..npes as usize {
            let rec = &all_info[i * PEER_INFO_SIZE..(i + 1) * PEER_INFO_SIZE];
            // Heap layout, slot layout and algorithm selection are all
            // derived from these fields; disagreement would desynchronize
            // every collective, so reject it before the data plane exists.
            if rec[16..] != info[16..] {
                return Err(SymraError::InvalidParameter(format!(
                    "PE {i} was configured with different heap/barrier \
                     settings than PE {mype}; heap_size, max_teams, workers, \
                     centralized_max_team and barrier_algorithm must match \
                     on every PE"
                )));
            }
            let base = u64::from_le_bytes(rec[0..8].try_into().unwrap());
            let token = u64::from_le_bytes(rec[8..16].try_into().unwrap());
            let mut reach = classify(process_token(), token);
            if config.force_rdma && i != mype as usize {
                reach &= !REACH_SHARED;
            }
            reachability[i] = reach;
            if reach & REACH_SHARED != 0 {
                shared_bases[i] = base;
            }
        }

        // Queue pair per peer: prepare, exchange endpoints, complete.
        let mut prepared: Vec<Option<PreparedQueuePair>> = (0..npes)
            .map(|peer| {
                if peer == mype {
                    None
                } else {
                    Some(PreparedQueuePair::new(
                        peer,
                        (mype * npes + peer) & 0xff_ffff,
                        config.qp_depth,
                        config.backpressure_threshold,
                        heap.export_base(),
                        0x1000 + mype,
                        nic_for_peer(peer),
                    ))
                }
            })
            .collect();

        let mut ep_send = vec![0u8; ENDPOINT_SIZE * npes as usize];
        for (peer, qp) in prepared.iter().enumerate() {
            if let Some(qp) = qp {
                ep_send[peer * ENDPOINT_SIZE..(peer + 1) * ENDPOINT_SIZE]
                    .copy_from_slice(&qp.endpoint().to_bytes());
            }
        }
        let mut ep_recv = vec![0u8; ENDPOINT_SIZE * npes as usize];
        bootstrap.alltoall(&ep_send, &mut ep_recv)?;

        let mut rdma_bases = vec![0u64; npes as usize];
        let mut channels = Vec::with_capacity(npes as usize);
        for peer in 0..npes as usize {
            if peer == mype as usize {
                channels.push(PeerChannel::Shared);
                rdma_bases[peer] = heap.export_base();
                continue;
            }
            let remote = crate::transport::rdma::QpEndpoint::from_bytes(
                &ep_recv[peer * ENDPOINT_SIZE..(peer + 1) * ENDPOINT_SIZE],
            )?;
            rdma_bases[peer] = remote.heap_base;
            let qp = prepared[peer]
                .take()
                .ok_or_else(|| SymraError::transport("queue pair missing for peer"))?
                .complete(remote);
            if reachability[peer] & REACH_SHARED != 0 {
                // Fast path available; the queue pair is not retained.
                channels.push(PeerChannel::Shared);
            } else {
                channels.push(PeerChannel::Rdma(RdmaChannel::new(qp)));
            }
        }
        heap.import_bases(shared_bases, rdma_bases)?;

        let mut teams = TeamTable::new(config.max_teams);
        let world = teams.install_world(mype, npes);
        let barrier_engine = BarrierEngine::new(
            config.barrier_algorithm,
            config.centralized_max_team,
            config.workers,
            config.max_teams,
        );

        // Everyone finishes wiring before anyone's data plane goes live.
        bootstrap.barrier()?;
        info!(mype, npes, heap_size = config.heap_size, "context initialized");

        Ok(Self {
            config,
            mype,
            npes,
            heap,
            channels,
            reachability,
            world,
            teams: Mutex::new(teams),
            barrier_engine,
            bootstrap: Mutex::new(bootstrap),
        })
    }

    pub fn mype(&self) -> Pe {
        self.mype
    }

    pub fn npes(&self) -> u32 {
        self.npes
    }

    pub fn world(&self) -> Team {
        self.world
    }

    pub fn config(&self) -> &SymraConfig {
        &self.config
    }

    /// Reachability mask for `pe` as established at init.
    pub fn reachability(&self, pe: Pe) -> Result<u8> {
        self.reachability
            .get(pe as usize)
            .copied()
            .ok_or(SymraError::InvalidPe { pe, npes: self.npes })
    }

    pub(crate) fn heap(&self) -> &SymmetricHeap {
        &self.heap
    }

    pub(crate) fn channels(&self) -> &[PeerChannel] {
        &self.channels
    }

    /// Symmetric allocation; collective by convention.
    pub fn alloc(&self, len: usize, align: usize) -> Result<HeapOffset> {
        self.heap.alloc(len, align)
    }

    /// Translate a heap offset to `pe`'s shared-class address.
    pub fn translate(&self, offset: HeapOffset, pe: Pe) -> Result<RemoteAddr> {
        self.heap.translate(offset, pe)
    }

    /// Offset of a local address inside the heap.
    pub fn offset_of(&self, addr: usize) -> Result<HeapOffset> {
        self.heap.offset_of(addr)
    }

    /// Pointer to a local heap offset.
    pub fn local_ptr(&self, offset: HeapOffset) -> *mut u8 {
        self.heap.local_ptr(offset)
    }

    /// Collective team split over parent-relative `(start, stride, size)`.
    /// Returns the descriptor and whether this PE is a member.
    ///
    /// Every parent member must call this with the same arguments. The
    /// assigned index may have belonged to a destroyed team, so the slot
    /// slice and round counter are wiped here, fenced by two parent
    /// barriers: the first keeps a slow member of the old team from being
    /// mid-scan of this slice while it is zeroed, the second keeps the new
    /// team from signaling into a slice a peer has not wiped yet.
    pub fn split(&self, parent: &Team, start: u32, stride: u32, size: u32) -> Result<(Team, bool)> {
        let (team, member) = {
            let mut teams = self.teams.lock().unwrap_or_else(|e| e.into_inner());
            teams.split(parent, self.mype, start, stride, size)?
        };
        self.barrier(parent)?;
        self.barrier_engine.reset_team(team.team_index, &self.heap);
        self.barrier(parent)?;
        Ok((team, member))
    }

    /// Collective team destroy; frees the team's index and signal slice.
    pub fn destroy_team(&self, team: Team) -> Result<()> {
        let mut teams = self.teams.lock().unwrap_or_else(|e| e.into_inner());
        teams.destroy(team)
    }

    /// Barrier over `team`. Non-members return after the local worker
    /// rendezvous without touching the network.
    pub fn barrier(&self, team: &Team) -> Result<()> {
        self.barrier_deadline(team, None)
    }

    /// `barrier` with an optional deadline checked outside the hot spins.
    ///
    /// A `Timeout` leaves the round incomplete: this PE has already
    /// signaled some members, who may be released by those signals before
    /// this PE re-arrives, so mutual arrival is not guaranteed for the
    /// timed-out round. The team's round counter is only advanced on
    /// success, and waits accept any value at or above the expected round,
    /// so re-entering the same barrier on every member reconciles the
    /// team.
    pub fn barrier_deadline(&self, team: &Team, deadline: Option<Instant>) -> Result<()> {
        let member = team.contains_global(self.mype);
        self.barrier_engine.barrier(
            team,
            member,
            self.mype,
            &self.heap,
            &self.channels,
            deadline,
        )
    }

    /// Barrier over every PE.
    pub fn barrier_all(&self) -> Result<()> {
        let world = self.world;
        self.barrier(&world)
    }

    /// Tear down collectively: synchronize, then release the control
    /// channel and the heap.
    pub fn finalize(self) -> Result<()> {
        self.barrier_all()?;
        let mut bootstrap = self.bootstrap.lock().unwrap_or_else(|e| e.into_inner());
        // A data-plane barrier can release this PE while a peer is still
        // scanning its signal slots. Hold the heap until every PE has
        // left the barrier above, then tear down.
        bootstrap.barrier()?;
        bootstrap.finalize()?;
        debug!(mype = self.mype, "context finalized");
        Ok(())
    }

    /// Abort the whole job through the bootstrap channel.
    pub fn global_exit(&self, status: i32) {
        let mut bootstrap = self.bootstrap.lock().unwrap_or_else(|e| e.into_inner());
        bootstrap.global_exit(status);
    }
}
