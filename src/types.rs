//! Core identifiers and protocol constants.

/// Global rank of a processing element within the job.
pub type Pe = u32;

/// Worker index within one PE (compute thread issuing operations).
pub type WorkerId = u32;

/// Byte offset into the symmetric heap. Identical on every PE, which is
/// what makes it network-portable: `remote = peer_base[pe] + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapOffset(pub usize);

impl HeapOffset {
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Wire-protocol version carried in the bootstrap session id.
pub const PROTOCOL_VERSION: u16 = 3;

/// Reachability bit: peer shares our address space, plain loads/stores work.
pub const REACH_SHARED: u8 = 1 << 0;
/// Reachability bit: peer is reachable through the queue-pair engine.
pub const REACH_RDMA: u8 = 1 << 1;

/// Fan-out constant for the group dissemination barrier.
pub const KVAL: u32 = 8;

/// Upper bound on barrier rounds: supports up to 2^32 PEs.
pub const LOG_MAX_PES: u32 = 32;

/// Signal slots reserved per team. Covers `LOG_MAX_PES * KVAL` round slots
/// for the dissemination family plus one slot per member (up to the same
/// count) for the centralized scan.
pub const SLOTS_PER_TEAM: usize = (LOG_MAX_PES * KVAL) as usize;

/// Stride between signal slots. One cache line per slot so that two
/// distinct senders never share a line.
pub const SLOT_STRIDE: usize = 64;

/// Bytes of signal region each team owns inside the symmetric heap.
pub const TEAM_SYNC_BYTES: usize = SLOTS_PER_TEAM * SLOT_STRIDE;

/// Barrier algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierAlgorithm {
    /// Pick by team size: centralized for small teams, group dissemination
    /// when spare workers exist, plain dissemination otherwise.
    Auto,
    /// Pairwise dissemination, `ceil(log2 N)` rounds.
    Dissemination,
    /// k-ary dissemination, `ceil(log_k N)` rounds, up to `k-1` signals each.
    GroupDissemination,
    /// Each member publishes one flag and scans every other member's flag.
    Centralized,
}

impl BarrierAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            BarrierAlgorithm::Auto => "auto",
            BarrierAlgorithm::Dissemination => "dissemination",
            BarrierAlgorithm::GroupDissemination => "group-dissemination",
            BarrierAlgorithm::Centralized => "centralized",
        }
    }
}

/// One-sided operation kinds understood by the queue-pair engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RmaOpcode {
    Write = 0x1,
    Read = 0x2,
}

impl RmaOpcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x1 => Some(RmaOpcode::Write),
            0x2 => Some(RmaOpcode::Read),
            _ => None,
        }
    }
}
