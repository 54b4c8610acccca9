//! Queue-pair engine: posting, completion polling, backpressure, quiet.
//!
//! Two-phase construction, mirroring a hardware handshake:
//! 1. `PreparedQueuePair::new()`: rings allocated, local endpoint known.
//! 2. Exchange `QpEndpoint` through bootstrap.
//! 3. `PreparedQueuePair::complete()`: remote endpoint installed,
//!    queue pair usable.
//!
//! `head` is owned by the posting side, `tail` by the polling side; the
//! only cross-side synchronization is the per-entry ownership bit, so the
//! invariant `head - tail <= depth` is maintained by draining completions
//! before posting into a nearly full ring.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_utils::{Backoff, CachePadded};

use super::endpoint::QpEndpoint;
use super::queue::{
    ownership_bit, CompRing, CompletionEntry, Doorbell, WorkEntry, WorkRing, CQE_SIZE, WQE_SIZE,
};
use crate::error::{Result, SymraError};
use crate::types::{Pe, RmaOpcode};

/// Ring state shared between the posting side and the backend.
pub struct QpShared {
    pub qp_num: u32,
    pub depth: u32,
    pub wq: WorkRing,
    pub cq: CompRing,
}

/// Consumes work entries and produces completions.
///
/// A hardware backend would be driven by the doorbell alone; software
/// backends may also make progress from `progress`, which the engine calls
/// on every completion-poll attempt.
pub trait NicBackend: Send + Sync {
    /// Notification that new work entries are published up to the head
    /// encoded in `db`.
    fn ring_doorbell(&self, db: u64, qp: &QpShared);

    /// Opportunity to make progress while the engine polls for
    /// completions.
    fn progress(&self, _qp: &QpShared) {}

    /// Acknowledge that completions up to `tail` have been consumed.
    fn ring_cq_doorbell(&self, _tail: u64) {}
}

/// In-process backend: executes writes and reads against process memory
/// in posted order and completes each entry immediately at doorbell time.
#[derive(Default)]
pub struct LoopbackNic {
    consumed: AtomicU64,
    produced: AtomicU64,
    /// Status injected into the next completion, for error-path tests.
    inject_status: AtomicU8,
}

impl LoopbackNic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next completion carry `status` instead of success.
    pub fn inject_status(&self, status: u8) {
        self.inject_status.store(status, Ordering::Relaxed);
    }

    fn execute(entry: &WorkEntry) {
        // Addresses were produced by symmetric-heap translation; both
        // sides live in this process for the loopback backend. Aligned
        // 8-byte transfers move atomically because signal slots are read
        // concurrently by waiters.
        let (src, dst) = match entry.opcode {
            RmaOpcode::Write => (entry.laddr, entry.raddr),
            RmaOpcode::Read => (entry.raddr, entry.laddr),
        };
        unsafe {
            if entry.len == 8 && src % 8 == 0 && dst % 8 == 0 {
                let value = (*(src as *const AtomicU64)).load(Ordering::Acquire);
                (*(dst as *const AtomicU64)).store(value, Ordering::Release);
            } else {
                std::ptr::copy_nonoverlapping(
                    src as *const u8,
                    dst as *mut u8,
                    entry.len as usize,
                );
            }
        }
        std::sync::atomic::fence(Ordering::Release);
    }

    fn drain(&self, qp: &QpShared) {
        loop {
            let index = self.consumed.load(Ordering::Relaxed);
            let Some(raw) = qp.wq.consume(index) else {
                return;
            };
            let entry = match WorkEntry::decode(&raw) {
                Ok(e) => e,
                Err(_) => {
                    self.complete(qp, index, 0x22);
                    self.consumed.store(index + 1, Ordering::Relaxed);
                    continue;
                }
            };
            Self::execute(&entry);
            let status = self.inject_status.swap(0, Ordering::Relaxed);
            self.complete(qp, entry.index, status);
            self.consumed.store(index + 1, Ordering::Relaxed);
        }
    }

    fn complete(&self, qp: &QpShared, wqe_index: u64, status: u8) {
        let produced = self.produced.load(Ordering::Relaxed);
        let cqe = CompletionEntry {
            status,
            index: wqe_index,
        };
        let mut buf = [0u8; CQE_SIZE];
        cqe.encode(&mut buf, ownership_bit(produced, qp.depth));
        qp.cq.publish(produced, &buf);
        self.produced.store(produced + 1, Ordering::Relaxed);
    }
}

impl NicBackend for LoopbackNic {
    fn ring_doorbell(&self, _db: u64, qp: &QpShared) {
        self.drain(qp);
    }

    fn progress(&self, qp: &QpShared) {
        self.drain(qp);
    }
}

/// Backend that acknowledges nothing at doorbell time and completes at
/// most one operation per poll attempt. Exercises the backpressure path:
/// posting always outruns completion.
#[derive(Default)]
pub struct TricklingNic {
    inner: LoopbackNic,
    pending: Mutex<std::collections::VecDeque<WorkEntry>>,
}

impl TricklingNic {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NicBackend for TricklingNic {
    fn ring_doorbell(&self, _db: u64, qp: &QpShared) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let index = self.inner.consumed.load(Ordering::Relaxed);
            let Some(raw) = qp.wq.consume(index) else {
                return;
            };
            if let Ok(entry) = WorkEntry::decode(&raw) {
                pending.push_back(entry);
            }
            self.inner.consumed.store(index + 1, Ordering::Relaxed);
        }
    }

    fn progress(&self, qp: &QpShared) {
        let entry = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.pop_front()
        };
        if let Some(entry) = entry {
            LoopbackNic::execute(&entry);
            self.inner.complete(qp, entry.index, 0);
        }
    }
}

/// A queue pair whose rings exist but whose remote side is not yet known.
pub struct PreparedQueuePair {
    shared: Arc<QpShared>,
    nic: Arc<dyn NicBackend>,
    local_ep: QpEndpoint,
    peer: Pe,
    threshold: u32,
}

impl PreparedQueuePair {
    pub fn new(
        peer: Pe,
        qp_num: u32,
        depth: u32,
        threshold: u32,
        heap_base: u64,
        heap_rkey: u32,
        nic: Arc<dyn NicBackend>,
    ) -> Self {
        let shared = Arc::new(QpShared {
            qp_num,
            depth,
            wq: WorkRing::new(depth),
            cq: CompRing::new(depth),
        });
        Self {
            shared,
            nic,
            local_ep: QpEndpoint {
                qp_num,
                heap_base,
                heap_rkey,
            },
            peer,
            threshold,
        }
    }

    /// Local endpoint to hand to the remote peer.
    pub fn endpoint(&self) -> QpEndpoint {
        self.local_ep
    }

    /// Install the remote endpoint, producing a usable queue pair.
    pub fn complete(self, remote: QpEndpoint) -> QueuePair {
        tracing::debug!(
            peer = self.peer,
            qp_num = self.shared.qp_num,
            remote_qp = remote.qp_num,
            "queue pair connected"
        );
        QueuePair {
            shared: self.shared,
            nic: self.nic,
            remote,
            peer: self.peer,
            threshold: self.threshold,
            lkey: self.local_ep.heap_rkey,
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
        }
    }
}

/// A connected queue pair to one peer.
pub struct QueuePair {
    shared: Arc<QpShared>,
    nic: Arc<dyn NicBackend>,
    remote: QpEndpoint,
    peer: Pe,
    threshold: u32,
    lkey: u32,
    /// Producer index, owned by the posting side.
    head: CachePadded<AtomicU64>,
    /// Consumer index, owned by the polling side.
    tail: CachePadded<AtomicU64>,
}

impl QueuePair {
    pub fn peer(&self) -> Pe {
        self.peer
    }

    /// Remote heap base registered by the peer at connect time.
    pub fn remote_heap_base(&self) -> u64 {
        self.remote.heap_base
    }

    /// Posted-but-not-completed operation count.
    pub fn outstanding(&self) -> u64 {
        self.head.load(Ordering::Relaxed) - self.tail.load(Ordering::Relaxed)
    }

    /// Post a one-sided operation. Returns immediately; completion is
    /// observed through `quiet`. Drains completions first whenever the
    /// ring is within `threshold` slots of full, so `head - tail` can
    /// never exceed the ring depth.
    pub fn post(&self, opcode: RmaOpcode, laddr: u64, raddr: u64, len: u64) -> Result<u64> {
        let depth = self.shared.depth as u64;
        while self.outstanding() + self.threshold as u64 >= depth {
            self.poll_one(None)?;
        }

        let head = self.head.load(Ordering::Relaxed);
        let entry = WorkEntry {
            opcode,
            laddr,
            raddr,
            len,
            lkey: self.lkey,
            rkey: self.remote.heap_rkey,
            index: head,
        };
        let mut buf = [0u8; WQE_SIZE];
        entry.encode(&mut buf, ownership_bit(head, self.shared.depth));
        self.shared.wq.publish(head, &buf);
        self.head.store(head + 1, Ordering::Release);

        let db = Doorbell {
            tag: self.shared.qp_num,
            cmd: opcode as u8,
            head: ((head + 1) & 0xffff) as u16,
            sl: 0,
        };
        self.nic.ring_doorbell(db.encode(), &self.shared);
        Ok(head)
    }

    /// Consume exactly one completion, spinning until one is available.
    fn poll_one(&self, deadline: Option<Instant>) -> Result<()> {
        let tail = self.tail.load(Ordering::Relaxed);
        let backoff = Backoff::new();
        let raw = loop {
            self.nic.progress(&self.shared);
            if let Some(raw) = self.shared.cq.consume(tail) {
                break raw;
            }
            if backoff.is_completed() {
                if let Some(d) = deadline {
                    if Instant::now() >= d {
                        return Err(SymraError::Timeout { operation: "quiet" });
                    }
                }
            }
            backoff.snooze();
        };
        let cqe = CompletionEntry::decode(&raw);
        self.tail.store(tail + 1, Ordering::Release);
        self.nic.ring_cq_doorbell(tail + 1);
        if cqe.status != 0 {
            return Err(SymraError::CompletionStatus {
                pe: self.peer,
                status: cqe.status,
                index: cqe.index,
            });
        }
        Ok(())
    }

    /// Block until every operation posted so far is acknowledged.
    pub fn quiet(&self) -> Result<()> {
        self.quiet_deadline(None)
    }

    /// `quiet` with an optional deadline checked outside the hot spin.
    pub fn quiet_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        let target = self.head.load(Ordering::Relaxed);
        while self.tail.load(Ordering::Relaxed) < target {
            self.poll_one(deadline)?;
        }
        Ok(())
    }
}
