//! Ring-buffer work and completion queues.
//!
//! Entries are fixed-size little-endian records in a power-of-two ring.
//! The control byte of each entry carries the ownership bit: the producer
//! writes the body first, then release-stores the control byte; the
//! consumer acquire-loads the control byte and only reads the body once
//! the bit matches the generation it expects. Slot reuse after wraparound
//! is detected because the expected bit flips once per full traversal.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Result, SymraError};
use crate::types::RmaOpcode;

pub const WQE_SIZE: usize = 64;
pub const CQE_SIZE: usize = 16;

/// Offset of the control byte within an entry (both WQE and CQE).
const CTRL_OFFSET: usize = 4;
const CTRL_OWNERSHIP_BIT: u8 = 1 << 7;

/// Ownership bit value a producer writes for ring index `index`.
///
/// Inverted parity of the generation `index / depth`: generation 0 writes
/// the bit set, so a zero-initialized ring never presents a stale entry
/// as fresh.
#[inline]
pub fn ownership_bit(index: u64, depth: u32) -> bool {
    (index / depth as u64) % 2 == 0
}

/// Whether a control byte read at ring position `index % depth` belongs
/// to the generation containing `index`.
#[inline]
pub fn entry_is_fresh(ctrl: u8, index: u64, depth: u32) -> bool {
    ((ctrl & CTRL_OWNERSHIP_BIT) != 0) == ownership_bit(index, depth)
}

/// One-sided work request, encoded form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkEntry {
    pub opcode: RmaOpcode,
    pub laddr: u64,
    pub raddr: u64,
    pub len: u64,
    pub lkey: u32,
    pub rkey: u32,
    pub index: u64,
}

impl WorkEntry {
    pub fn encode(&self, buf: &mut [u8; WQE_SIZE], owned: bool) {
        buf.fill(0);
        buf[0] = self.opcode as u8;
        buf[CTRL_OFFSET] = if owned { CTRL_OWNERSHIP_BIT } else { 0 };
        buf[8..16].copy_from_slice(&self.laddr.to_le_bytes());
        buf[16..24].copy_from_slice(&self.raddr.to_le_bytes());
        buf[24..32].copy_from_slice(&self.len.to_le_bytes());
        buf[32..36].copy_from_slice(&self.lkey.to_le_bytes());
        buf[36..40].copy_from_slice(&self.rkey.to_le_bytes());
        buf[40..48].copy_from_slice(&self.index.to_le_bytes());
    }

    pub fn decode(buf: &[u8; WQE_SIZE]) -> Result<Self> {
        let opcode = RmaOpcode::from_u8(buf[0]).ok_or_else(|| {
            SymraError::transport(format!("unknown opcode {:#x} in work entry", buf[0]))
        })?;
        Ok(Self {
            opcode,
            laddr: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            raddr: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            len: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            lkey: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            rkey: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
            index: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
        })
    }
}

/// Completion record, encoded form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEntry {
    pub status: u8,
    pub index: u64,
}

impl CompletionEntry {
    pub fn encode(&self, buf: &mut [u8; CQE_SIZE], owned: bool) {
        buf.fill(0);
        buf[1] = self.status;
        buf[CTRL_OFFSET] = if owned { CTRL_OWNERSHIP_BIT } else { 0 };
        buf[8..16].copy_from_slice(&self.index.to_le_bytes());
    }

    pub fn decode(buf: &[u8; CQE_SIZE]) -> Self {
        Self {
            status: buf[1],
            index: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        }
    }
}

/// Doorbell word layout: `[0:23]` queue tag, `[24:27]` command,
/// `[32:47]` head (low 16 bits), `[48:50]` service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Doorbell {
    pub tag: u32,
    pub cmd: u8,
    pub head: u16,
    pub sl: u8,
}

impl Doorbell {
    pub fn encode(&self) -> u64 {
        debug_assert!(self.tag < (1 << 24));
        debug_assert!(self.cmd < (1 << 4));
        debug_assert!(self.sl < (1 << 3));
        (self.tag as u64)
            | ((self.cmd as u64) << 24)
            | ((self.head as u64) << 32)
            | ((self.sl as u64) << 48)
    }

    pub fn decode(word: u64) -> Self {
        Self {
            tag: (word & 0xff_ffff) as u32,
            cmd: ((word >> 24) & 0xf) as u8,
            head: ((word >> 32) & 0xffff) as u16,
            sl: ((word >> 48) & 0x7) as u8,
        }
    }
}

/// A power-of-two ring of fixed-size entries with single-producer writes
/// and single-consumer reads, synchronized through the per-entry control
/// byte only.
pub struct RingBuf<const ENTRY: usize> {
    slots: Box<[UnsafeCell<[u8; ENTRY]>]>,
    depth: u32,
}

// Safety: cross-thread access to an entry body is ordered by the
// release/acquire pair on its control byte; producer and consumer sides
// are each single-threaded by the queue-pair ownership rules.
unsafe impl<const ENTRY: usize> Sync for RingBuf<ENTRY> {}
unsafe impl<const ENTRY: usize> Send for RingBuf<ENTRY> {}

impl<const ENTRY: usize> RingBuf<ENTRY> {
    pub fn new(depth: u32) -> Self {
        assert!(depth.is_power_of_two());
        let slots = (0..depth)
            .map(|_| UnsafeCell::new([0u8; ENTRY]))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots, depth }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    fn ctrl(&self, pos: u32) -> &AtomicU8 {
        let slot = self.slots[pos as usize].get();
        // The control byte is accessed atomically while the rest of the
        // entry uses plain accesses ordered by it.
        unsafe { &*((slot as *mut u8).add(CTRL_OFFSET) as *const AtomicU8) }
    }

    /// Producer side: publish an encoded entry at `index`. The encoder
    /// must have set the ownership bit for `index` in the control byte.
    pub fn publish(&self, index: u64, entry: &[u8; ENTRY]) {
        let pos = (index % self.depth as u64) as u32;
        let slot = self.slots[pos as usize].get();
        unsafe {
            // Body first, excluding the control byte.
            let dst = slot as *mut u8;
            std::ptr::copy_nonoverlapping(entry.as_ptr(), dst, CTRL_OFFSET);
            std::ptr::copy_nonoverlapping(
                entry.as_ptr().add(CTRL_OFFSET + 1),
                dst.add(CTRL_OFFSET + 1),
                ENTRY - CTRL_OFFSET - 1,
            );
        }
        self.ctrl(pos).store(entry[CTRL_OFFSET], Ordering::Release);
    }

    /// Consumer side: read the entry containing `index` if its ownership
    /// bit shows the producer has published that generation.
    pub fn consume(&self, index: u64) -> Option<[u8; ENTRY]> {
        let pos = (index % self.depth as u64) as u32;
        let ctrl = self.ctrl(pos).load(Ordering::Acquire);
        if !entry_is_fresh(ctrl, index, self.depth) {
            return None;
        }
        let mut out = [0u8; ENTRY];
        unsafe {
            // Body only; the control byte was already read atomically.
            let src = self.slots[pos as usize].get() as *const u8;
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), CTRL_OFFSET);
            std::ptr::copy_nonoverlapping(
                src.add(CTRL_OFFSET + 1),
                out.as_mut_ptr().add(CTRL_OFFSET + 1),
                ENTRY - CTRL_OFFSET - 1,
            );
        }
        out[CTRL_OFFSET] = ctrl;
        Some(out)
    }
}

pub type WorkRing = RingBuf<WQE_SIZE>;
pub type CompRing = RingBuf<CQE_SIZE>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_entry_round_trip() {
        let e = WorkEntry {
            opcode: RmaOpcode::Write,
            laddr: 0x1000,
            raddr: 0xdead_beef_0000,
            len: 4096,
            lkey: 7,
            rkey: 9,
            index: 42,
        };
        let mut buf = [0u8; WQE_SIZE];
        e.encode(&mut buf, true);
        assert_eq!(WorkEntry::decode(&buf).unwrap(), e);
        assert!(entry_is_fresh(buf[CTRL_OFFSET], 42, 64));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let mut buf = [0u8; WQE_SIZE];
        buf[0] = 0x9;
        assert!(WorkEntry::decode(&buf).is_err());
    }

    #[test]
    fn test_doorbell_round_trip() {
        let db = Doorbell {
            tag: 0x12_3456,
            cmd: 0x1,
            head: 0xbeef,
            sl: 5,
        };
        assert_eq!(Doorbell::decode(db.encode()), db);
    }

    #[test]
    fn test_ownership_bit_flips_each_generation() {
        let depth = 8;
        assert!(ownership_bit(0, depth));
        assert!(ownership_bit(7, depth));
        assert!(!ownership_bit(8, depth));
        assert!(!ownership_bit(15, depth));
        assert!(ownership_bit(16, depth));
    }

    #[test]
    fn test_zeroed_ring_presents_nothing() {
        let ring: WorkRing = RingBuf::new(8);
        for i in 0..8 {
            assert!(ring.consume(i).is_none());
        }
    }

    #[test]
    fn test_publish_consume_across_wraparound() {
        let ring: CompRing = RingBuf::new(4);
        for index in 0..12u64 {
            let e = CompletionEntry {
                status: 0,
                index,
            };
            let mut buf = [0u8; CQE_SIZE];
            e.encode(&mut buf, ownership_bit(index, 4));
            ring.publish(index, &buf);
            // The just-published generation is visible, the next is not.
            let got = ring.consume(index).expect("fresh entry");
            assert_eq!(CompletionEntry::decode(&got).index, index);
            assert!(ring.consume(index + 4).is_none());
        }
    }
}
