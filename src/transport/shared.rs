//! Shared-interconnect path: the peer's heap is directly addressable, so
//! puts and gets are plain copies and signals are single atomic stores.
//!
//! All unsafe pointer work is confined here; addresses come exclusively
//! from symmetric-heap translation.

use std::sync::atomic::{fence, AtomicU64, Ordering};

use crate::heap::RemoteAddr;

/// Byte copy into a directly addressable peer heap. Release-fenced so a
/// subsequent signal store publishes the data.
pub fn put_bytes(dst: RemoteAddr, src: &[u8]) {
    unsafe {
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst.0 as *mut u8, src.len());
    }
    fence(Ordering::Release);
}

/// Byte copy out of a directly addressable peer heap.
pub fn get_bytes(dst: &mut [u8], src: RemoteAddr) {
    fence(Ordering::Acquire);
    unsafe {
        std::ptr::copy_nonoverlapping(src.0 as *const u8, dst.as_mut_ptr(), dst.len());
    }
}

/// Release-store a signal word at a peer slot.
#[inline]
pub fn store_u64(dst: RemoteAddr, value: u64) {
    debug_assert_eq!(dst.0 % 8, 0);
    let slot = unsafe { &*(dst.0 as *const AtomicU64) };
    slot.store(value, Ordering::Release);
}

/// Acquire-load a signal word from a peer slot.
#[inline]
pub fn load_u64(src: RemoteAddr) -> u64 {
    debug_assert_eq!(src.0 % 8, 0);
    let slot = unsafe { &*(src.0 as *const AtomicU64) };
    slot.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_round_trip() {
        let mut cell = [0u8; 64];
        let addr = RemoteAddr(cell.as_mut_ptr() as usize);
        put_bytes(addr, &[1, 2, 3, 4]);
        let mut out = [0u8; 4];
        get_bytes(&mut out, addr);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_signal_store_load() {
        let cell = AtomicU64::new(0);
        let addr = RemoteAddr(&cell as *const AtomicU64 as usize);
        store_u64(addr, 41);
        assert_eq!(load_u64(addr), 41);
    }
}
