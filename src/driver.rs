//! Memory-mapping capability behind the symmetric heap.
//!
//! The core only needs one guarantee from the platform: a region, once
//! mapped, stays at the same address for the process lifetime. Accelerator
//! runtimes plug in behind [`Driver`]; [`HostDriver`] serves host memory.

use std::alloc::{alloc_zeroed, dealloc, Layout};

use crate::error::{Result, SymraError};

/// A mapped region handed out by a [`Driver`].
#[derive(Debug)]
pub struct Mapping {
    base: *mut u8,
    len: usize,
    layout: Layout,
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Reserve and release stable memory regions.
pub trait Driver: Send + Sync {
    /// Map `len` zeroed bytes at a stable address, aligned to `align`.
    fn map(&self, len: usize, align: usize) -> Result<Mapping>;

    /// Release a mapping produced by this driver.
    fn unmap(&self, mapping: Mapping);
}

/// Host-memory driver over the global allocator.
#[derive(Debug, Default)]
pub struct HostDriver;

impl Driver for HostDriver {
    fn map(&self, len: usize, align: usize) -> Result<Mapping> {
        let layout = Layout::from_size_align(len, align).map_err(|e| {
            SymraError::AllocationFailed {
                requested: len,
                reason: e.to_string(),
            }
        })?;
        // Zeroed so signal slots start at round 0 without an extra pass.
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            return Err(SymraError::AllocationFailed {
                requested: len,
                reason: "allocator returned null".into(),
            });
        }
        Ok(Mapping { base, len, layout })
    }

    fn unmap(&self, mapping: Mapping) {
        unsafe { dealloc(mapping.base, mapping.layout) };
    }
}
