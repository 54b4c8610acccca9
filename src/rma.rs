//! Byte-granularity one-sided operations over the per-peer channels.
//!
//! Every address is a symmetric-heap offset; the channel established at
//! init decides whether it becomes a direct copy or a queue-pair posting.
//! Typed wrappers layer above these without further translation logic.

use std::time::Instant;

use crate::context::Context;
use crate::error::{Result, SymraError};
use crate::transport::{shared, PeerChannel};
use crate::types::{HeapOffset, Pe};

impl Context {
    fn check_span(&self, offset: HeapOffset, len: usize) -> Result<()> {
        let end = offset
            .0
            .checked_add(len)
            .ok_or(SymraError::OutOfRange {
                offset: offset.0,
                heap_size: self.heap().size(),
            })?;
        if end > self.heap().size() {
            return Err(SymraError::OutOfRange {
                offset: offset.0,
                heap_size: self.heap().size(),
            });
        }
        Ok(())
    }

    fn channel(&self, pe: Pe) -> Result<&PeerChannel> {
        self.channels()
            .get(pe as usize)
            .ok_or(SymraError::InvalidPe {
                pe,
                npes: self.npes(),
            })
    }

    /// Write `src` into `pe`'s heap at `dst`. On the network path the
    /// transfer is acknowledged before this returns, so the source buffer
    /// may be reused immediately.
    pub fn put_bytes(&self, dst: HeapOffset, src: &[u8], pe: Pe) -> Result<()> {
        self.check_span(dst, src.len())?;
        match self.channel(pe)? {
            PeerChannel::Shared => {
                shared::put_bytes(self.heap().translate(dst, pe)?, src);
                Ok(())
            }
            PeerChannel::Rdma(ch) => {
                ch.put(self.heap().translate_rdma(dst, pe)?, src.as_ptr(), src.len())?;
                ch.quiet()
            }
        }
    }

    /// Read `dst.len()` bytes from `pe`'s heap at `src`.
    pub fn get_bytes(&self, dst: &mut [u8], src: HeapOffset, pe: Pe) -> Result<()> {
        self.check_span(src, dst.len())?;
        match self.channel(pe)? {
            PeerChannel::Shared => {
                shared::get_bytes(dst, self.heap().translate(src, pe)?);
                Ok(())
            }
            PeerChannel::Rdma(ch) => {
                ch.get(dst.as_mut_ptr(), self.heap().translate_rdma(src, pe)?, dst.len())
            }
        }
    }

    /// Write one word into `pe`'s heap, release-ordered, usable as a
    /// completion flag for preceding puts to the same peer.
    pub fn put_u64(&self, dst: HeapOffset, value: u64, pe: Pe) -> Result<()> {
        self.check_span(dst, 8)?;
        match self.channel(pe)? {
            PeerChannel::Shared => {
                shared::store_u64(self.heap().translate(dst, pe)?, value);
                Ok(())
            }
            PeerChannel::Rdma(ch) => ch.signal(self.heap().translate_rdma(dst, pe)?, value),
        }
    }

    /// Read one word from `pe`'s heap, acquire-ordered.
    pub fn get_u64(&self, src: HeapOffset, pe: Pe) -> Result<u64> {
        self.check_span(src, 8)?;
        match self.channel(pe)? {
            PeerChannel::Shared => Ok(shared::load_u64(self.heap().translate(src, pe)?)),
            PeerChannel::Rdma(ch) => ch.read_u64(self.heap().translate_rdma(src, pe)?),
        }
    }

    /// Block until all operations posted to `pe` are acknowledged. A
    /// no-op for shared-path peers, whose operations complete inline.
    pub fn quiet(&self, pe: Pe) -> Result<()> {
        self.quiet_deadline(pe, None)
    }

    /// `quiet` with an optional deadline checked outside the hot spin.
    pub fn quiet_deadline(&self, pe: Pe, deadline: Option<Instant>) -> Result<()> {
        match self.channel(pe)? {
            PeerChannel::Shared => Ok(()),
            PeerChannel::Rdma(ch) => ch.quiet_deadline(deadline),
        }
    }

    /// Quiet toward every peer.
    pub fn quiet_all(&self) -> Result<()> {
        for pe in 0..self.npes() {
            self.quiet(pe)?;
        }
        Ok(())
    }
}
