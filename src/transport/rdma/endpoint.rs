//! Queue-pair endpoint descriptors exchanged during connection setup.

use crate::error::{Result, SymraError};

/// Endpoint data exchanged between peers to complete a queue-pair
/// handshake: queue number, the exporter's heap base in the engine's
/// address space, and the remote key granting one-sided access to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpEndpoint {
    pub qp_num: u32,
    pub heap_base: u64,
    pub heap_rkey: u32,
}

pub const ENDPOINT_SIZE: usize = 16;

impl QpEndpoint {
    pub fn to_bytes(&self) -> [u8; ENDPOINT_SIZE] {
        let mut buf = [0u8; ENDPOINT_SIZE];
        buf[0..4].copy_from_slice(&self.qp_num.to_le_bytes());
        buf[4..12].copy_from_slice(&self.heap_base.to_le_bytes());
        buf[12..16].copy_from_slice(&self.heap_rkey.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != ENDPOINT_SIZE {
            return Err(SymraError::transport(format!(
                "endpoint descriptor must be {ENDPOINT_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        Ok(Self {
            qp_num: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            heap_base: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            heap_rkey: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}
