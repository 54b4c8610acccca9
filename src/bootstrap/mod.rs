//! Out-of-band rendezvous used once at startup.
//!
//! Everything here runs strictly before the data plane is live. The
//! [`Bootstrap`] trait needs only tagged point-to-point send/recv from an
//! implementation; the collectives (ring allgather, dissemination barrier,
//! pairwise alltoall) are built on top of those and shared by every
//! implementation.

pub mod coordinator;
pub mod socket;
pub mod uid;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Result, SymraError};
use crate::types::{Pe, PROTOCOL_VERSION};

/// Tag namespace reserved for the built-in collectives; user tags must
/// stay below this.
const COLLECTIVE_TAG: u32 = 0x8000_0000;
const OP_ALLGATHER: u32 = 1;
const OP_BARRIER: u32 = 2;
const OP_ALLTOALL: u32 = 3;

fn collective_tag(op: u32, seq: u16, round: u32) -> u32 {
    debug_assert!(round < 256);
    COLLECTIVE_TAG | (op << 24) | ((seq as u32) << 8) | round
}

/// One-time control channel for rank discovery and metadata exchange.
pub trait Bootstrap: Send {
    fn pe(&self) -> Pe;
    fn npes(&self) -> u32;

    /// Tagged point-to-point send. Buffered: returns once the message is
    /// handed off, never waits for the receiver.
    fn send(&mut self, peer: Pe, tag: u32, buf: &[u8]) -> Result<()>;

    /// Tagged point-to-point receive, matching on `(peer, tag)` in FIFO
    /// order per sender.
    fn recv(&mut self, peer: Pe, tag: u32, buf: &mut [u8]) -> Result<()>;

    /// Rolling sequence number separating successive collective calls.
    fn next_seq(&mut self) -> u16;

    /// Gather `send` from every PE into `recv`, ordered by rank.
    ///
    /// Ring algorithm: each of the `n-1` steps forwards the slice received
    /// in the previous step to the ring successor.
    fn allgather(&mut self, send: &[u8], recv: &mut [u8]) -> Result<()> {
        let (pe, npes) = (self.pe() as usize, self.npes() as usize);
        let chunk = send.len();
        if recv.len() != chunk * npes {
            return Err(SymraError::InvalidParameter(format!(
                "allgather recv of {} bytes for {} chunks of {}",
                recv.len(),
                npes,
                chunk
            )));
        }
        recv[pe * chunk..(pe + 1) * chunk].copy_from_slice(send);
        if npes == 1 {
            return Ok(());
        }
        let seq = self.next_seq();
        let next = ((pe + 1) % npes) as Pe;
        let prev = ((pe + npes - 1) % npes) as Pe;
        for step in 0..npes - 1 {
            let send_slice = (pe + npes - step) % npes;
            let recv_slice = (pe + npes - step - 1) % npes;
            let tag = collective_tag(OP_ALLGATHER, seq, (step % 256) as u32);
            let out = recv[send_slice * chunk..(send_slice + 1) * chunk].to_vec();
            self.send(next, tag, &out)?;
            let mut incoming = vec![0u8; chunk];
            self.recv(prev, tag, &mut incoming)?;
            recv[recv_slice * chunk..(recv_slice + 1) * chunk].copy_from_slice(&incoming);
        }
        Ok(())
    }

    /// Personalized exchange: `send` and `recv` hold one `chunk` per PE.
    fn alltoall(&mut self, send: &[u8], recv: &mut [u8]) -> Result<()> {
        let (pe, npes) = (self.pe() as usize, self.npes() as usize);
        if send.len() != recv.len() || send.len() % npes != 0 {
            return Err(SymraError::InvalidParameter(format!(
                "alltoall buffers of {} / {} bytes for {} PEs",
                send.len(),
                recv.len(),
                npes
            )));
        }
        let chunk = send.len() / npes;
        let seq = self.next_seq();
        let tag = collective_tag(OP_ALLTOALL, seq, 0);
        recv[pe * chunk..(pe + 1) * chunk]
            .copy_from_slice(&send[pe * chunk..(pe + 1) * chunk]);
        // Sends are buffered, so pushing everything out before receiving
        // anything cannot deadlock.
        for peer in 0..npes {
            if peer != pe {
                self.send(peer as Pe, tag, &send[peer * chunk..(peer + 1) * chunk])?;
            }
        }
        for peer in 0..npes {
            if peer != pe {
                let mut incoming = vec![0u8; chunk];
                self.recv(peer as Pe, tag, &mut incoming)?;
                recv[peer * chunk..(peer + 1) * chunk].copy_from_slice(&incoming);
            }
        }
        Ok(())
    }

    /// Dissemination barrier over tagged messages.
    fn barrier(&mut self) -> Result<()> {
        let (pe, npes) = (self.pe() as usize, self.npes() as usize);
        if npes == 1 {
            return Ok(());
        }
        let seq = self.next_seq();
        let mut shift = 1usize;
        let mut round = 0u32;
        while shift < npes {
            let tag = collective_tag(OP_BARRIER, seq, round);
            let to = ((pe + shift) % npes) as Pe;
            let from = ((pe + npes - shift) % npes) as Pe;
            self.send(to, tag, &[1])?;
            let mut byte = [0u8; 1];
            self.recv(from, tag, &mut byte)?;
            shift *= 2;
            round += 1;
        }
        Ok(())
    }

    /// Tear down the control channel. The data plane stays untouched.
    fn finalize(&mut self) -> Result<()>;

    /// Last-resort abort propagated to the whole job.
    fn global_exit(&mut self, status: i32);
}

/// Opaque rendezvous value produced by the root PE and distributed
/// out-of-band: protocol version, root listen address, session magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId {
    pub version: u16,
    pub addr: SocketAddr,
    pub magic: u64,
}

pub const SESSION_ID_SIZE: usize = 32;

impl SessionId {
    /// Mint a fresh session id for a root listening at `addr`.
    pub fn generate(addr: SocketAddr) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            addr,
            magic: rand::random::<u64>(),
        }
    }

    pub fn to_bytes(&self) -> [u8; SESSION_ID_SIZE] {
        let mut buf = [0u8; SESSION_ID_SIZE];
        buf[0..2].copy_from_slice(&self.version.to_le_bytes());
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                buf[2] = 4;
                buf[3..7].copy_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf[2] = 6;
                buf[3..19].copy_from_slice(&ip.octets());
            }
        }
        buf[19..21].copy_from_slice(&self.addr.port().to_le_bytes());
        buf[21..29].copy_from_slice(&self.magic.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != SESSION_ID_SIZE {
            return Err(SymraError::bootstrap(format!(
                "session id must be {SESSION_ID_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        let version = u16::from_le_bytes(buf[0..2].try_into().unwrap());
        if version != PROTOCOL_VERSION {
            return Err(SymraError::bootstrap(format!(
                "session id version {version}, this build speaks {PROTOCOL_VERSION}"
            )));
        }
        let ip = match buf[2] {
            4 => IpAddr::V4(Ipv4Addr::new(buf[3], buf[4], buf[5], buf[6])),
            6 => {
                let octets: [u8; 16] = buf[3..19].try_into().unwrap();
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => {
                return Err(SymraError::bootstrap(format!(
                    "unknown address family {other} in session id"
                )))
            }
        };
        let port = u16::from_le_bytes(buf[19..21].try_into().unwrap());
        let magic = u64::from_le_bytes(buf[21..29].try_into().unwrap());
        Ok(Self {
            version,
            addr: SocketAddr::new(ip, port),
            magic,
        })
    }
}
