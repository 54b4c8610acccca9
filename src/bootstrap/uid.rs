//! Socket bootstrap: rendezvous through a root PE's well-known address.
//!
//! Every PE opens a private listener on an ephemeral port. Non-root PEs
//! dial the root address from the session id, present the session magic,
//! and register `(rank, listener address)`; once all have joined, the root
//! answers each with the full address table. Point-to-point traffic then
//! dials the target's listener directly, with a preamble carrying the
//! session magic and `(source rank, tag, length)` so receivers can match
//! or queue messages that arrive out of order.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::time::Duration;

use tracing::{debug, info};

use super::socket::{Acceptor, Connector, SocketState};
use super::{Bootstrap, SessionId};
use crate::config::SymraConfig;
use crate::error::{Result, SymraError};
use crate::types::Pe;

/// Message type tags exchanged after the magic.
const MSG_JOIN: u8 = 1;
const MSG_P2P: u8 = 3;

const ADDR_BYTES: usize = 19;
const P2P_HEADER: usize = 16;

fn encode_addr(addr: &SocketAddr, buf: &mut [u8; ADDR_BYTES]) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf[0] = 4;
            buf[1..5].copy_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf[0] = 6;
            buf[1..17].copy_from_slice(&ip.octets());
        }
    }
    buf[17..19].copy_from_slice(&addr.port().to_le_bytes());
}

fn decode_addr(buf: &[u8]) -> Result<SocketAddr> {
    let ip = match buf[0] {
        4 => IpAddr::V4(Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4])),
        6 => {
            let octets: [u8; 16] = buf[1..17].try_into().unwrap();
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => {
            return Err(SymraError::bootstrap(format!(
                "unknown address family {other} in peer table"
            )))
        }
    };
    let port = u16::from_le_bytes(buf[17..19].try_into().unwrap());
    Ok(SocketAddr::new(ip, port))
}

pub struct SocketBootstrap {
    pe: Pe,
    npes: u32,
    session: SessionId,
    acceptor: Acceptor,
    peer_addrs: Vec<SocketAddr>,
    /// Messages accepted while waiting for a different `(peer, tag)`.
    unexpected: VecDeque<(Pe, u32, Vec<u8>)>,
    seq: u16,
    max_refused: u32,
    max_timedout: u32,
    retry_sleep: Duration,
}

impl SocketBootstrap {
    /// Join the session described by `session` as rank `pe` of `npes`.
    /// Collective: blocks until every PE has registered with the root.
    pub fn init(session: SessionId, pe: Pe, npes: u32, cfg: &SymraConfig) -> Result<Self> {
        if npes == 0 || pe >= npes {
            return Err(SymraError::InvalidPe { pe, npes });
        }
        // Private listener for point-to-point traffic.
        let mut acceptor = Acceptor::new(
            SocketAddr::new(session.addr.ip(), 0),
            session.magic,
        );
        while acceptor.progress()? != SocketState::Accepting {}
        let my_addr = acceptor.local_addr()?;
        debug!(pe, %my_addr, "bootstrap listener up");

        let peer_addrs = if pe == 0 {
            Self::root_rendezvous(&session, npes, my_addr, cfg)?
        } else {
            Self::join_rendezvous(&session, pe, npes, my_addr, cfg)?
        };
        info!(pe, npes, "socket bootstrap established");

        Ok(Self {
            pe,
            npes,
            session,
            acceptor,
            peer_addrs,
            unexpected: VecDeque::new(),
            seq: 0,
            max_refused: cfg.refused_retries,
            max_timedout: cfg.timedout_retries,
            retry_sleep: cfg.retry_sleep,
        })
    }

    /// Root side: accept every join, then answer each with the table.
    fn root_rendezvous(
        session: &SessionId,
        npes: u32,
        my_addr: SocketAddr,
        _cfg: &SymraConfig,
    ) -> Result<Vec<SocketAddr>> {
        let mut root = Acceptor::new(session.addr, session.magic);
        let mut addrs = vec![my_addr; npes as usize];
        let mut joined: Vec<(Pe, TcpStream)> = Vec::with_capacity(npes as usize - 1);

        while joined.len() + 1 < npes as usize {
            root.wait_ready()?;
            let (mut stream, msg_type) = root.take()?;
            if msg_type != MSG_JOIN {
                debug!(msg_type, "dropping non-join connection during rendezvous");
                continue;
            }
            let mut reg = [0u8; 4 + ADDR_BYTES];
            stream.read_exact(&mut reg)?;
            let rank = u32::from_le_bytes(reg[0..4].try_into().unwrap());
            if rank == 0 || rank >= npes {
                return Err(SymraError::bootstrap(format!(
                    "join from invalid rank {rank} (world size {npes})"
                )));
            }
            addrs[rank as usize] = decode_addr(&reg[4..])?;
            joined.push((rank, stream));
        }

        let mut table = vec![0u8; npes as usize * ADDR_BYTES];
        for (i, addr) in addrs.iter().enumerate() {
            let mut buf = [0u8; ADDR_BYTES];
            encode_addr(addr, &mut buf);
            table[i * ADDR_BYTES..(i + 1) * ADDR_BYTES].copy_from_slice(&buf);
        }
        for (rank, mut stream) in joined {
            stream.write_all(&table)?;
            debug!(rank, "peer table sent");
        }
        root.close();
        Ok(addrs)
    }

    /// Non-root side: register with the root, receive the table.
    fn join_rendezvous(
        session: &SessionId,
        pe: Pe,
        npes: u32,
        my_addr: SocketAddr,
        cfg: &SymraConfig,
    ) -> Result<Vec<SocketAddr>> {
        let connector = Connector::new(
            session.addr,
            session.magic,
            MSG_JOIN,
            cfg.refused_retries,
            cfg.timedout_retries,
            cfg.retry_sleep,
        );
        let mut stream = connector.connect()?;
        let mut reg = [0u8; 4 + ADDR_BYTES];
        reg[0..4].copy_from_slice(&pe.to_le_bytes());
        let mut addr_buf = [0u8; ADDR_BYTES];
        encode_addr(&my_addr, &mut addr_buf);
        reg[4..].copy_from_slice(&addr_buf);
        stream.write_all(&reg)?;

        let mut table = vec![0u8; npes as usize * ADDR_BYTES];
        stream.read_exact(&mut table)?;
        (0..npes as usize)
            .map(|i| decode_addr(&table[i * ADDR_BYTES..(i + 1) * ADDR_BYTES]))
            .collect()
    }
}

impl Bootstrap for SocketBootstrap {
    fn pe(&self) -> Pe {
        self.pe
    }

    fn npes(&self) -> u32 {
        self.npes
    }

    fn next_seq(&mut self) -> u16 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send(&mut self, peer: Pe, tag: u32, buf: &[u8]) -> Result<()> {
        if peer >= self.npes {
            return Err(SymraError::InvalidPe {
                pe: peer,
                npes: self.npes,
            });
        }
        let connector = Connector::new(
            self.peer_addrs[peer as usize],
            self.session.magic,
            MSG_P2P,
            self.max_refused,
            self.max_timedout,
            self.retry_sleep,
        );
        let mut stream = connector.connect()?;
        let mut header = [0u8; P2P_HEADER];
        header[0..4].copy_from_slice(&self.pe.to_le_bytes());
        header[4..8].copy_from_slice(&tag.to_le_bytes());
        header[8..16].copy_from_slice(&(buf.len() as u64).to_le_bytes());
        stream.write_all(&header)?;
        stream.write_all(buf)?;
        Ok(())
    }

    fn recv(&mut self, peer: Pe, tag: u32, buf: &mut [u8]) -> Result<()> {
        if let Some(pos) = self
            .unexpected
            .iter()
            .position(|(p, t, _)| *p == peer && *t == tag)
        {
            let (_, _, payload) = self.unexpected.remove(pos).unwrap();
            if payload.len() != buf.len() {
                return Err(SymraError::bootstrap(format!(
                    "message from {peer} tag {tag:#x}: {} bytes, expected {}",
                    payload.len(),
                    buf.len()
                )));
            }
            buf.copy_from_slice(&payload);
            return Ok(());
        }
        loop {
            self.acceptor.wait_ready()?;
            let (mut stream, msg_type) = self.acceptor.take()?;
            if msg_type != MSG_P2P {
                debug!(msg_type, "ignoring non-p2p connection");
                continue;
            }
            let mut header = [0u8; P2P_HEADER];
            stream.read_exact(&mut header)?;
            let src = u32::from_le_bytes(header[0..4].try_into().unwrap());
            let msg_tag = u32::from_le_bytes(header[4..8].try_into().unwrap());
            let len = u64::from_le_bytes(header[8..16].try_into().unwrap()) as usize;
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload)?;
            if src == peer && msg_tag == tag {
                if len != buf.len() {
                    return Err(SymraError::bootstrap(format!(
                        "message from {peer} tag {tag:#x}: {len} bytes, expected {}",
                        buf.len()
                    )));
                }
                buf.copy_from_slice(&payload);
                return Ok(());
            }
            self.unexpected.push_back((src, msg_tag, payload));
        }
    }

    fn finalize(&mut self) -> Result<()> {
        self.acceptor.close();
        self.unexpected.clear();
        Ok(())
    }

    fn global_exit(&mut self, status: i32) {
        let _ = self.finalize();
        std::process::exit(status);
    }
}
