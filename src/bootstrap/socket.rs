//! Non-blocking rendezvous socket state machine.
//!
//! Both sides advance through a single `progress()` step so the machine
//! can be driven from a blocking wrapper or interleaved with other work.
//! The accepting side validates the connector's session magic before
//! anything else and goes straight back to accepting on a mismatch, so a
//! stale or foreign connector cannot disturb a rendezvous in progress.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Result, SymraError};

/// Rendezvous connection states. Listener path:
/// `Created → Bound → Listening → Accepting → Accepted → Ready`.
/// Connector path: `Created → Connecting → Connected → Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Created,
    Bound,
    Listening,
    Accepting,
    Accepted,
    Connecting,
    Connected,
    Ready,
    Error,
    Closed,
}

/// Handshake preamble: session magic then a one-byte message type.
const PREAMBLE_LEN: usize = 9;

/// Accepting side of the rendezvous.
pub struct Acceptor {
    state: SocketState,
    bind_addr: SocketAddr,
    expected_magic: u64,
    listener: Option<TcpListener>,
    conn: Option<TcpStream>,
    rx: [u8; PREAMBLE_LEN],
    rx_off: usize,
    peer_type: u8,
}

impl Acceptor {
    pub fn new(bind_addr: SocketAddr, expected_magic: u64) -> Self {
        Self {
            state: SocketState::Created,
            bind_addr,
            expected_magic,
            listener: None,
            conn: None,
            rx: [0; PREAMBLE_LEN],
            rx_off: 0,
            peer_type: 0,
        }
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    /// Address actually bound, available once past `Created`.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.listener {
            Some(l) => Ok(l.local_addr()?),
            None => Err(SymraError::bootstrap("acceptor not bound yet")),
        }
    }

    fn fail(&mut self, err: std::io::Error) -> SymraError {
        self.state = SocketState::Error;
        SymraError::bootstrap_with_source(
            format!("rendezvous accept on {} failed", self.bind_addr),
            err,
        )
    }

    /// Advance the machine by at most one transition. Returns the state
    /// after the step; `WouldBlock` conditions leave the state unchanged.
    pub fn progress(&mut self) -> Result<SocketState> {
        match self.state {
            SocketState::Created => {
                let listener = TcpListener::bind(self.bind_addr).map_err(|e| self.fail(e))?;
                self.listener = Some(listener);
                self.state = SocketState::Bound;
            }
            SocketState::Bound => {
                // bind() already listens for std sockets; this step only
                // switches to non-blocking accepts.
                let listener = self.listener.as_ref().ok_or_else(|| {
                    SymraError::bootstrap("acceptor in Bound state without a listener")
                })?;
                listener.set_nonblocking(true).map_err(|e| self.fail(e))?;
                self.state = SocketState::Listening;
            }
            SocketState::Listening => {
                self.rx_off = 0;
                self.state = SocketState::Accepting;
            }
            SocketState::Accepting => {
                let listener = self.listener.as_ref().ok_or_else(|| {
                    SymraError::bootstrap("acceptor in Accepting state without a listener")
                })?;
                match listener.accept() {
                    Ok((stream, from)) => {
                        debug!(%from, "rendezvous connection accepted");
                        stream.set_nodelay(true).map_err(|e| self.fail(e))?;
                        stream.set_nonblocking(true).map_err(|e| self.fail(e))?;
                        self.conn = Some(stream);
                        self.rx_off = 0;
                        self.state = SocketState::Accepted;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(self.fail(e)),
                }
            }
            SocketState::Accepted => {
                let conn = self.conn.as_mut().ok_or_else(|| {
                    SymraError::bootstrap("acceptor in Accepted state without a connection")
                })?;
                match conn.read(&mut self.rx[self.rx_off..]) {
                    Ok(0) => {
                        // Peer went away mid-handshake; keep listening.
                        self.conn = None;
                        self.state = SocketState::Accepting;
                    }
                    Ok(n) => {
                        self.rx_off += n;
                        if self.rx_off == PREAMBLE_LEN {
                            let magic = u64::from_le_bytes(self.rx[0..8].try_into().unwrap());
                            if magic != self.expected_magic {
                                warn!(
                                    expected = format_args!("{:#018x}", self.expected_magic),
                                    actual = format_args!("{magic:#018x}"),
                                    "rejecting connector with wrong session magic"
                                );
                                self.conn = None;
                                self.rx_off = 0;
                                self.state = SocketState::Accepting;
                            } else {
                                self.peer_type = self.rx[8];
                                self.state = SocketState::Ready;
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(self.fail(e)),
                }
            }
            SocketState::Ready | SocketState::Error | SocketState::Closed => {}
            SocketState::Connecting | SocketState::Connected => {
                return Err(SymraError::bootstrap(
                    "connector states are unreachable on the accepting side",
                ));
            }
        }
        Ok(self.state)
    }

    /// Drive `progress` until a validated connection is ready.
    pub fn wait_ready(&mut self) -> Result<()> {
        loop {
            match self.progress()? {
                SocketState::Ready => return Ok(()),
                SocketState::Accepting | SocketState::Accepted => {
                    std::thread::sleep(Duration::from_micros(50));
                }
                SocketState::Error | SocketState::Closed => {
                    return Err(SymraError::bootstrap(format!(
                        "acceptor unusable: state {:?}",
                        self.state
                    )));
                }
                _ => {}
            }
        }
    }

    /// Hand out the validated connection and re-arm for the next one.
    pub fn take(&mut self) -> Result<(TcpStream, u8)> {
        if self.state != SocketState::Ready {
            return Err(SymraError::bootstrap(format!(
                "acceptor not ready: state {:?}",
                self.state
            )));
        }
        let stream = self.conn.take().ok_or_else(|| {
            SymraError::bootstrap("acceptor ready without a connection")
        })?;
        stream.set_nonblocking(false)?;
        let peer_type = self.peer_type;
        self.rx_off = 0;
        self.state = SocketState::Accepting;
        Ok((stream, peer_type))
    }

    pub fn close(&mut self) {
        self.conn = None;
        self.listener = None;
        self.state = SocketState::Closed;
    }
}

/// Connecting side of the rendezvous.
pub struct Connector {
    state: SocketState,
    addr: SocketAddr,
    magic: u64,
    msg_type: u8,
    stream: Option<TcpStream>,
    refused: u32,
    timedout: u32,
    max_refused: u32,
    max_timedout: u32,
    retry_sleep: Duration,
}

impl Connector {
    pub fn new(
        addr: SocketAddr,
        magic: u64,
        msg_type: u8,
        max_refused: u32,
        max_timedout: u32,
        retry_sleep: Duration,
    ) -> Self {
        Self {
            state: SocketState::Created,
            addr,
            magic,
            msg_type,
            stream: None,
            refused: 0,
            timedout: 0,
            max_refused,
            max_timedout,
            retry_sleep,
        }
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    /// Advance the machine by at most one transition.
    pub fn progress(&mut self) -> Result<SocketState> {
        match self.state {
            SocketState::Created => {
                self.state = SocketState::Connecting;
            }
            SocketState::Connecting => match TcpStream::connect(self.addr) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    self.stream = Some(stream);
                    self.state = SocketState::Connected;
                }
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    self.refused += 1;
                    if self.refused > self.max_refused {
                        self.state = SocketState::Error;
                        return Err(SymraError::RetriesExhausted {
                            addr: self.addr.to_string(),
                            attempts: self.refused,
                            kind: "ECONNREFUSED",
                        });
                    }
                    std::thread::sleep(self.retry_sleep);
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    self.timedout += 1;
                    if self.timedout > self.max_timedout {
                        self.state = SocketState::Error;
                        return Err(SymraError::RetriesExhausted {
                            addr: self.addr.to_string(),
                            attempts: self.timedout,
                            kind: "ETIMEDOUT",
                        });
                    }
                    std::thread::sleep(self.retry_sleep);
                }
                Err(e) => {
                    self.state = SocketState::Error;
                    return Err(SymraError::bootstrap_with_source(
                        format!("connect to {} failed", self.addr),
                        e,
                    ));
                }
            },
            SocketState::Connected => {
                let stream = self.stream.as_mut().ok_or_else(|| {
                    SymraError::bootstrap("connector in Connected state without a stream")
                })?;
                let mut preamble = [0u8; PREAMBLE_LEN];
                preamble[0..8].copy_from_slice(&self.magic.to_le_bytes());
                preamble[8] = self.msg_type;
                if let Err(e) = stream.write_all(&preamble) {
                    self.state = SocketState::Error;
                    return Err(SymraError::bootstrap_with_source(
                        format!("handshake write to {} failed", self.addr),
                        e,
                    ));
                }
                self.state = SocketState::Ready;
            }
            SocketState::Ready | SocketState::Error | SocketState::Closed => {}
            _ => {
                return Err(SymraError::bootstrap(
                    "acceptor states are unreachable on the connecting side",
                ));
            }
        }
        Ok(self.state)
    }

    /// Drive `progress` to `Ready` and hand out the stream.
    pub fn connect(mut self) -> Result<TcpStream> {
        loop {
            if self.progress()? == SocketState::Ready {
                let stream = self.stream.take().ok_or_else(|| {
                    SymraError::bootstrap("connector ready without a stream")
                })?;
                return Ok(stream);
            }
        }
    }
}
