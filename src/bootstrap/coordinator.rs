//! In-process coordinator bootstrap.
//!
//! All PEs of a single-host run (and of the test suite) attach to one
//! shared hub; messages move through per-`(src, dst, tag)` FIFO queues
//! under a mutex. Semantics match the socket bootstrap exactly: buffered
//! sends, FIFO matching per sender and tag.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;

use super::Bootstrap;
use crate::error::{Result, SymraError};
use crate::types::Pe;

struct Hub {
    queues: HashMap<(Pe, Pe, u32), VecDeque<Vec<u8>>>,
    /// Set by `global_exit`; wakes every blocked receiver with an error.
    aborted: Option<i32>,
}

/// Shared rendezvous hub for one in-process job.
pub struct Coordinator {
    npes: u32,
    hub: Mutex<Hub>,
    cv: Condvar,
}

impl Coordinator {
    pub fn new(npes: u32) -> Arc<Self> {
        Arc::new(Self {
            npes,
            hub: Mutex::new(Hub {
                queues: HashMap::new(),
                aborted: None,
            }),
            cv: Condvar::new(),
        })
    }

    /// Handle for rank `pe`.
    pub fn attach(self: &Arc<Self>, pe: Pe) -> Result<CoordinatorBootstrap> {
        if pe >= self.npes {
            return Err(SymraError::InvalidPe {
                pe,
                npes: self.npes,
            });
        }
        Ok(CoordinatorBootstrap {
            pe,
            coordinator: Arc::clone(self),
            seq: 0,
        })
    }
}

pub struct CoordinatorBootstrap {
    pe: Pe,
    coordinator: Arc<Coordinator>,
    seq: u16,
}

impl Bootstrap for CoordinatorBootstrap {
    fn pe(&self) -> Pe {
        self.pe
    }

    fn npes(&self) -> u32 {
        self.coordinator.npes
    }

    fn next_seq(&mut self) -> u16 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send(&mut self, peer: Pe, tag: u32, buf: &[u8]) -> Result<()> {
        if peer >= self.coordinator.npes {
            return Err(SymraError::InvalidPe {
                pe: peer,
                npes: self.coordinator.npes,
            });
        }
        let mut hub = self
            .coordinator
            .hub
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(status) = hub.aborted {
            return Err(SymraError::bootstrap(format!(
                "job aborted with status {status}"
            )));
        }
        hub.queues
            .entry((self.pe, peer, tag))
            .or_default()
            .push_back(buf.to_vec());
        self.coordinator.cv.notify_all();
        Ok(())
    }

    fn recv(&mut self, peer: Pe, tag: u32, buf: &mut [u8]) -> Result<()> {
        let mut hub = self
            .coordinator
            .hub
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(status) = hub.aborted {
                return Err(SymraError::bootstrap(format!(
                    "job aborted with status {status}"
                )));
            }
            if let Some(queue) = hub.queues.get_mut(&(peer, self.pe, tag)) {
                if let Some(payload) = queue.pop_front() {
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
            }
            hub = self
                .coordinator
                .cv
                .wait(hub)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    fn global_exit(&mut self, status: i32) {
        debug!(pe = self.pe, status, "global exit requested");
        let mut hub = self
            .coordinator
            .hub
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        hub.aborted = Some(status);
        self.coordinator.cv.notify_all();
    }
}
