//! symra: symmetric remote-access communication core.
//!
//! Cooperating processing elements (PEs) expose identically laid-out
//! symmetric heaps and perform one-sided puts/gets, collective barriers
//! and point-to-point signaling across them, over a shared-interconnect
//! fast path or a queue-pair transport. Peer discovery and endpoint
//! exchange happen once, at startup, through a pluggable bootstrap.
//!
//! ```no_run
//! use symra::{Context, Coordinator, SymraConfig};
//!
//! let hub = Coordinator::new(1);
//! let boot = hub.attach(0)?;
//! let ctx = Context::init(SymraConfig::default(), Box::new(boot))?;
//! let flag = ctx.alloc(8, 8)?;
//! ctx.put_u64(flag, 1, 0)?;
//! ctx.barrier_all()?;
//! ctx.finalize()?;
//! # Ok::<(), symra::SymraError>(())
//! ```

pub mod barrier;
pub mod bootstrap;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod heap;
pub mod rma;
pub mod team;
pub mod transport;
pub mod types;

pub use barrier::BarrierEngine;
pub use bootstrap::coordinator::{Coordinator, CoordinatorBootstrap};
pub use bootstrap::uid::SocketBootstrap;
pub use bootstrap::{Bootstrap, SessionId};
pub use config::SymraConfig;
pub use context::Context;
pub use driver::{Driver, HostDriver};
pub use error::{Result, SymraError};
pub use heap::{RemoteAddr, SymmetricHeap};
pub use team::{translate_pe, Team};
pub use transport::rdma::{LoopbackNic, NicBackend, QpEndpoint, QueuePair, TricklingNic};
pub use types::{BarrierAlgorithm, HeapOffset, Pe, RmaOpcode};
