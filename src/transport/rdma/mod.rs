//! Queue-pair transport: rings, endpoints, posting engine.

pub mod endpoint;
pub mod engine;
pub mod queue;

pub use endpoint::{QpEndpoint, ENDPOINT_SIZE};
pub use engine::{LoopbackNic, NicBackend, PreparedQueuePair, QpShared, QueuePair, TricklingNic};
pub use queue::{CompletionEntry, Doorbell, WorkEntry};
