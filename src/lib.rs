#![forbid(unsafe_code)]

//! Echovault: the client-side durability and coordination core of a
//! local-first application.
//!
//! Four subsystems, tightly coupled:
//! - [`store`]: versioned object stores with a signed, hash-chained WAL,
//!   migrations, and quota-aware degradation
//! - [`coord`]: leader-elected replica coordination over a broadcast hub,
//!   with watermark-driven replay and advisory locks
//! - [`sched`]: a priority serializer with circuit breakers, classified
//!   retries, and structured cancellation
//! - [`pool`]: restartable compute workers running pattern detection and
//!   shared-memory cosine search

pub mod config;
pub mod context;
pub mod coord;
pub mod core;
pub mod crypto;
pub mod error;
pub mod eventlog;
pub mod pool;
pub mod sched;
pub mod store;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types hosts touch most.
pub use crate::config::{Config, Limits};
pub use crate::context::{Core, CoreContext};
pub use crate::core::{
    Chunk, ChunkId, Clock, CoreError, EmbeddingRecord, ErrorKind, Event, EventPayload,
    ManualTimeSource, Message, QuotaSnapshot, ReplicaId, Role as MessageRole, Seq0, Seq1, Session,
    SessionId, Stamp, StoreName, Stream, StreamLog, SystemTimeSource, TimeSource,
};
pub use crate::crypto::KeyManager;
pub use crate::eventlog::{EventBus, EventLog, EventSink};
pub use crate::sched::{CancellationToken, OpScheduler, Priority, RetryPolicy, SubmitOptions};
pub use crate::store::{DurableStore, TxnMode};
