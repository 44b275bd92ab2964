//! Domain model: records, identifiers, sequences, and the error taxonomy.

pub mod chunk;
pub mod clock;
pub mod embedding;
pub mod error;
pub mod event;
pub mod ids;
pub mod lru;
pub mod sanitize;
pub mod seq;
pub mod session;
pub mod stores;
pub mod stream;
pub mod vclock;

pub use chunk::Chunk;
pub use clock::{Clock, ManualTimeSource, Stamp, SystemTimeSource, TimeSource};
pub use embedding::{DimensionMeta, EmbeddingError, EmbeddingRecord};
pub use error::{classify_message, CoreError, ErrorKind};
pub use event::{Event, EventPayload, QuotaSnapshot};
pub use ids::{ChunkId, InvalidSessionId, ReplicaId, SessionId, TxnId};
pub use lru::LruCache;
pub use seq::{Seq0, Seq1, WatermarkError, Watermarks};
pub use session::{
    filter_messages_for_storage, Message, Role, Session, MAX_SAVED_MESSAGES, SESSION_EXPIRY_MS,
};
pub use stores::{IndexName, StoreName};
pub use stream::{Stream, StreamLog, STREAMS_KEY};
pub use vclock::{Causality, VectorClock};
