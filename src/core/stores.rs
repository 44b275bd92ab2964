//! Named object stores and their indexes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Every object store in the database.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreName {
    Streams,
    Chunks,
    ChatSessions,
    Embeddings,
    Artifacts,
    Personality,
    Settings,
    Wal,
    EventLog,
}

impl StoreName {
    pub const ALL: &'static [StoreName] = &[
        StoreName::Streams,
        StoreName::Chunks,
        StoreName::ChatSessions,
        StoreName::Embeddings,
        StoreName::Artifacts,
        StoreName::Personality,
        StoreName::Settings,
        StoreName::Wal,
        StoreName::EventLog,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StoreName::Streams => "STREAMS",
            StoreName::Chunks => "CHUNKS",
            StoreName::ChatSessions => "CHAT_SESSIONS",
            StoreName::Embeddings => "EMBEDDINGS",
            StoreName::Artifacts => "ARTIFACTS",
            StoreName::Personality => "PERSONALITY",
            StoreName::Settings => "SETTINGS",
            StoreName::Wal => "WAL",
            StoreName::EventLog => "EVENT_LOG",
        }
    }

    /// Internal stores are bookkeeping: they never take user writes through
    /// the public mutation path and their mutations are not themselves
    /// WAL-logged.
    pub fn is_internal(self) -> bool {
        matches!(self, StoreName::Wal | StoreName::EventLog)
    }
}

impl fmt::Display for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Secondary indexes, created by migrations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexName {
    /// `CHUNKS` by covered stream id.
    StreamId,
    /// `CHAT_SESSIONS` by last-update time.
    UpdatedAt,
}

impl IndexName {
    pub fn store(self) -> StoreName {
        match self {
            IndexName::StreamId => StoreName::Chunks,
            IndexName::UpdatedAt => StoreName::ChatSessions,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IndexName::StreamId => "stream_id",
            IndexName::UpdatedAt => "updated_at",
        }
    }
}

impl fmt::Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
