//! Listening-history streams.
//!
//! Streams are immutable once recorded and kept in insertion order. The
//! whole log lives under the keyed singleton `"all"` in the `STREAMS` store
//! and is bulk-cleared on user reset.

use serde::{Deserialize, Serialize};

/// One listening-history record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    /// ISO date of the play.
    pub ts: String,
    pub track: String,
    pub artist: String,
    pub ms_played: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// The singleton stream log.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamLog {
    pub streams: Vec<Stream>,
}

/// Store key for the singleton log.
pub const STREAMS_KEY: &str = "all";

impl StreamLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, stream: Stream) {
        self.streams.push(stream);
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Cheap change fingerprint: `"{count}-{first_ts}-{last_ts}"`.
    ///
    /// Derived data (chunks, patterns) is recomputed only when this hash
    /// moves. An empty log hashes to `"0"`.
    pub fn streams_hash(&self) -> String {
        match (self.streams.first(), self.streams.last()) {
            (Some(first), Some(last)) => {
                format!("{}-{}-{}", self.streams.len(), first.ts, last.ts)
            }
            _ => "0".to_string(),
        }
    }
}
