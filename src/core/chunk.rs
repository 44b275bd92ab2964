//! Derived text chunks for semantic retrieval.

use serde::{Deserialize, Serialize};

use super::ids::ChunkId;

/// Text derived from one or more streams, ready for embedding.
///
/// `embedding_ref` points at the `EMBEDDINGS` record once the vector has
/// been computed; chunks without one are pending embedding work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub stream_ids: Vec<u64>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_ref: Option<String>,
}

impl Chunk {
    pub fn new(chunk_id: ChunkId, stream_ids: Vec<u64>, text: impl Into<String>) -> Self {
        Self {
            chunk_id,
            stream_ids,
            text: text.into(),
            embedding_ref: None,
        }
    }

    pub fn covers_stream(&self, stream_id: u64) -> bool {
        self.stream_ids.contains(&stream_id)
    }
}
