//! In-memory object-store state: records, indexes, schema version.
//!
//! This is the authoritative working set; durability comes from the WAL
//! and periodic checkpoints. Values are opaque JSON; the store never
//! interprets payloads beyond what its indexes and invariants need.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::embedding::{validate_batch, DimensionMeta, EmbeddingRecord};
use crate::core::error::CoreError;
use crate::core::{Chunk, IndexName, Session, StoreName};

use super::wal::{WalOp, HASH_LEN};

/// Query against a secondary index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexQuery {
    /// Chunks covering a stream.
    StreamId(u64),
    /// Sessions updated inside `[from, to]` milliseconds.
    UpdatedAtRange { from: u64, to: u64 },
}

impl IndexQuery {
    pub fn index(self) -> IndexName {
        match self {
            IndexQuery::StreamId(_) => IndexName::StreamId,
            IndexQuery::UpdatedAtRange { .. } => IndexName::UpdatedAt,
        }
    }
}

type KeysByU64 = BTreeMap<u64, BTreeSet<String>>;

/// Secondary indexes. `None` means the index has not been created by a
/// migration yet; readers fall back to a full scan.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Indexes {
    pub stream_id: Option<KeysByU64>,
    pub updated_at: Option<KeysByU64>,
}

/// The full mutable state captured by checkpoints.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    pub schema_version: u32,
    stores: BTreeMap<StoreName, BTreeMap<String, Value>>,
    pub indexes: Indexes,
    pub dimension: DimensionMeta,
}

impl StoreState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_store(&self, store: StoreName) -> bool {
        self.stores.contains_key(&store)
    }

    pub fn ensure_store(&mut self, store: StoreName) {
        self.stores.entry(store).or_default();
    }

    pub fn get(&self, store: StoreName, key: &str) -> Option<&Value> {
        self.stores.get(&store).and_then(|s| s.get(key))
    }

    pub fn count(&self, store: StoreName) -> usize {
        self.stores.get(&store).map_or(0, BTreeMap::len)
    }

    pub fn keys(&self, store: StoreName) -> Vec<String> {
        self.stores
            .get(&store)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// All values, optionally narrowed through an index.
    ///
    /// A missing index is not an error: readers scan. This is the fallback
    /// contract for stores opened at a pre-index schema version.
    pub fn get_all(&self, store: StoreName, query: Option<IndexQuery>) -> Vec<(String, Value)> {
        let Some(records) = self.stores.get(&store) else {
            return Vec::new();
        };
        match query {
            None => records
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Some(IndexQuery::StreamId(stream_id)) => match &self.indexes.stream_id {
                Some(index) => index
                    .get(&stream_id)
                    .into_iter()
                    .flatten()
                    .filter_map(|key| records.get(key).map(|v| (key.clone(), v.clone())))
                    .collect(),
                None => records
                    .iter()
                    .filter(|(_, value)| {
                        parse_chunk(value).is_some_and(|c| c.covers_stream(stream_id))
                    })
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            },
            Some(IndexQuery::UpdatedAtRange { from, to }) => match &self.indexes.updated_at {
                Some(index) => index
                    .range(from..=to)
                    .flat_map(|(_, keys)| keys.iter())
                    .filter_map(|key| records.get(key).map(|v| (key.clone(), v.clone())))
                    .collect(),
                None => records
                    .iter()
                    .filter(|(_, value)| {
                        parse_session(value)
                            .is_some_and(|s| s.updated_at >= from && s.updated_at <= to)
                    })
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            },
        }
    }

    /// Apply one mutation, maintaining indexes.
    pub fn apply(&mut self, op: WalOp, store: StoreName, key: &str, value: Option<Value>) {
        match op {
            WalOp::Put => {
                let value = value.expect("put carries a value");
                self.unindex(store, key);
                self.index_value(store, key, &value);
                if store == StoreName::Embeddings && self.dimension.dimension.is_none() {
                    if let Some(record) = parse_embedding(&value) {
                        self.dimension = DimensionMeta {
                            dimension: Some(record.vector.len()),
                        };
                    }
                }
                self.stores.entry(store).or_default().insert(key.to_string(), value);
            }
            WalOp::Delete => {
                self.unindex(store, key);
                if let Some(records) = self.stores.get_mut(&store) {
                    records.remove(key);
                }
            }
            WalOp::Clear => {
                if let Some(records) = self.stores.get_mut(&store) {
                    records.clear();
                }
                match store {
                    StoreName::Chunks => {
                        if let Some(index) = self.indexes.stream_id.as_mut() {
                            index.clear();
                        }
                    }
                    StoreName::ChatSessions => {
                        if let Some(index) = self.indexes.updated_at.as_mut() {
                            index.clear();
                        }
                    }
                    StoreName::Embeddings => {
                        self.dimension = DimensionMeta::default();
                    }
                    _ => {}
                }
            }
        }
    }

    /// Dimension check for a batch of embedding puts, against current
    /// metadata. All-or-nothing.
    pub fn validate_embedding_batch(&self, values: &[&Value]) -> Result<DimensionMeta, CoreError> {
        let mut records = Vec::with_capacity(values.len());
        for value in values {
            let record: EmbeddingRecord = serde_json::from_value((*value).clone())
                .map_err(|e| CoreError::validation(format!("malformed embedding record: {e}")))?;
            records.push(record);
        }
        validate_batch(&records, self.dimension).map_err(CoreError::from)
    }

    /// Rebuild the `stream_id` index from current chunks.
    pub fn build_stream_id_index(&mut self) {
        let mut index: KeysByU64 = BTreeMap::new();
        if let Some(records) = self.stores.get(&StoreName::Chunks) {
            for (key, value) in records {
                if let Some(chunk) = parse_chunk(value) {
                    for stream_id in chunk.stream_ids {
                        index.entry(stream_id).or_default().insert(key.clone());
                    }
                }
            }
        }
        self.indexes.stream_id = Some(index);
    }

    /// Rebuild the `updated_at` index from current sessions.
    pub fn build_updated_at_index(&mut self) {
        let mut index: KeysByU64 = BTreeMap::new();
        if let Some(records) = self.stores.get(&StoreName::ChatSessions) {
            for (key, value) in records {
                if let Some(session) = parse_session(value) {
                    index.entry(session.updated_at).or_default().insert(key.clone());
                }
            }
        }
        self.indexes.updated_at = Some(index);
    }

    /// Recompute embedding dimension metadata from stored records.
    pub fn backfill_dimension(&mut self) {
        let dimension = self
            .stores
            .get(&StoreName::Embeddings)
            .and_then(|records| {
                records
                    .values()
                    .filter_map(parse_embedding)
                    .map(|r| r.vector.len())
                    .next()
            });
        self.dimension = DimensionMeta { dimension };
    }

    fn index_value(&mut self, store: StoreName, key: &str, value: &Value) {
        match store {
            StoreName::Chunks => {
                if let Some(index) = self.indexes.stream_id.as_mut() {
                    if let Some(chunk) = parse_chunk(value) {
                        for stream_id in chunk.stream_ids {
                            index.entry(stream_id).or_default().insert(key.to_string());
                        }
                    }
                }
            }
            StoreName::ChatSessions => {
                if let Some(index) = self.indexes.updated_at.as_mut() {
                    if let Some(session) = parse_session(value) {
                        index
                            .entry(session.updated_at)
                            .or_default()
                            .insert(key.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    fn unindex(&mut self, store: StoreName, key: &str) {
        let old = self.stores.get(&store).and_then(|s| s.get(key)).cloned();
        let Some(old) = old else { return };
        match store {
            StoreName::Chunks => {
                if let Some(index) = self.indexes.stream_id.as_mut() {
                    if let Some(chunk) = parse_chunk(&old) {
                        for stream_id in chunk.stream_ids {
                            if let Some(keys) = index.get_mut(&stream_id) {
                                keys.remove(key);
                                if keys.is_empty() {
                                    index.remove(&stream_id);
                                }
                            }
                        }
                    }
                }
            }
            StoreName::ChatSessions => {
                if let Some(index) = self.indexes.updated_at.as_mut() {
                    if let Some(session) = parse_session(&old) {
                        if let Some(keys) = index.get_mut(&session.updated_at) {
                            keys.remove(key);
                            if keys.is_empty() {
                                index.remove(&session.updated_at);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

fn parse_chunk(value: &Value) -> Option<Chunk> {
    serde_json::from_value(value.clone()).ok()
}

fn parse_session(value: &Value) -> Option<Session> {
    serde_json::from_value(value.clone()).ok()
}

fn parse_embedding(value: &Value) -> Option<EmbeddingRecord> {
    serde_json::from_value(value.clone()).ok()
}

/// Checkpoint snapshot: state plus WAL chain position.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: StoreState,
    pub wal_seq: u64,
    pub wal_head: Option<[u8; HASH_LEN]>,
    pub written_at_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChunkId, SessionId};
    use serde_json::json;

    fn chunk_value(id: &str, stream_ids: Vec<u64>) -> Value {
        serde_json::to_value(Chunk::new(ChunkId::new(id), stream_ids, "text")).unwrap()
    }

    #[test]
    fn get_all_uses_index_when_present() {
        let mut state = StoreState::new();
        state.ensure_store(StoreName::Chunks);
        state.build_stream_id_index();

        state.apply(WalOp::Put, StoreName::Chunks, "c1", Some(chunk_value("c1", vec![1, 2])));
        state.apply(WalOp::Put, StoreName::Chunks, "c2", Some(chunk_value("c2", vec![2])));

        let hits = state.get_all(StoreName::Chunks, Some(IndexQuery::StreamId(2)));
        assert_eq!(hits.len(), 2);
        let hits = state.get_all(StoreName::Chunks, Some(IndexQuery::StreamId(1)));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "c1");
    }

    #[test]
    fn get_all_falls_back_to_scan_without_index() {
        let mut state = StoreState::new();
        state.ensure_store(StoreName::Chunks);
        assert!(state.indexes.stream_id.is_none());

        state.apply(WalOp::Put, StoreName::Chunks, "c1", Some(chunk_value("c1", vec![7])));

        let hits = state.get_all(StoreName::Chunks, Some(IndexQuery::StreamId(7)));
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn delete_removes_index_entries() {
        let mut state = StoreState::new();
        state.ensure_store(StoreName::Chunks);
        state.build_stream_id_index();
        state.apply(WalOp::Put, StoreName::Chunks, "c1", Some(chunk_value("c1", vec![1])));

        state.apply(WalOp::Delete, StoreName::Chunks, "c1", None);
        assert!(state
            .get_all(StoreName::Chunks, Some(IndexQuery::StreamId(1)))
            .is_empty());
    }

    #[test]
    fn put_replacing_value_reindexes() {
        let mut state = StoreState::new();
        state.ensure_store(StoreName::Chunks);
        state.build_stream_id_index();
        state.apply(WalOp::Put, StoreName::Chunks, "c1", Some(chunk_value("c1", vec![1])));
        state.apply(WalOp::Put, StoreName::Chunks, "c1", Some(chunk_value("c1", vec![2])));

        assert!(state
            .get_all(StoreName::Chunks, Some(IndexQuery::StreamId(1)))
            .is_empty());
        assert_eq!(
            state
                .get_all(StoreName::Chunks, Some(IndexQuery::StreamId(2)))
                .len(),
            1
        );
    }

    #[test]
    fn updated_at_range_query() {
        let mut state = StoreState::new();
        state.ensure_store(StoreName::ChatSessions);
        state.build_updated_at_index();

        for (key, ts) in [("session-a", 100u64), ("session-b", 200), ("session-c", 300)] {
            let id = SessionId::parse(key).unwrap();
            let mut session = Session::new(id, "t", ts);
            session.updated_at = ts;
            state.apply(
                WalOp::Put,
                StoreName::ChatSessions,
                key,
                Some(serde_json::to_value(&session).unwrap()),
            );
        }

        let hits = state.get_all(
            StoreName::ChatSessions,
            Some(IndexQuery::UpdatedAtRange { from: 150, to: 250 }),
        );
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "session-b");
    }

    #[test]
    fn first_embedding_put_fixes_store_dimension() {
        let mut state = StoreState::new();
        state.ensure_store(StoreName::Embeddings);

        let record = crate::core::EmbeddingRecord {
            id: "a".to_string(),
            vector: vec![0.0; 3],
            payload: Value::Null,
            created_at: 0,
        };
        state.apply(
            WalOp::Put,
            StoreName::Embeddings,
            "a",
            Some(serde_json::to_value(&record).unwrap()),
        );
        assert_eq!(state.dimension.dimension, Some(3));

        // A later batch with a different dimension is rejected whole.
        let wrong = crate::core::EmbeddingRecord {
            id: "b".to_string(),
            vector: vec![0.0; 4],
            payload: Value::Null,
            created_at: 0,
        };
        let value = serde_json::to_value(&wrong).unwrap();
        assert!(state.validate_embedding_batch(&[&value]).is_err());
    }

    #[test]
    fn clear_resets_dimension_metadata() {
        let mut state = StoreState::new();
        state.ensure_store(StoreName::Embeddings);
        state.dimension = DimensionMeta { dimension: Some(3) };
        state.apply(WalOp::Clear, StoreName::Embeddings, "", None);
        assert_eq!(state.dimension, DimensionMeta::default());
    }

    #[test]
    fn snapshot_roundtrips_through_json() {
        let mut state = StoreState::new();
        state.ensure_store(StoreName::Streams);
        state.apply(
            WalOp::Put,
            StoreName::Streams,
            "all",
            Some(json!({"streams": []})),
        );
        let snapshot = Snapshot {
            state: state.clone(),
            wal_seq: 5,
            wal_head: Some([9u8; HASH_LEN]),
            written_at_ms: 1,
        };
        let bytes = serde_json::to_vec(&snapshot).unwrap();
        let back: Snapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.state, state);
        assert_eq!(back.wal_seq, 5);
    }
}
